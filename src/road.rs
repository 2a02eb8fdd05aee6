use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use petgraph::Direction::Outgoing;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::Handling;
use crate::dispatch::{Args, Flow};
use crate::error::{FlowError, FlowResult};
use crate::registry::ActionHandler;
use crate::station::{KeepData, Sign, Station, StationCore};
use crate::step::StepStore;

/// Object-safe view of a [`Station`], so a road can hold stations of
/// different types.
pub trait StationNode: Send + Sync {
    fn name(&self) -> &str;
    fn has_action(&self, action: &str) -> bool;
    fn fire(&mut self, action: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>>;
    fn keep(&self) -> FlowResult<KeepData>;
    fn revert(&mut self, data: KeepData) -> FlowResult<()>;
}

impl<S: Station> StationNode for S {
    fn name(&self) -> &str {
        self.core().name()
    }

    fn has_action(&self, action: &str) -> bool {
        S::actions().contains(self.core().resolve_action(action))
    }

    fn fire(&mut self, action: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        self.fire_action(action, args, cx)
    }

    fn keep(&self) -> FlowResult<KeepData> {
        self.keep_data()
    }

    fn revert(&mut self, data: KeepData) -> FlowResult<()> {
        self.revert_data(data)
    }
}

type StationFactory = Box<dyn Fn(Arc<Road>) -> Box<dyn StationNode> + Send + Sync>;

/// One station left behind on a journey, with the keep-fields it had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Waypoint {
    pub station: String,
    pub kept: KeepData,
}

/// A conversation's position on a road.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Journey {
    pub road: String,
    pub current: Option<String>,
    #[serde(default)]
    pub history: Vec<Waypoint>,
}

impl Journey {
    pub fn new(road: &str) -> Self {
        Self {
            road: road.to_string(),
            current: None,
            history: Vec::new(),
        }
    }

    pub fn key(road: &str) -> String {
        format!("journey:{}", road)
    }

    pub fn load(road: &str, step: &dyn StepStore) -> FlowResult<Self> {
        match step.recall(&Self::key(road)) {
            Some(saved) => Ok(serde_json::from_value(saved)?),
            None => Ok(Self::new(road)),
        }
    }

    pub fn save(&self, step: &dyn StepStore) -> FlowResult<()> {
        step.remember(&Self::key(&self.road), serde_json::to_value(self)?);
        Ok(())
    }
}

/// A directed graph of stations sharing one sign.
///
/// Registered in the [`Registry`](crate::registry::Registry) under its name;
/// station actions are then addressable as `"<station>.<action>"`, and the
/// road itself answers `"start"` and `"back"`.
pub struct Road {
    me: Weak<Road>,
    name: String,
    sign: Arc<dyn Sign>,
    start: String,
    graph: StableDiGraph<String, ()>,
    index_of: HashMap<String, NodeIndex>,
    factories: HashMap<String, StationFactory>,
}

impl fmt::Debug for Road {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stations: Vec<&String> = self.index_of.keys().collect();
        stations.sort();
        f.debug_struct("Road")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("stations", &stations)
            .finish()
    }
}

impl Road {
    pub fn builder(name: &str, sign: Arc<dyn Sign>) -> RoadBuilder {
        RoadBuilder::new(name, sign)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sign(&self) -> Arc<dyn Sign> {
        self.sign.clone()
    }

    pub fn start_station(&self) -> &str {
        &self.start
    }

    pub fn has_station(&self, station: &str) -> bool {
        self.index_of.contains_key(station)
    }

    pub fn routes_from(&self, station: &str) -> Vec<String> {
        let Some(&ix) = self.index_of.get(station) else {
            return Vec::new();
        };
        let mut routes: Vec<String> = self
            .graph
            .neighbors_directed(ix, Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        routes.sort();
        routes
    }

    pub fn has_route(&self, from: &str, to: &str) -> bool {
        match (self.index_of.get(from), self.index_of.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    fn handle(&self) -> FlowResult<Arc<Road>> {
        self.me
            .upgrade()
            .ok_or_else(|| FlowError::handler(format!("road `{}` is no longer alive", self.name)))
    }

    /// Build a fresh instance of `station`.
    pub fn station(&self, station: &str) -> FlowResult<Box<dyn StationNode>> {
        let factory = self.factories.get(station).ok_or_else(|| FlowError::UnknownStation {
            road: self.name.clone(),
            station: station.to_string(),
        })?;
        Ok(factory(self.handle()?))
    }

    /// Reset the journey and fire `"main"` on the start station.
    pub fn start(&self, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let mut station = self.station(&self.start)?;
        let mut journey = Journey::new(&self.name);
        journey.current = Some(self.start.clone());
        journey.save(cx.step())?;
        info!(road = %self.name, station = %self.start, "journey started");
        station.fire("main", args, cx)
    }

    /// Move to `target`, keeping a freshly built copy of the station being left.
    pub fn enter(&self, target: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        self.enter_from(None, target, args, cx)
    }

    /// Move to `target`. `leaving` is the live keep snapshot of the current
    /// station; without it the station is rebuilt and its initial values kept.
    ///
    /// A journey that has not started may enter any station.
    pub fn enter_from(&self, leaving: Option<KeepData>, target: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let mut station = self.station(target)?;
        let mut journey = Journey::load(&self.name, cx.step())?;

        // 1) validate the edge before touching the journey
        if let Some(from) = journey.current.clone() {
            if !self.has_route(&from, target) {
                return Err(FlowError::NoRoute {
                    road: self.name.clone(),
                    from,
                    to: target.to_string(),
                });
            }
            // 2) snapshot what we leave behind
            let kept = match leaving {
                Some(kept) => kept,
                None => self.station(&from)?.keep()?,
            };
            journey.history.push(Waypoint { station: from, kept });
        }

        // 3) move and fire
        journey.current = Some(target.to_string());
        journey.save(cx.step())?;
        debug!(road = %self.name, station = %target, depth = journey.history.len(), "entered station");
        station.fire("main", args, cx)
    }

    /// Return to the previous station, restore its keep-fields and fire `"revert"`.
    pub fn back(&self, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let mut journey = Journey::load(&self.name, cx.step())?;
        let waypoint = journey
            .history
            .pop()
            .ok_or_else(|| FlowError::EmptyJourney(self.name.clone()))?;

        let mut station = self.station(&waypoint.station)?;
        station.revert(waypoint.kept)?;

        journey.current = Some(waypoint.station.clone());
        journey.save(cx.step())?;
        debug!(road = %self.name, station = %waypoint.station, "went back");
        station.fire("revert", args, cx)
    }

    /// Drop the conversation's journey on this road.
    pub fn finish(&self, cx: &Handling<'_>) {
        cx.step().forget(&Journey::key(&self.name));
        info!(road = %self.name, "journey finished");
    }
}

impl ActionHandler for Road {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn has_method(&self, method: &str) -> bool {
        match method {
            "start" | "back" => true,
            _ => match method.split_once('.') {
                Some((station, action)) => self.station(station).is_ok_and(|s| s.has_action(action)),
                None => false,
            },
        }
    }

    /// `state`, when present, is the keep snapshot restored before the action fires.
    fn invoke(&self, method: &str, state: Option<Value>, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        match method {
            "start" => self.start(args, cx),
            "back" => self.back(args, cx),
            _ => {
                let (station, action) = method.split_once('.').ok_or_else(|| FlowError::UnknownMethod {
                    handler: self.name.clone(),
                    method: method.to_string(),
                })?;
                let mut node = self.station(station)?;
                if let Some(state) = state.filter(|s| !s.is_null()) {
                    node.revert(serde_json::from_value(state)?)?;
                }
                node.fire(action, args, cx)
            }
        }
    }
}

pub struct RoadBuilder {
    name: String,
    sign: Arc<dyn Sign>,
    start: Option<String>,
    factories: Vec<(String, StationFactory)>,
    routes: Vec<(String, String)>,
}

impl RoadBuilder {
    pub fn new(name: &str, sign: Arc<dyn Sign>) -> Self {
        Self {
            name: name.to_string(),
            sign,
            start: None,
            factories: Vec::new(),
            routes: Vec::new(),
        }
    }

    pub fn station<S: Station>(mut self) -> Self {
        let factory: StationFactory =
            Box::new(|road: Arc<Road>| -> Box<dyn StationNode> { Box::new(S::make(StationCore::new(road, S::NAME))) });
        self.factories.push((S::NAME.to_string(), factory));
        self
    }

    pub fn route(mut self, from: &str, to: &str) -> Self {
        self.routes.push((from.to_string(), to.to_string()));
        self
    }

    /// Route both ways.
    pub fn link(self, a: &str, b: &str) -> Self {
        self.route(a, b).route(b, a)
    }

    pub fn start(mut self, station: &str) -> Self {
        self.start = Some(station.to_string());
        self
    }

    pub fn build(self) -> FlowResult<Arc<Road>> {
        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();
        let mut factories = HashMap::new();

        for (name, factory) in self.factories {
            let ix = graph.add_node(name.clone());
            index_of.insert(name.clone(), ix);
            factories.insert(name, factory);
        }

        let unknown = |station: &str| FlowError::UnknownStation {
            road: self.name.clone(),
            station: station.to_string(),
        };
        for (from, to) in &self.routes {
            let a = *index_of.get(from).ok_or_else(|| unknown(from))?;
            let b = *index_of.get(to).ok_or_else(|| unknown(to))?;
            graph.add_edge(a, b, ());
        }

        let start = match self.start {
            Some(start) => start,
            None => graph
                .node_indices()
                .next()
                .map(|ix| graph[ix].clone())
                .ok_or_else(|| FlowError::EmptyJourney(self.name.clone()))?,
        };
        if !index_of.contains_key(&start) {
            return Err(unknown(&start));
        }

        Ok(Arc::new_cyclic(|me| Road {
            me: me.clone(),
            name: self.name,
            sign: self.sign,
            start,
            graph,
            index_of,
            factories,
        }))
    }
}
