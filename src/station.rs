//! Stations: the steps of a multi-step conversation.
//!
//! A station belongs to one [`Road`] and acts on the road's [`Sign`]. It
//! exposes named actions through a static [`MethodTable`], carries a set of
//! keep-fields across transitions and injects its dynamic context into every
//! action it fires.

use std::collections::BTreeMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::context::Handling;
use crate::dispatch::{Args, Flow, HandlerRef, MethodTable};
use crate::error::FlowResult;
use crate::inline::{InlineKind, Registration};
use crate::road::Road;
use crate::step::Continuation;

/// Snapshot of a station's keep-fields, by field name.
pub type KeepData = BTreeMap<String, Value>;

/// Key under which a station's own descriptor is injected.
pub const STATION_KEY: &str = "station";

/// The domain subject a road acts on.
pub trait Sign: Send + Sync {
    fn name(&self) -> &str;

    fn fire(&self, event: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>>;
}

/// What a station's action sees under [`STATION_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StationRef {
    pub road: String,
    pub station: String,
    pub sign: String,
}

impl StationRef {
    pub fn to_value(&self) -> Value {
        json!({ "road": self.road, "station": self.station, "sign": self.sign })
    }
}

/// State shared by every station.
pub struct StationCore {
    road: Arc<Road>,
    sign: Arc<dyn Sign>,
    name: String,
    pub default_action: String,
    pub revert_action: Option<String>,
    pub keeps: Vec<String>,
    dynamic_args: BTreeMap<String, Value>,
}

impl StationCore {
    pub fn new(road: Arc<Road>, name: &str) -> Self {
        let sign = road.sign();
        let mut core = Self {
            road,
            sign,
            name: name.to_string(),
            default_action: "main".to_string(),
            revert_action: None,
            keeps: Vec::new(),
            dynamic_args: BTreeMap::new(),
        };
        core.assert_station();
        core
    }

    pub fn keeping(mut self, fields: &[&str]) -> Self {
        self.keeps = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn reverting_with(mut self, action: &str) -> Self {
        self.revert_action = Some(action.to_string());
        self
    }

    pub fn road(&self) -> &Arc<Road> {
        &self.road
    }

    pub fn sign(&self) -> &Arc<dyn Sign> {
        &self.sign
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> StationRef {
        StationRef {
            road: self.road.name().to_string(),
            station: self.name.clone(),
            sign: self.sign.name().to_string(),
        }
    }

    pub fn dynamic_args(&self) -> &BTreeMap<String, Value> {
        &self.dynamic_args
    }

    /// Shallow merge; later values win, except for [`STATION_KEY`].
    pub fn merge_dynamic_args(&mut self, args: BTreeMap<String, Value>) {
        self.dynamic_args.extend(args);
        self.assert_station();
    }

    /// Dynamic args overridden by `overrides`, with the station descriptor re-asserted.
    pub fn dynamic_context(&self, overrides: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut named = self.dynamic_args.clone();
        named.extend(overrides);
        named.insert(STATION_KEY.to_string(), self.descriptor().to_value());
        named
    }

    /// `"main"` and `"revert"` are aliases; anything else is used as is.
    pub fn resolve_action<'n>(&'n self, name: &'n str) -> &'n str {
        match name {
            "main" => &self.default_action,
            "revert" => self.revert_action.as_deref().unwrap_or(&self.default_action),
            other => other,
        }
    }

    /// Identity of `action` on this station, as the registry knows it.
    pub fn action_ref(&self, action: &str) -> HandlerRef {
        HandlerRef::new(self.road.name(), &format!("{}.{}", self.name, action))
    }

    fn assert_station(&mut self) {
        let descriptor = self.descriptor().to_value();
        self.dynamic_args.insert(STATION_KEY.to_string(), descriptor);
    }
}

pub trait Station: Send + Sync + Sized + 'static {
    const NAME: &'static str;

    fn make(core: StationCore) -> Self;

    fn core(&self) -> &StationCore;

    fn core_mut(&mut self) -> &mut StationCore;

    fn actions() -> MethodTable<Self>;

    /// Keep-field names. Override to compute them per instance.
    fn keeps(&self) -> Vec<String> {
        self.core().keeps.clone()
    }

    fn read_field(&self, field: &str) -> FlowResult<Value>;

    fn write_field(&mut self, field: &str, value: Value) -> FlowResult<()>;

    /// Run action `name` with the dynamic args overridden by `args`.
    /// A caller's named `station` value is replaced by this station's descriptor.
    fn fire_action(&mut self, name: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let action = self.core().resolve_action(name).to_string();
        let named = self.core().dynamic_context(args.named);
        let args = Args {
            positional: args.positional,
            named,
        };
        let here = self.core().action_ref(&action);
        debug!(road = %here.handler, action = %here.method, "firing station action");
        Self::actions().invoke_as(self, &action, here, args, cx)
    }

    fn fire_sign(&self, event: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let context = Args::from_named(self.core().dynamic_context(BTreeMap::new()));
        let sign = self.core().sign().clone();
        sign.fire(event, args.chain(context), cx)
    }

    fn merge_dynamic_args(&mut self, args: BTreeMap<String, Value>) -> &mut Self {
        self.core_mut().merge_dynamic_args(args);
        self
    }

    fn keep_data(&self) -> FlowResult<KeepData> {
        self.keeps()
            .into_iter()
            .map(|field| {
                let value = self.read_field(&field)?;
                Ok((field, value))
            })
            .collect()
    }

    fn revert_data(&mut self, data: KeepData) -> FlowResult<()> {
        for (field, value) in data {
            self.write_field(&field, value)?;
        }
        Ok(())
    }

    fn inline(&self, kind: InlineKind, name: &str, args: Args, cx: &Handling<'_>) -> FlowResult<Registration> {
        let core = self.core();
        let mut register = cx.create_inline_register(kind, name, args);
        register.initializer(core.road().name(), &format!("{}.{}", core.name(), name));
        cx.register_inline(register)
    }

    fn menu(&self, name: &str, args: Args, cx: &Handling<'_>) -> FlowResult<Registration> {
        self.inline(InlineKind::Menu, name, args, cx)
    }

    fn inline_form(&self, name: &str, args: Args, cx: &Handling<'_>) -> FlowResult<Registration> {
        self.inline(InlineKind::InlineForm, name, args, cx)
    }

    fn dialog(&self, name: &str, args: Args, cx: &Handling<'_>) -> FlowResult<Registration> {
        self.inline(InlineKind::Dialog, name, args, cx)
    }

    /// Resume `action` on this station with the next update, restoring the
    /// current keep-fields first.
    fn await_reply(&self, action: &str, cx: &Handling<'_>) -> FlowResult<()> {
        let here = self.core().action_ref(action);
        let step = Continuation::new(&here.handler, &here.method)
            .initialized_by(&here.handler)
            .with_state(serde_json::to_value(self.keep_data()?)?);
        cx.step().set(Some(step));
        Ok(())
    }

    /// Leave this station for `target`, carrying the current keep-fields.
    fn travel(&self, target: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let kept = self.keep_data()?;
        let road = self.core().road().clone();
        road.enter_from(Some(kept), target, args, cx)
    }
}

/// Keep-field access for stations that hold their keeps in a serde struct.
pub mod serde_field {
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use serde_json::Value;

    use crate::error::{FlowError, FlowResult};

    pub fn read<T: Serialize>(data: &T, owner: &str, field: &str) -> FlowResult<Value> {
        let value = serde_json::to_value(data)?;
        value.get(field).cloned().ok_or_else(|| FlowError::UnknownField {
            owner: owner.to_string(),
            field: field.to_string(),
        })
    }

    pub fn write<T: Serialize + DeserializeOwned>(data: &mut T, owner: &str, field: &str, value: Value) -> FlowResult<()> {
        let mut current = serde_json::to_value(&*data)?;
        let slot = current
            .as_object_mut()
            .and_then(|object| object.get_mut(field))
            .ok_or_else(|| FlowError::UnknownField {
                owner: owner.to_string(),
                field: field.to_string(),
            })?;
        *slot = value;
        *data = serde_json::from_value(current)?;
        Ok(())
    }
}
