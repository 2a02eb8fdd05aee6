use std::sync::Arc;
use std::time::Instant;

use chat_update::{Update, UpdateContent};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, trace};

use crate::config::FlowConfig;
use crate::context::{Handling, UpdateContext};
use crate::dispatch::{Args, Flow, HandlerRef};
use crate::error::{FlowError, FlowResult};
use crate::inline::{InlineRegistrar, MemoryRegistrar};
use crate::middle::{Gate, GateStep};
use crate::registry::Registry;
use crate::road::Road;
use crate::section::Section;
use crate::step::StepStore;

/// One link of the handling chain.
pub trait UpdateHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Ordering category; only gates have one.
    fn category(&self) -> Option<&str> {
        None
    }

    fn handle_update(&self, cx: &mut Handling<'_>) -> FlowResult<Flow<()>>;
}

/// Resumes the conversation's pending continuation, if any.
///
/// Continuations are one-shot: the step is taken before the handler runs, and
/// a handler that wants the next update as well has to await it again.
pub struct StepResume;

impl UpdateHandler for StepResume {
    fn name(&self) -> &str {
        "step"
    }

    fn handle_update(&self, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        let Some(step) = cx.step().take() else {
            return Ok(Flow::Skip);
        };
        let target = step.target();
        debug!(target = %target, initializer = ?step.initializer, "resuming continuation");
        let registry = cx.registry();
        Ok(registry.invoke(&target, Some(step.state), step.args, cx)?.map(|_| ()))
    }
}

/// A closure as a handler.
pub struct HandlerFn<F> {
    name: String,
    f: F,
}

impl<F> HandlerFn<F>
where
    F: Fn(&mut Handling<'_>) -> FlowResult<Flow<()>> + Send + Sync,
{
    pub fn new(name: &str, f: F) -> Self {
        Self { name: name.to_string(), f }
    }
}

impl<F> UpdateHandler for HandlerFn<F>
where
    F: Fn(&mut Handling<'_>) -> FlowResult<Flow<()>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_update(&self, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        (self.f)(cx)
    }
}

/// What a [`Route`] reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    /// `/name args...`; the arguments are passed positionally.
    Command(String),
    /// Callback data starting with the prefix; the full data is passed as `data`.
    Callback(String),
    /// Any text; passed as `text`.
    Text,
}

/// Sends matching updates to a registered handler method.
pub struct Route {
    matcher: Matcher,
    target: HandlerRef,
    name: String,
}

impl Route {
    pub fn new(matcher: Matcher, target: HandlerRef) -> Self {
        let name = format!("route:{}", target);
        Self { matcher, target, name }
    }

    fn args_for(&self, update: &Update) -> Option<Args> {
        match (&self.matcher, &update.content) {
            (Matcher::Command(wanted), UpdateContent::Command { name, args }) if wanted == name => {
                Some(Args::from_values(args.iter().map(|a| json!(a))))
            }
            (Matcher::Command(wanted), UpdateContent::Text(text)) => {
                let mut words = text.split_whitespace();
                let command = words.next()?.strip_prefix('/')?;
                (command == wanted.as_str()).then(|| Args::from_values(words.map(|w| json!(w))))
            }
            (Matcher::Callback(prefix), UpdateContent::Callback { data }) if data.starts_with(prefix.as_str()) => {
                Some(Args::new().with("data", data.as_str()))
            }
            (Matcher::Text, UpdateContent::Text(text)) => Some(Args::new().with("text", text.as_str())),
            _ => None,
        }
    }
}

impl UpdateHandler for Route {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_update(&self, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        let Some(args) = self.args_for(cx.update()) else {
            return Ok(Flow::Skip);
        };
        let registry = cx.registry();
        Ok(registry.invoke(&self.target, None, args, cx)?.map(|_| ()))
    }
}

/// Order in which gates are asked.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GateOrdering {
    /// The order gates were added in.
    #[default]
    Registration,
    /// Listed categories first, in list order; other categories keep
    /// registration order after them.
    Categories(Vec<String>),
}

impl GateOrdering {
    /// Parse a comma-separated category list; empty means registration order.
    pub fn from_list(list: &str) -> Self {
        let categories: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if categories.is_empty() {
            GateOrdering::Registration
        } else {
            GateOrdering::Categories(categories)
        }
    }

    fn rank(&self, category: Option<&str>) -> usize {
        match self {
            GateOrdering::Registration => 0,
            GateOrdering::Categories(order) => category
                .and_then(|c| order.iter().position(|o| o == c))
                .unwrap_or(order.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HandlingOutcome {
    Handled,
    Stopped,
    Unhandled,
}

/// Summary of one update's handling.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HandlingReport {
    pub update_id: String,
    pub chat_id: String,
    pub outcome: HandlingOutcome,
    /// Handlers that did not skip, in order, across all passes.
    pub handled_by: Vec<String>,
    pub repeats: usize,
    pub replies: Vec<String>,
    pub elapsed_ms: u128,
}

pub struct Pipeline {
    registry: Arc<Registry>,
    chain: Vec<Box<dyn UpdateHandler>>,
    inline: Arc<dyn InlineRegistrar>,
    max_repeats: usize,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handler names in the order they are tried.
    pub fn chain(&self) -> Vec<&str> {
        self.chain.iter().map(|h| h.name()).collect()
    }

    /// Run one update through the chain.
    ///
    /// The first handler that does not skip ends a pass. `Repeat` starts a
    /// new pass over the same update and context, up to `max_repeats` times.
    pub fn handle(&self, update: &Update, step: &dyn StepStore) -> FlowResult<HandlingReport> {
        let started = Instant::now();
        let mut context = UpdateContext::new(&update.id);
        let mut handled_by = Vec::new();
        let mut repeats = 0;

        let outcome = 'passes: loop {
            let mut cx = Handling::new(update, &mut context, step, &self.registry, self.inline.as_ref());

            for handler in &self.chain {
                trace!(handler = handler.name(), pass = repeats, "trying handler");
                let flow = handler.handle_update(&mut cx)?;
                if flow == Flow::Skip {
                    continue;
                }
                handled_by.push(handler.name().to_string());
                match flow {
                    Flow::Stop => break 'passes HandlingOutcome::Stopped,
                    Flow::Repeat => {
                        repeats += 1;
                        if repeats > self.max_repeats {
                            return Err(FlowError::RepeatLimit(self.max_repeats));
                        }
                        debug!(handler = handler.name(), repeats, "repeating handling");
                        continue 'passes;
                    }
                    _ => break 'passes HandlingOutcome::Handled,
                }
            }
            break HandlingOutcome::Unhandled;
        };

        let report = HandlingReport {
            update_id: update.id.clone(),
            chat_id: update.chat_id.clone(),
            outcome,
            handled_by,
            repeats,
            replies: context.take_replies(),
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(
            update = %report.update_id,
            chat = %report.chat_id,
            outcome = ?report.outcome,
            repeats = report.repeats,
            "update handled"
        );
        Ok(report)
    }
}

pub struct PipelineBuilder {
    registry: Registry,
    gates: Vec<Box<dyn UpdateHandler>>,
    handlers: Vec<Box<dyn UpdateHandler>>,
    ordering: GateOrdering,
    max_repeats: usize,
    inline: Arc<dyn InlineRegistrar>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            registry: Registry::new(),
            gates: Vec::new(),
            handlers: Vec::new(),
            ordering: GateOrdering::Registration,
            max_repeats: FlowConfig::default().max_repeats,
            inline: Arc::new(MemoryRegistrar::new()),
        }
    }
}

impl PipelineBuilder {
    /// Register `G` and ask it, with `params`, on every update.
    pub fn gate<G: Gate>(mut self, params: Args) -> Self {
        self.registry.gate::<G>();
        self.gates.push(Box::new(GateStep::<G>::new(params)));
        self
    }

    /// Register `G` so it can be required from handlers, without asking it on every update.
    pub fn gate_type<G: Gate>(mut self) -> Self {
        self.registry.gate::<G>();
        self
    }

    pub fn section<T: Section>(mut self) -> Self {
        self.registry.section::<T>();
        self
    }

    pub fn road(mut self, road: Arc<Road>) -> Self {
        self.registry.road(road);
        self
    }

    /// Add a handler tried after gates and the pending continuation.
    pub fn handler(mut self, handler: impl UpdateHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn route(self, matcher: Matcher, handler: &str, method: &str) -> Self {
        self.handler(Route::new(matcher, HandlerRef::new(handler, method)))
    }

    pub fn ordering(mut self, ordering: GateOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn max_repeats(mut self, max_repeats: usize) -> Self {
        self.max_repeats = max_repeats;
        self
    }

    pub fn inline(mut self, inline: Arc<dyn InlineRegistrar>) -> Self {
        self.inline = inline;
        self
    }

    pub fn config(self, config: &FlowConfig) -> Self {
        self.ordering(config.gate_order.clone()).max_repeats(config.max_repeats)
    }

    pub fn build(self) -> Pipeline {
        let PipelineBuilder {
            registry,
            mut gates,
            handlers,
            ordering,
            max_repeats,
            inline,
        } = self;

        // stable: equal ranks keep registration order
        gates.sort_by_key(|g| ordering.rank(g.category()));

        let mut chain = gates;
        chain.push(Box::new(StepResume));
        chain.extend(handlers);

        Pipeline {
            registry: Arc::new(registry),
            chain,
            inline,
            max_repeats,
        }
    }
}
