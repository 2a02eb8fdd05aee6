use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::context::Handling;
use crate::dispatch::{Args, Flow, HandlerRef};
use crate::error::{FlowError, FlowResult};
use crate::middle::{Gate, GateHandler};
use crate::road::Road;
use crate::section::{Section, SectionHandler};

/// Anything the registry can invoke by `(type name, method)`.
pub trait ActionHandler: Send + Sync {
    fn type_name(&self) -> &str;

    fn is_gate(&self) -> bool {
        false
    }

    fn has_method(&self, method: &str) -> bool;

    /// Invoke `method`. `state` is the serialised instance to rehydrate;
    /// `None` means a fresh instance.
    fn invoke(&self, method: &str, state: Option<Value>, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>>;
}

/// Name → handler table shared by every update of a bot.
///
/// Redirect targets and continuations refer to handlers by name only, so a
/// name has to be registered here before anything can resume into it.
#[derive(Default, Clone)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    roads: HashMap<String, Arc<Road>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("handlers", &names).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) -> &mut Self {
        let name = handler.type_name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!("handler `{}` registered twice, keeping the last one", name);
        }
        self
    }

    pub fn section<T: Section>(&mut self) -> &mut Self {
        self.register(Arc::new(SectionHandler::<T>::new()))
    }

    pub fn gate<G: Gate>(&mut self) -> &mut Self {
        self.register(Arc::new(GateHandler::<G>::new()))
    }

    /// Register a road. Its stations become invocable as `"<station>.<action>"`.
    pub fn road(&mut self, road: Arc<Road>) -> &mut Self {
        self.roads.insert(road.name().to_string(), road.clone());
        self.register(road)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn find_road(&self, name: &str) -> Option<Arc<Road>> {
        self.roads.get(name).cloned()
    }

    pub fn is_gate(&self, name: &str) -> bool {
        self.handlers.get(name).is_some_and(|h| h.is_gate())
    }

    pub fn validate(&self, target: &HandlerRef) -> FlowResult<()> {
        let handler = self
            .handlers
            .get(&target.handler)
            .ok_or_else(|| FlowError::UnknownHandler(target.handler.clone()))?;
        if !handler.has_method(&target.method) {
            return Err(FlowError::UnknownMethod {
                handler: target.handler.clone(),
                method: target.method.clone(),
            });
        }
        Ok(())
    }

    /// Parse and validate a raw `[handler, method]` redirect target.
    pub fn target(&self, parts: &[&str]) -> FlowResult<HandlerRef> {
        let target = HandlerRef::from_parts(parts)?;
        self.validate(&target)?;
        Ok(target)
    }

    pub fn invoke(&self, target: &HandlerRef, state: Option<Value>, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let handler = self
            .get(&target.handler)
            .ok_or_else(|| FlowError::UnknownHandler(target.handler.clone()))?;
        handler.invoke(&target.method, state, args, cx)
    }
}
