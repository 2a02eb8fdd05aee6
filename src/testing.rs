use std::sync::Arc;

use chat_update::Update;
use serde_json::{json, Value};

use crate::context::{Handling, UpdateContext};
use crate::inline::MemoryRegistrar;
use crate::registry::Registry;
use crate::step::InMemoryStep;

/// Owns everything a [`Handling`] borrows, for driving handlers directly.
pub(crate) struct Harness {
    pub update: Update,
    pub context: UpdateContext,
    pub step: Arc<InMemoryStep>,
    pub registry: Registry,
    pub inline: MemoryRegistrar,
}

impl Harness {
    pub fn new(registry: Registry) -> Self {
        let update = Update::text("chat-1", "hello");
        let context = UpdateContext::new(&update.id);
        Self {
            update,
            context,
            step: InMemoryStep::new(),
            registry,
            inline: MemoryRegistrar::new(),
        }
    }

    pub fn cx(&mut self) -> Handling<'_> {
        Handling::new(&self.update, &mut self.context, self.step.as_ref(), &self.registry, &self.inline)
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.context.get(key).and_then(Value::as_u64).unwrap_or(0)
    }
}

pub(crate) fn bump(cx: &mut Handling<'_>, key: &str) {
    let next = cx.context.get(key).and_then(Value::as_u64).unwrap_or(0) + 1;
    cx.context.put(key, json!(next));
}
