use std::collections::{HashMap, HashSet};

use chat_update::Update;
use serde_json::Value;

use crate::dispatch::Args;
use crate::error::FlowResult;
use crate::inline::{InlineKind, InlineRegister, InlineRegistrar, Registration};
use crate::registry::Registry;
use crate::step::StepStore;

/// Per-update bag. Lives for exactly one handling of one update and is
/// dropped afterwards, so nothing stored here leaks into the next update.
#[derive(Debug, Default)]
pub struct UpdateContext {
    update_id: String,
    values: HashMap<String, Value>,
    ran: HashSet<String>,
    handled_by: Option<String>,
    replies: Vec<String>,
}

impl UpdateContext {
    pub fn new(update_id: &str) -> Self {
        Self {
            update_id: update_id.to_string(),
            ..Self::default()
        }
    }

    pub fn update_id(&self) -> &str {
        &self.update_id
    }

    pub fn put(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn forget(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Record that the gate `gate` has run during this update.
    pub fn mark_ran(&mut self, gate: &str) {
        self.ran.insert(gate.to_string());
    }

    pub fn has_ran(&self, gate: &str) -> bool {
        self.ran.contains(gate)
    }

    pub fn clear_ran(&mut self, gate: &str) {
        self.ran.remove(gate);
    }

    /// Set when a gate resumed the pending continuation, before the pipeline repeats.
    pub fn set_handled_by(&mut self, gate: &str) {
        self.handled_by = Some(gate.to_string());
    }

    pub fn handled_by(&self) -> Option<&str> {
        self.handled_by.as_deref()
    }

    pub fn reply(&mut self, text: impl Into<String>) {
        self.replies.push(text.into());
    }

    pub fn replies(&self) -> &[String] {
        &self.replies
    }

    pub fn take_replies(&mut self) -> Vec<String> {
        std::mem::take(&mut self.replies)
    }
}

/// Everything a handler may touch while one update is being handled.
pub struct Handling<'a> {
    update: &'a Update,
    pub context: &'a mut UpdateContext,
    step: &'a dyn StepStore,
    registry: &'a Registry,
    inline: &'a dyn InlineRegistrar,
}

impl<'a> Handling<'a> {
    pub fn new(
        update: &'a Update,
        context: &'a mut UpdateContext,
        step: &'a dyn StepStore,
        registry: &'a Registry,
        inline: &'a dyn InlineRegistrar,
    ) -> Self {
        Self { update, context, step, registry, inline }
    }

    pub fn update(&self) -> &'a Update {
        self.update
    }

    /// The conversation's continuation store.
    pub fn step(&self) -> &'a dyn StepStore {
        self.step
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    pub fn reply(&mut self, text: impl Into<String>) {
        self.context.reply(text);
    }

    pub fn create_inline_register(&self, kind: InlineKind, name: &str, args: Args) -> InlineRegister {
        InlineRegister::new(kind, name, args)
    }

    pub fn register_inline(&self, register: InlineRegister) -> FlowResult<Registration> {
        self.inline.register(register)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_forget() {
        let mut cx = UpdateContext::new("u-1");
        cx.put("lang", json!("en"));
        assert_eq!(cx.get("lang"), Some(&json!("en")));
        assert!(cx.contains("lang"));

        cx.forget("lang");
        assert!(cx.get("lang").is_none());
        assert_eq!(cx.update_id(), "u-1");
    }

    #[test]
    fn test_ran_markers_are_per_gate() {
        let mut cx = UpdateContext::new("u-2");
        cx.mark_ran("terms");
        assert!(cx.has_ran("terms"));
        assert!(!cx.has_ran("captcha"));

        cx.clear_ran("terms");
        assert!(!cx.has_ran("terms"));
    }

    #[test]
    fn test_replies_drain() {
        let mut cx = UpdateContext::new("u-3");
        cx.reply("hi");
        cx.reply("there");
        assert_eq!(cx.replies().len(), 2);
        assert_eq!(cx.take_replies(), vec!["hi".to_string(), "there".to_string()]);
        assert!(cx.replies().is_empty());
    }
}
