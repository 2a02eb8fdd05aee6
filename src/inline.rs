use std::collections::BTreeMap;
use std::sync::Mutex;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::Args;
use crate::error::FlowResult;

/// Kind of inline sub-interaction a handler can register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InlineKind {
    Menu,
    InlineForm,
    Dialog,
}

/// Who owns an inline registration and under which name path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Initializer {
    pub owner: String,
    pub path: String,
}

/// A registration being prepared. Fields attached with [`with`](Self::with)
/// are stored alongside the rendered interaction and handed back when the
/// user answers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineRegister {
    pub kind: InlineKind,
    pub name: String,
    pub args: Args,
    pub initializer: Option<Initializer>,
    pub fields: BTreeMap<String, Value>,
    creating: bool,
}

impl InlineRegister {
    pub fn new(kind: InlineKind, name: &str, args: Args) -> Self {
        Self {
            kind,
            name: name.to_string(),
            args,
            initializer: None,
            fields: BTreeMap::new(),
            creating: true,
        }
    }

    /// A register re-opened from an earlier registration (e.g. to handle a click).
    pub fn reopened(registration: &Registration) -> Self {
        Self {
            kind: registration.kind,
            name: registration.name.clone(),
            args: Args::new(),
            initializer: registration.initializer.clone(),
            fields: registration.fields.clone(),
            creating: false,
        }
    }

    pub fn is_creating(&self) -> bool {
        self.creating
    }

    pub fn initializer(&mut self, owner: &str, path: &str) -> &mut Self {
        self.initializer = Some(Initializer {
            owner: owner.to_string(),
            path: path.to_string(),
        });
        self
    }

    pub fn with(&mut self, field: &str, value: Value) -> &mut Self {
        self.fields.insert(field.to_string(), value);
        self
    }

    pub fn path(&self) -> String {
        match &self.initializer {
            Some(init) => init.path.clone(),
            None => self.name.clone(),
        }
    }
}

/// Handle returned once a registration has been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Registration {
    pub id: String,
    pub kind: InlineKind,
    pub name: String,
    pub path: String,
    pub initializer: Option<Initializer>,
    pub fields: BTreeMap<String, Value>,
}

/// Boundary to whatever renders menus, forms and dialogs.
pub trait InlineRegistrar: Send + Sync {
    fn register(&self, register: InlineRegister) -> FlowResult<Registration>;
}

/// Keeps registrations in memory. Used by the demo binary and tests.
#[derive(Debug, Default)]
pub struct MemoryRegistrar {
    registrations: Mutex<Vec<Registration>>,
}

impl MemoryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last(&self) -> Option<Registration> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner()).last().cloned()
    }
}

impl InlineRegistrar for MemoryRegistrar {
    fn register(&self, register: InlineRegister) -> FlowResult<Registration> {
        let registration = Registration {
            id: uuid::Uuid::new_v4().to_string(),
            kind: register.kind,
            name: register.name.clone(),
            path: register.path(),
            initializer: register.initializer.clone(),
            fields: register.fields,
        };
        tracing::debug!(kind = ?registration.kind, path = %registration.path, "inline registration stored");
        self.registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(registration.clone());
        Ok(registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_records_fields_and_path() {
        let registrar = MemoryRegistrar::new();
        let mut register = InlineRegister::new(InlineKind::Menu, "choose", Args::new());
        register.initializer("signup", "ask_name.choose").with("redirectTo", json!("@step"));

        let registration = registrar.register(register).unwrap();
        assert_eq!(registration.path, "ask_name.choose");
        assert_eq!(registration.fields.get("redirectTo"), Some(&json!("@step")));
        assert_eq!(registrar.registrations().len(), 1);
    }

    #[test]
    fn test_reopened_is_not_creating() {
        let registrar = MemoryRegistrar::new();
        let registration = registrar
            .register(InlineRegister::new(InlineKind::Dialog, "confirm", Args::new()))
            .unwrap();

        let reopened = InlineRegister::reopened(&registration);
        assert!(!reopened.is_creating());
        assert_eq!(reopened.path(), "confirm");
    }
}
