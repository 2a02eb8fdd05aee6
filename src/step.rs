use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::dispatch::{Args, HandlerRef};

/// Pointer to what should handle the next update of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Continuation {
    /// Registered handler type to resume.
    pub handler: String,
    /// Method invoked on that handler.
    pub method: String,
    /// Type that initialised this step, e.g. the gate whose prompt is waiting.
    pub initializer: Option<String>,
    /// Serialised handler instance, rehydrated on resume.
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub args: Args,
    pub created_at: DateTime<Utc>,
}

impl Continuation {
    pub fn new(handler: &str, method: &str) -> Self {
        Self {
            handler: handler.to_string(),
            method: method.to_string(),
            initializer: None,
            state: Value::Null,
            args: Args::new(),
            created_at: Utc::now(),
        }
    }

    pub fn initialized_by(mut self, initializer: &str) -> Self {
        self.initializer = Some(initializer.to_string());
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    pub fn target(&self) -> HandlerRef {
        HandlerRef::new(&self.handler, &self.method)
    }
}

pub type Step = Arc<dyn StepStore>;

/// Continuation store of one conversation, plus a small memory for values
/// that must outlive a single update (journeys, accepted terms, ...).
///
/// Implementations are only ever used by one update at a time; the
/// dispatcher guarantees that.
pub trait StepStore: Send + Sync + Debug {
    fn get(&self) -> Option<Continuation>;

    /// Replace the pending continuation; `None` cancels resumption.
    fn set(&self, step: Option<Continuation>);

    /// Remove and return the pending continuation.
    fn take(&self) -> Option<Continuation> {
        let step = self.get();
        if step.is_some() {
            self.set(None);
        }
        step
    }

    fn recall(&self, key: &str) -> Option<Value>;
    fn remember(&self, key: &str, value: Value);
    fn forget(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryStep {
    step: Mutex<Option<Continuation>>,
    memory: DashMap<String, Value>,
}

impl InMemoryStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl StepStore for InMemoryStep {
    fn get(&self) -> Option<Continuation> {
        self.step.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, step: Option<Continuation>) {
        *self.step.lock().unwrap_or_else(|e| e.into_inner()) = step;
    }

    fn recall(&self, key: &str) -> Option<Value> {
        self.memory.get(key).map(|v| v.clone())
    }

    fn remember(&self, key: &str, value: Value) {
        self.memory.insert(key.to_string(), value);
    }

    fn forget(&self, key: &str) {
        self.memory.remove(key);
    }
}

/// Step stores keyed by conversation, evicted after `ttl_secs` of inactivity.
#[derive(Clone, Debug)]
pub struct StepSessions {
    cache: Cache<String, Arc<InMemoryStep>>,
}

impl StepSessions {
    pub fn new(ttl_secs: u64) -> Self {
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(ttl_secs))
            .eviction_listener(|key: Arc<String>, _value: Arc<InMemoryStep>, cause| {
                info!("Conversation step expired: chat={}, cause={:?}", key, cause);
            })
            .build();
        Self { cache }
    }

    pub async fn get(&self, chat_id: &str) -> Option<Step> {
        self.cache.get(chat_id).await.map(|s| s as Step)
    }

    pub async fn get_or_create(&self, chat_id: &str) -> Step {
        self.cache
            .get_with(chat_id.to_string(), async { InMemoryStep::new() })
            .await
    }

    pub async fn remove(&self, chat_id: &str) {
        self.cache.invalidate(chat_id).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}
