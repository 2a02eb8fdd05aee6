use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::Handling;
use crate::dispatch::{Args, Flow, HandlerRef, MethodTable};
use crate::error::FlowResult;
use crate::registry::ActionHandler;
use crate::step::Continuation;

/// A plain handler type: a bag of methods plus whatever state it wants to
/// carry across a continuation.
pub trait Section: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    const NAME: &'static str;

    fn make(cx: &Handling<'_>) -> Self;

    fn methods() -> MethodTable<Self>;

    /// Invoke `method` on a fresh instance.
    fn invokes(method: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let mut section = Self::make(cx);
        Self::methods().invoke(&mut section, HandlerRef::new(Self::NAME, method), args, cx)
    }

    /// Make `method` on this instance handle the conversation's next update.
    fn await_reply(&self, method: &str, cx: &Handling<'_>) -> FlowResult<()> {
        let step = Continuation::new(Self::NAME, method)
            .initialized_by(Self::NAME)
            .with_state(serde_json::to_value(self)?);
        cx.step().set(Some(step));
        Ok(())
    }
}

pub struct SectionHandler<T>(PhantomData<fn() -> T>);

impl<T: Section> SectionHandler<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Section> Default for SectionHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Section> ActionHandler for SectionHandler<T> {
    fn type_name(&self) -> &str {
        T::NAME
    }

    fn has_method(&self, method: &str) -> bool {
        T::methods().contains(method)
    }

    fn invoke(&self, method: &str, state: Option<Value>, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let mut section = match state {
            Some(state) if !state.is_null() => serde_json::from_value(state)?,
            _ => T::make(cx),
        };
        T::methods().invoke(&mut section, HandlerRef::new(T::NAME, method), args, cx)
    }
}
