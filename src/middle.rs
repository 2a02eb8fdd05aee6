//! Precondition gates ("middle actions").
//!
//! A gate answers one question, *is it required right now?*, and when it is,
//! takes over the update: it runs its own `main`, possibly over several
//! updates, and finally calls [`MiddleAction::redirect`] to hand control
//! back to whoever asked for it.
//!
//! Entry points mirror the ways a gate is used:
//!
//! * [`MiddleAction::check`]: side-effect free requiredness test.
//! * [`MiddleAction::request`] / [`request_to`](MiddleAction::request_to):
//!   run the gate unconditionally.
//! * [`MiddleAction::required`] / [`required_at`](MiddleAction::required_at) /
//!   [`required_here`](MiddleAction::required_here): run it only when
//!   required, and stop the current handling if it ran.
//! * [`GateStep`]: the gate registered as a pipeline handler.
//!
//! Within one update a gate that has redirected is marked as ran; gates with
//! [`Gate::IGNORE_LOOP`] then report "not required" for the rest of that
//! update, which breaks redirect cycles.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::Handling;
use crate::dispatch::{Args, Call, Flow, HandlerRef, MethodTable};
use crate::error::FlowResult;
use crate::inline::{InlineKind, InlineRegister, Registration};
use crate::pipeline::UpdateHandler;
use crate::proceed;
use crate::registry::ActionHandler;
use crate::step::Continuation;

/// Where a gate returns control once it has done its job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RedirectTarget {
    #[default]
    None,
    /// Drop the pending continuation and handle the current update again.
    ResumeStep,
    Handler(HandlerRef),
}

impl RedirectTarget {
    pub fn is_none(&self) -> bool {
        matches!(self, RedirectTarget::None)
    }
}

/// Behaviour of a concrete gate.
pub trait Gate: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    /// Stable identifier; used for registration, continuations and loop markers.
    const ID: &'static str;
    const CATEGORY: &'static str = "global";
    /// Once this gate has redirected during an update, stop reporting it as required.
    const IGNORE_LOOP: bool = false;
    /// Named parameters accepted by [`is_required`](Gate::is_required).
    const REQUIRED_PARAMS: &'static [&'static str] = &[];
    /// Named parameters accepted by [`main`](Gate::main).
    const MAIN_PARAMS: &'static [&'static str] = &[];

    fn make(cx: &Handling<'_>) -> Self;

    fn is_required(&mut self, call: &Call, cx: &mut Handling<'_>) -> FlowResult<bool>;

    fn main(this: &mut MiddleAction<Self>, call: Call, cx: &mut Handling<'_>) -> FlowResult<Flow<()>>;

    /// Additional methods, typically the ones resumed by continuations.
    fn methods() -> MethodTable<MiddleAction<Self>> {
        MethodTable::new()
    }
}

/// A gate together with its redirect state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "G: Serialize", deserialize = "G: DeserializeOwned"))]
pub struct MiddleAction<G> {
    pub gate: G,
    pub redirect_to: RedirectTarget,
    #[serde(default)]
    pub redirect_with: Args,
    #[serde(default)]
    pub params: Option<Args>,
}

impl<G> Deref for MiddleAction<G> {
    type Target = G;

    fn deref(&self) -> &Self::Target {
        &self.gate
    }
}

impl<G> DerefMut for MiddleAction<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.gate
    }
}

impl<G: Gate> MiddleAction<G> {
    pub fn new(gate: G) -> Self {
        Self {
            gate,
            redirect_to: RedirectTarget::None,
            redirect_with: Args::new(),
            params: None,
        }
    }

    pub fn make(cx: &Handling<'_>) -> Self {
        Self::new(G::make(cx))
    }

    pub fn category(&self) -> &'static str {
        G::CATEGORY
    }

    /// Preset the redirect target and its arguments.
    pub fn at(mut self, target: HandlerRef, args: Args) -> Self {
        self.redirect_to = RedirectTarget::Handler(target);
        self.redirect_with = args;
        self
    }

    /// Arguments used when this gate runs as a pipeline handler.
    pub fn params(mut self, args: Args) -> Self {
        self.params = Some(args);
        self
    }

    fn here(method: &str) -> HandlerRef {
        HandlerRef::new(G::ID, method)
    }

    fn checks_is_required(&mut self, args: Args, cx: &mut Handling<'_>) -> FlowResult<bool> {
        if G::IGNORE_LOOP && cx.context.has_ran(G::ID) {
            debug!(gate = G::ID, "gate already ran during this update");
            return Ok(false);
        }
        let (pass, _) = args.split_for(G::REQUIRED_PARAMS);
        let call = Call::new(pass, Self::here("is_required"));
        self.gate.is_required(&call, cx)
    }

    fn run_main(&mut self, target: RedirectTarget, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        let (pass, rest) = args.split_for(G::MAIN_PARAMS);
        self.redirect_to = target;
        self.redirect_with = rest;
        debug!(gate = G::ID, redirect_to = ?self.redirect_to, "running gate");
        G::main(self, Call::new(pass, Self::here("main")), cx)
    }

    /// Whether the gate is required for `args`. No handling side effects.
    pub fn check(args: Args, cx: &mut Handling<'_>) -> FlowResult<bool> {
        Self::make(cx).checks_is_required(args, cx)
    }

    /// Run the gate unconditionally, returning to `target` afterwards.
    ///
    /// Named arguments not accepted by `main` are kept and forwarded to the
    /// target on redirect.
    pub fn request(target: &[&str], args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        let target = cx.registry().target(target)?;
        Self::make(cx).run_main(RedirectTarget::Handler(target), args, cx)
    }

    pub fn request_to(handler: &str, method: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        Self::request(&[handler, method], args, cx)
    }

    /// Run the gate if it is required, then stop the current handling.
    ///
    /// Returns `Flow::Continue(())` when the gate is not required, in which
    /// case nothing has been touched. The target is validated before the
    /// check runs.
    pub fn required(target: &[&str], args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        let target = cx.registry().target(target)?;
        let mut action = Self::make(cx);
        if !action.checks_is_required(args.clone(), cx)? {
            return Ok(Flow::Continue(()));
        }
        proceed!(action.run_main(RedirectTarget::Handler(target), args, cx)?);
        Ok(Flow::Stop)
    }

    pub fn required_at(handler: &str, method: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        Self::required(&[handler, method], args, cx)
    }

    /// [`required`](Self::required) targeting the calling method itself.
    /// Handlers pass [`Call::here`].
    pub fn required_here(here: &HandlerRef, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        Self::required(&[here.handler.as_str(), here.method.as_str()], args, cx)
    }

    /// Return control to the redirect target.
    ///
    /// `Continue(true)` when a handler was invoked, `Continue(false)` when
    /// there was nothing to redirect to, `Repeat` when the pending
    /// continuation was dropped and the update must be handled again. The
    /// ran marker is cleared on every path before returning.
    pub fn redirect(&mut self, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<bool>> {
        cx.context.mark_ran(G::ID);

        match self.redirect_to.clone() {
            RedirectTarget::Handler(target) => {
                let registry = cx.registry();
                if registry.get(&target.handler).is_some() {
                    debug!(gate = G::ID, target = %target, "redirecting");
                    let with = self.redirect_with.clone().chain(args);
                    let result = registry.invoke(&target, None, with, cx);
                    cx.context.clear_ran(G::ID);
                    return Ok(result?.map(|_| true));
                }
                warn!(gate = G::ID, target = %target, "redirect target is not registered; nothing to redirect to");
            }
            RedirectTarget::ResumeStep => {
                cx.step().set(None);
                cx.context.set_handled_by(G::ID);
                cx.context.clear_ran(G::ID);
                debug!(gate = G::ID, "continuation cleared, repeating handling");
                return Ok(Flow::Repeat);
            }
            RedirectTarget::None => {}
        }

        cx.context.clear_ran(G::ID);
        Ok(Flow::Continue(false))
    }

    /// Pipeline hook used when the gate is registered as a handler.
    pub fn handle_update(&mut self, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        // A sub-interaction started by a gate is waiting for this update.
        if let Some(initializer) = cx.step().get().and_then(|step| step.initializer) {
            if cx.registry().is_gate(&initializer) {
                return Ok(Flow::Skip);
            }
        }
        if cx.context.handled_by() == Some(G::ID) {
            return Ok(Flow::Skip);
        }

        let params = self.params.clone().unwrap_or_default();
        if self.checks_is_required(params.clone(), cx)? {
            if self.redirect_to.is_none() {
                self.redirect_to = RedirectTarget::ResumeStep;
                self.redirect_with = Args::new();
            }
            let (pass, _) = params.split_for(G::MAIN_PARAMS);
            return G::main(self, Call::new(pass, Self::here("main")), cx);
        }

        Ok(Flow::Skip)
    }

    /// Make `method` of this gate handle the conversation's next update.
    pub fn await_reply(&self, method: &str, cx: &Handling<'_>) -> FlowResult<()> {
        let step = Continuation::new(G::ID, method)
            .initialized_by(G::ID)
            .with_state(serde_json::to_value(self)?);
        cx.step().set(Some(step));
        Ok(())
    }

    /// Attach the redirect state to a registration so it can be recovered
    /// when the user answers it.
    pub fn prepare_register(&self, register: &mut InlineRegister) -> FlowResult<()> {
        register.with("redirectTo", serde_json::to_value(&self.redirect_to)?);
        if register.is_creating() && self.redirect_with.is_empty() {
            return Ok(());
        }
        register.with("redirectWith", serde_json::to_value(&self.redirect_with)?);
        Ok(())
    }

    pub fn inline(&self, kind: InlineKind, name: &str, args: Args, cx: &Handling<'_>) -> FlowResult<Registration> {
        let mut register = cx.create_inline_register(kind, name, args);
        register.initializer(G::ID, name);
        self.prepare_register(&mut register)?;
        cx.register_inline(register)
    }

    /// Restore redirect state carried by a registration.
    pub fn restore_from(&mut self, registration: &Registration) -> FlowResult<()> {
        if let Some(to) = registration.fields.get("redirectTo") {
            self.redirect_to = serde_json::from_value(to.clone())?;
        }
        if let Some(with) = registration.fields.get("redirectWith") {
            self.redirect_with = serde_json::from_value(with.clone())?;
        }
        Ok(())
    }
}

/// Registry entry for a gate type, so redirects and continuations can reach it.
pub struct GateHandler<G>(PhantomData<fn() -> G>);

impl<G: Gate> GateHandler<G> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<G: Gate> Default for GateHandler<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Gate> ActionHandler for GateHandler<G> {
    fn type_name(&self) -> &str {
        G::ID
    }

    fn is_gate(&self) -> bool {
        true
    }

    fn has_method(&self, method: &str) -> bool {
        method == "main" || G::methods().contains(method)
    }

    fn invoke(&self, method: &str, state: Option<Value>, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let mut action: MiddleAction<G> = match state {
            Some(state) if !state.is_null() => serde_json::from_value(state)?,
            _ => MiddleAction::make(cx),
        };
        if method == "main" && !G::methods().contains("main") {
            let (pass, _) = args.split_for(G::MAIN_PARAMS);
            return Ok(G::main(&mut action, Call::new(pass, HandlerRef::new(G::ID, "main")), cx)?.map(|()| Value::Null));
        }
        G::methods().invoke(&mut action, HandlerRef::new(G::ID, method), args, cx)
    }
}

/// A gate registered in the pipeline; built fresh for every update.
pub struct GateStep<G> {
    params: Args,
    _gate: PhantomData<fn() -> G>,
}

impl<G: Gate> GateStep<G> {
    pub fn new(params: Args) -> Self {
        Self { params, _gate: PhantomData }
    }
}

impl<G: Gate> UpdateHandler for GateStep<G> {
    fn name(&self) -> &str {
        G::ID
    }

    fn category(&self) -> Option<&str> {
        Some(G::CATEGORY)
    }

    fn handle_update(&self, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        MiddleAction::<G>::make(cx).params(self.params.clone()).handle_update(cx)
    }
}
