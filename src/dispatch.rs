use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Handling;
use crate::error::{FlowError, FlowResult};

/// Result of one handler invocation, as seen by the pipeline.
///
/// `Skip`, `Stop` and `Repeat` are control signals: every layer that receives
/// one must hand it upward unchanged (see [`proceed!`](crate::proceed)).
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub enum Flow<T = ()> {
    /// The handler ran; carry on with the value it produced.
    Continue(T),
    /// The handler declines this update; the pipeline tries the next one.
    Skip,
    /// Abort the remaining handling of this update.
    Stop,
    /// Run the whole pipeline again for the same update.
    Repeat,
}

impl<T> Flow<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, op: F) -> Flow<U> {
        match self {
            Flow::Continue(value) => Flow::Continue(op(value)),
            Flow::Skip => Flow::Skip,
            Flow::Stop => Flow::Stop,
            Flow::Repeat => Flow::Repeat,
        }
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Flow::Continue(_))
    }

    pub fn continued(self) -> Option<T> {
        match self {
            Flow::Continue(value) => Some(value),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Flow::Continue(_) => "continue",
            Flow::Skip => "skip",
            Flow::Stop => "stop",
            Flow::Repeat => "repeat",
        }
    }
}

/// Unwraps `Flow::Continue`, or returns any control signal from the
/// enclosing function as `Ok(signal)`.
#[macro_export]
macro_rules! proceed {
    ($flow:expr) => {
        match $flow {
            $crate::dispatch::Flow::Continue(value) => value,
            $crate::dispatch::Flow::Skip => return Ok($crate::dispatch::Flow::Skip),
            $crate::dispatch::Flow::Stop => return Ok($crate::dispatch::Flow::Stop),
            $crate::dispatch::Flow::Repeat => return Ok($crate::dispatch::Flow::Repeat),
        }
    };
}

/// Arguments of a handler call: an ordered positional list plus named values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Args {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positional: Vec<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub named: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            named: BTreeMap::new(),
        }
    }

    pub fn from_named(named: BTreeMap<String, Value>) -> Self {
        Self {
            positional: Vec::new(),
            named,
        }
    }

    /// Append a positional value.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named value, replacing an earlier one of the same name.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.named.insert(name.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    pub fn at(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    /// `self` followed by `other`: positional values are appended, named
    /// values of `other` win on conflict.
    pub fn chain(mut self, other: Args) -> Args {
        self.positional.extend(other.positional);
        self.named.extend(other.named);
        self
    }

    /// Partition into what a method declaring `params` accepts and the rest.
    ///
    /// Positional values always pass. Named values pass only when their name
    /// is declared; the remainder comes back as the second element.
    pub fn split_for(self, params: &[&str]) -> (Args, Args) {
        let mut pass = Args::from_values(self.positional);
        let mut rest = Args::new();
        for (name, value) in self.named {
            if params.contains(&name.as_str()) {
                pass.named.insert(name, value);
            } else {
                rest.named.insert(name, value);
            }
        }
        (pass, rest)
    }
}

/// A `(handler type, method)` pair naming something the registry can invoke.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct HandlerRef {
    pub handler: String,
    pub method: String,
}

impl HandlerRef {
    pub fn new(handler: &str, method: &str) -> Self {
        Self {
            handler: handler.to_string(),
            method: method.to_string(),
        }
    }

    /// Build from a raw `[handler, method]` slice. Any other length is a usage error.
    pub fn from_parts(parts: &[&str]) -> FlowResult<Self> {
        match parts {
            [handler, method] => Ok(Self::new(handler, method)),
            _ => Err(FlowError::RedirectArity(parts.len())),
        }
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.handler, self.method)
    }
}

/// What a handler method receives besides its receiver and the handling pass.
#[derive(Debug, Clone)]
pub struct Call {
    args: Args,
    here: HandlerRef,
}

impl Call {
    pub fn new(args: Args, here: HandlerRef) -> Self {
        Self { args, here }
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn into_args(self) -> Args {
        self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.at(index)
    }

    pub fn named(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    /// Identity of the method being invoked, usable as a redirect target.
    pub fn here(&self) -> &HandlerRef {
        &self.here
    }
}

pub type MethodFn<T> = fn(&mut T, Call, &mut Handling<'_>) -> FlowResult<Flow<Value>>;

/// One invocable method: its name, the named parameters it accepts and the
/// function that runs it.
pub struct MethodSpec<T> {
    pub name: &'static str,
    pub params: &'static [&'static str],
    pub call: MethodFn<T>,
}

/// Static method table of a handler type. This is what makes named-argument
/// matching possible without runtime reflection.
pub struct MethodTable<T> {
    methods: Vec<MethodSpec<T>>,
}

impl<T> Default for MethodTable<T> {
    fn default() -> Self {
        Self { methods: Vec::new() }
    }
}

impl<T> MethodTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, name: &'static str, params: &'static [&'static str], call: MethodFn<T>) -> Self {
        self.methods.retain(|m| m.name != name);
        self.methods.push(MethodSpec { name, params, call });
        self
    }

    pub fn get(&self, name: &str) -> Option<&MethodSpec<T>> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn params(&self, name: &str) -> Option<&'static [&'static str]> {
        self.get(name).map(|m| m.params)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.methods.iter().map(|m| m.name).collect()
    }

    /// Invoke `here.method` on `target`, passing only the named values the
    /// method declares.
    pub fn invoke(&self, target: &mut T, here: HandlerRef, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let method = here.method.clone();
        self.invoke_as(target, &method, here, args, cx)
    }

    /// Like [`invoke`](Self::invoke), but looks up `method` while the call
    /// reports `here` as its identity.
    pub fn invoke_as(&self, target: &mut T, method: &str, here: HandlerRef, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        let spec = self.get(method).ok_or_else(|| FlowError::UnknownMethod {
            handler: here.handler.clone(),
            method: here.method.clone(),
        })?;
        let (pass, dropped) = args.split_for(spec.params);
        if !dropped.named.is_empty() {
            tracing::trace!(method = %here, dropped = ?dropped.named.keys().collect::<Vec<_>>(), "named arguments not declared by method");
        }
        (spec.call)(target, Call::new(pass, here), cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_keeps_positional_and_declared_names() {
        let args = Args::new().arg(1).arg("two").with("user", "ada").with("extra", true);
        let (pass, rest) = args.split_for(&["user"]);

        assert_eq!(pass.positional, vec![json!(1), json!("two")]);
        assert_eq!(pass.get("user"), Some(&json!("ada")));
        assert!(pass.get("extra").is_none());
        assert!(rest.positional.is_empty());
        assert_eq!(rest.get("extra"), Some(&json!(true)));
    }

    #[test]
    fn test_chain_appends_and_overrides() {
        let a = Args::new().arg(1).with("k", "first");
        let b = Args::new().arg(2).with("k", "second").with("z", 0);
        let joined = a.chain(b);

        assert_eq!(joined.positional, vec![json!(1), json!(2)]);
        assert_eq!(joined.get("k"), Some(&json!("second")));
        assert_eq!(joined.get("z"), Some(&json!(0)));
    }

    #[test]
    fn test_handler_ref_arity() {
        assert_eq!(HandlerRef::from_parts(&["App", "on_done"]).unwrap(), HandlerRef::new("App", "on_done"));
        assert!(matches!(HandlerRef::from_parts(&["App"]), Err(FlowError::RedirectArity(1))));
        assert!(matches!(HandlerRef::from_parts(&["a", "b", "c"]), Err(FlowError::RedirectArity(3))));
    }

    #[test]
    fn test_flow_map_keeps_signals() {
        assert_eq!(Flow::Continue(2).map(|v| v * 2), Flow::Continue(4));
        assert_eq!(Flow::<i32>::Stop.map(|v| v * 2), Flow::Stop);
        assert_eq!(Flow::<i32>::Repeat.label(), "repeat");
        assert_eq!(Flow::<i32>::Skip.continued(), None);
    }

    fn signal_passthrough(flow: Flow<u8>) -> FlowResult<Flow<&'static str>> {
        let value = proceed!(flow);
        Ok(Flow::Continue(if value > 0 { "positive" } else { "zero" }))
    }

    #[test]
    fn test_proceed_propagates_signals() {
        assert_eq!(signal_passthrough(Flow::Continue(3)).unwrap(), Flow::Continue("positive"));
        assert_eq!(signal_passthrough(Flow::Stop).unwrap(), Flow::Stop);
        assert_eq!(signal_passthrough(Flow::Repeat).unwrap(), Flow::Repeat);
        assert_eq!(signal_passthrough(Flow::Skip).unwrap(), Flow::Skip);
    }

    #[test]
    fn test_method_table_lookup() {
        struct Counter;
        let table: MethodTable<Counter> = MethodTable::new()
            .method("main", &[], |_, _, _| Ok(Flow::Continue(Value::Null)))
            .method("add", &["amount"], |_, call, _| Ok(Flow::Continue(call.named("amount").cloned().unwrap_or_default())));

        assert!(table.contains("main"));
        assert_eq!(table.params("add"), Some(&["amount"][..]));
        assert_eq!(table.names(), vec!["main", "add"]);
        assert!(table.get("missing").is_none());
    }
}
