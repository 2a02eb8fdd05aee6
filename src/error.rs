use thiserror::Error;

/// Errors raised by the conversation core.
///
/// Control signals (skip, stop, repeat) are never errors: they travel as
/// [`Flow`](crate::dispatch::Flow) values. Everything here is either a usage
/// error the caller must fix or a failure of an external collaborator.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("redirect target must have exactly 2 parts (handler, method), got {0}")]
    RedirectArity(usize),

    #[error("no handler registered under `{0}`")]
    UnknownHandler(String),

    #[error("handler `{handler}` has no method `{method}`")]
    UnknownMethod { handler: String, method: String },

    #[error("`{owner}` has no keepable field `{field}`")]
    UnknownField { owner: String, field: String },

    #[error("road `{road}` has no station `{station}`")]
    UnknownStation { road: String, station: String },

    #[error("road `{road}` has no route from `{from}` to `{to}`")]
    NoRoute { road: String, from: String, to: String },

    #[error("journey on road `{0}` has nothing to go back to")]
    EmptyJourney(String),

    #[error("handling repeated more than {0} times for one update")]
    RepeatLimit(usize),

    #[error("value conversion failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl FlowError {
    pub fn handler(msg: impl Into<String>) -> Self {
        FlowError::Handler(msg.into())
    }

    /// Usage errors are programmer mistakes and are never retried.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            FlowError::RedirectArity(_)
                | FlowError::UnknownHandler(_)
                | FlowError::UnknownMethod { .. }
                | FlowError::UnknownField { .. }
                | FlowError::UnknownStation { .. }
        )
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
