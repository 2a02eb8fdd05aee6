//! Conversation flow control for chat bots.
//!
//! Two mechanisms sit on top of a per-update handling pipeline:
//!
//! * [`middle`]: precondition gates that interrupt handling, run their own
//!   sub-conversation and then redirect back to whatever asked for them.
//! * [`station`] / [`road`]: multi-step conversations as stations on a
//!   directed graph, with fields that survive moving away and back.
//!
//! [`dispatcher::UpdateDispatcher`] serialises updates per conversation and
//! owns the per-conversation continuation stores.

pub mod config;
pub mod context;
pub mod demo;
pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod inline;
pub mod logger;
pub mod middle;
pub mod pipeline;
pub mod registry;
pub mod road;
pub mod schema;
pub mod section;
pub mod station;
pub mod step;

#[cfg(test)]
pub(crate) mod testing;

pub use chat_update::{LogLevel, Participant, Update, UpdateContent};
pub use context::{Handling, UpdateContext};
pub use dispatch::{Args, Call, Flow, HandlerRef, MethodTable};
pub use error::{FlowError, FlowResult};
pub use middle::{Gate, MiddleAction, RedirectTarget};
pub use pipeline::{GateOrdering, HandlingOutcome, HandlingReport, Pipeline};
pub use road::{Journey, Road};
pub use section::Section;
pub use station::{KeepData, Sign, Station, StationCore};
pub use step::{Continuation, StepStore};
