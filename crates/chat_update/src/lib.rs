pub mod message;

pub use message::{LogLevel, Participant, Update, UpdateContent};
