use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chat_update::LogLevel;
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::pipeline::HandlingReport;

/// Target of the one-line-per-update JSON events.
pub const UPDATE_TARGET: &str = "update";

#[typetag::serde]
pub trait LoggerType: Send + Sync {
    fn log(&self, level: LogLevel, context: &str, msg: &str);
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

/// Cloneable, serialisable logging handle for handlers and signs.
#[derive(Serialize, Deserialize)]
pub struct Logger(pub Box<dyn LoggerType>);

impl Logger {
    pub fn tracing() -> Self {
        Logger(Box::new(TracingLogger))
    }

    pub fn log(&self, level: LogLevel, context: &str, msg: &str) {
        self.0.log(level, context, msg)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::tracing()
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger(self.0.clone_box())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TracingLogger;

#[typetag::serde]
impl LoggerType for TracingLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(%context, "{msg}"),
            LogLevel::Debug => tracing::debug!(%context, "{msg}"),
            LogLevel::Info => tracing::info!(%context, "{msg}"),
            LogLevel::Warn => tracing::warn!(%context, "{msg}"),
            LogLevel::Error => tracing::error!(%context, "{msg}"),
            LogLevel::Critical => tracing::error!(%context, "[CRITICAL] {msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. Human-readable output goes to
/// stderr; with a `log_dir`, a daily text log and a daily JSON file of
/// update events (target [`UPDATE_TARGET`]) are written there as well.
pub fn init_tracing(log_dir: Option<PathBuf>, level: LogLevel) -> Result<Logger> {
    // 1) filter
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    // 2) console
    let console = fmt::layer().with_writer(std::io::stderr).with_thread_names(true);

    // 3) optional rolling files
    let (text, events) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(&dir).with_context(|| format!("creating log dir {}", dir.display()))?;
            let text = fmt::layer()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, &dir, "waystation.log"))
                .with_ansi(false);
            let events = fmt::layer()
                .json()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, &dir, "updates.json"))
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{}=info", UPDATE_TARGET)));
            (Some(text), Some(events))
        }
        None => (None, None),
    };

    // 4) install
    Registry::default()
        .with(filter)
        .with(console)
        .with(text)
        .with(events)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(Logger::tracing())
}

/// Emit the JSON event for one handled update.
pub fn update_event(report: &HandlingReport) {
    tracing::event!(
        target: UPDATE_TARGET,
        tracing::Level::INFO,
        update = %report.update_id,
        chat = %report.chat_id,
        outcome = ?report.outcome,
        handled_by = ?report.handled_by,
        repeats = report.repeats as u64,
        elapsed_ms = report.elapsed_ms as u64,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_roundtrips_through_serde() {
        let logger = Logger::tracing();
        let json = serde_json::to_string(&logger).unwrap();
        assert!(json.contains("TracingLogger"));

        let back: Logger = serde_json::from_str(&json).unwrap();
        assert_eq!(format!("{:?}", back.clone()), "TracingLogger");
        back.log(LogLevel::Critical, "test", "still fine without a subscriber");
    }

    #[test]
    fn test_init_tracing_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        // another test binary may already own the global subscriber
        let _ = init_tracing(Some(logs.clone()), LogLevel::Debug);
        assert!(logs.is_dir());
    }
}
