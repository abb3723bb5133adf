//! Diagnostic events.
//!
//! Every component reports `{type, message}` events through a `DiagnosticSink`.
//! The default sink forwards to the `log` facade; the daemon can render those
//! records as JSON lines for a supervising shell.

use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Info,
    Warning,
    Error,
}

impl DiagnosticKind {
    pub fn level(self) -> log::Level {
        match self {
            DiagnosticKind::Info => log::Level::Info,
            DiagnosticKind::Warning => log::Level::Warn,
            DiagnosticKind::Error => log::Level::Error,
        }
    }

    pub fn from_level(level: log::Level) -> Self {
        match level {
            log::Level::Error => DiagnosticKind::Error,
            log::Level::Warn => DiagnosticKind::Warning,
            _ => DiagnosticKind::Info,
        }
    }
}

/// A single structured event. Serialises as `{"type": "...", "data": "..."}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    #[serde(rename = "type")]
    pub kind: DiagnosticKind,
    #[serde(rename = "data")]
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","data":"unserialisable diagnostic"}"#.into())
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Shared handle passed to every component.
#[derive(Clone)]
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
    target: &'static str,
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            sink,
            target: "stream_sentinel",
        }
    }

    pub fn log() -> Self {
        Self::new(Arc::new(LogSink))
    }

    /// Same sink, different log target.
    pub fn scoped(&self, target: &'static str) -> Self {
        Self {
            sink: self.sink.clone(),
            target,
        }
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(DiagnosticKind::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(DiagnosticKind::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(DiagnosticKind::Error, message);
    }

    fn emit(&self, kind: DiagnosticKind, message: impl Into<String>) {
        let message = message.into();
        log::log!(target: self.target, kind.level(), "{}", message);
        self.sink.emit(Diagnostic::new(kind, message));
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::log()
    }
}

/// Sink that relies on the `log` records `Diagnostics` already writes.
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&self, _diagnostic: Diagnostic) {}
}

/// Keeps every event in memory. Used by tests and by callers that want to
/// inspect recent diagnostics.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count_matching(&self, kind: DiagnosticKind, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|d| d.kind == kind && d.message.starts_with(prefix))
            .count()
    }
}

impl DiagnosticSink for RecordingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(diagnostic),
            Err(poisoned) => poisoned.into_inner().push(diagnostic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_serialises_as_type_and_data() {
        let d = Diagnostic::new(DiagnosticKind::Warning, "Low FPS detected: 2.0");
        assert_eq!(
            d.to_json_line(),
            r#"{"type":"warning","data":"Low FPS detected: 2.0"}"#
        );
    }

    #[test]
    fn recording_sink_counts_by_kind_and_prefix() {
        let sink = Arc::new(RecordingSink::new());
        let diag = Diagnostics::new(sink.clone());
        diag.info("Current FPS: 30.0");
        diag.info("Current FPS: 29.5");
        diag.error("Current FPS: unavailable");

        assert_eq!(sink.count_matching(DiagnosticKind::Info, "Current FPS"), 2);
        assert_eq!(sink.count_matching(DiagnosticKind::Error, "Current FPS"), 1);
    }
}
