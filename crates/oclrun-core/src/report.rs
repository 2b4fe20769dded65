//! Per-operation status reporting.
//!
//! Every resource-acquisition step in the pipeline emits exactly one
//! human-readable line through [`StatusReporter`]. The classification
//! is binary: an operation either succeeded or failed with some error
//! origin. Coloring and the output sink are constructor-injected
//! configuration, never module-level state, so tests can capture the
//! stream and disable ANSI codes.
//!
//! Reporting is an observability side channel: it never returns an
//! error and never panics, even when the sink fails.

use std::io::Write;
use std::sync::Mutex;

use console::style;

use crate::error::OclError;

/// Reporter configuration.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Render success/failure labels with ANSI colors.
    pub color: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self { color: true }
    }
}

/// Writes one classified status line per pipeline operation.
pub struct StatusReporter {
    config: ReporterConfig,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl StatusReporter {
    /// Reporter writing to standard output.
    pub fn stdout(config: ReporterConfig) -> Self {
        Self::with_sink(config, Box::new(std::io::stdout()))
    }

    /// Reporter writing to an injected sink.
    pub fn with_sink(config: ReporterConfig, sink: Box<dyn Write + Send>) -> Self {
        Self { config, sink: Mutex::new(sink) }
    }

    /// Reporter that swallows all output.
    pub fn silent() -> Self {
        Self::with_sink(ReporterConfig { color: false }, Box::new(std::io::sink()))
    }

    /// Report a successful operation.
    pub fn success(&self, operation: &str) {
        let label = if self.config.color {
            style("ok").green().to_string()
        } else {
            "ok".to_string()
        };
        self.emit(operation, &label);
    }

    /// Report a failed operation with its error.
    pub fn failure(&self, operation: &str, error: &OclError) {
        let label = if self.config.color {
            format!("{} {error}", style("FAILED:").red().bold())
        } else {
            format!("FAILED: {error}")
        };
        self.emit(operation, &label);
    }

    /// Report a skipped operation (permissive mode only).
    pub fn skipped(&self, operation: &str) {
        let label = if self.config.color {
            style("skipped").yellow().to_string()
        } else {
            "skipped".to_string()
        };
        self.emit(operation, &label);
    }

    /// Classify and report a result in one call.
    pub fn report<T>(&self, operation: &str, result: &crate::error::Result<T>) {
        match result {
            Ok(_) => self.success(operation),
            Err(e) => self.failure(operation, e),
        }
    }

    fn emit(&self, operation: &str, label: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            // Sink failures are deliberately dropped; reporting must
            // never take the pipeline down.
            let _ = writeln!(sink, "  {operation:<28} {label}");
            let _ = sink.flush();
        }
    }
}
