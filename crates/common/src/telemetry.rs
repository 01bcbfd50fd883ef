//! Structured logging setup. An OpenTelemetry/OTLP export pipeline is
//! dropped here: nothing in this system calls for distributed trace
//! export, only structured local logs (see DESIGN.md).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{LogFormat, ObservabilityConfig};
use crate::error::Result;

/// Initialize the global tracing subscriber.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = Registry::default().with(env_filter);

    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
    }

    Ok(())
}

/// No distributed tracer to flush; kept as a symmetric shutdown hook so
/// callers don't need to special-case the absence of one.
pub fn shutdown_telemetry() {}

/// Structured-logging helpers.
#[macro_export]
macro_rules! log_event {
    ($level:expr, $message:expr, $($key:expr => $value:expr),* $(,)?) => {
        tracing::event!(
            $level,
            message = $message,
            $($key = ?$value,)*
        );
    };
}

#[macro_export]
macro_rules! log_error {
    ($error:expr, $($key:expr => $value:expr),* $(,)?) => {
        tracing::error!(
            error = %$error,
            $($key = ?$value,)*
        );
    };
}

/// Span builder for consistent span attribution across components. Fields
/// are fixed (rather than arbitrary key/value pairs) because `tracing`
/// spans must declare their fields up front.
pub struct SpanBuilder {
    name: &'static str,
    workflow_id: Option<String>,
    task_id: Option<String>,
}

impl SpanBuilder {
    pub fn new(name: &'static str) -> Self {
        Self { name, workflow_id: None, task_id: None }
    }

    pub fn with_workflow_id(mut self, workflow_id: &str) -> Self {
        self.workflow_id = Some(workflow_id.to_string());
        self
    }

    pub fn with_task_id(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn build(self) -> tracing::Span {
        tracing::info_span!(
            "span",
            name = self.name,
            workflow_id = self.workflow_id.as_deref().unwrap_or(""),
            task_id = self.task_id.as_deref().unwrap_or(""),
        )
    }
}
