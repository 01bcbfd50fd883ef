//! Prometheus metrics collection: request volume, key-reservation
//! outcomes, and repair/iteration counts.

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec, HistogramVec, Registry};

use crate::error::Result;

pub static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Router calls to LLM providers, by provider and outcome.
pub static REQUEST_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("polyagent_requests_total", "Total LLM provider calls", &["provider", "status"]).unwrap()
});

/// Router call latency.
pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "polyagent_request_duration_seconds",
        "LLM provider call duration in seconds",
        &["provider"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap()
});

/// Prompt/completion token usage.
pub static TOKEN_USAGE: Lazy<CounterVec> =
    Lazy::new(|| register_counter_vec!("polyagent_tokens_total", "Total tokens used", &["provider", "token_type"]).unwrap());

/// Tasks currently in flight, by agent role.
pub static ACTIVE_TASKS: Lazy<GaugeVec> =
    Lazy::new(|| register_gauge_vec!("polyagent_active_tasks", "Number of in-flight tasks", &["agent_role"]).unwrap());

/// Errors by taxonomy variant and severity.
pub static ERROR_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("polyagent_errors_total", "Total errors", &["error_type", "severity"]).unwrap()
});

/// Key-reservation attempts, by outcome (`reserved`, `cooldown`, `rpm_exceeded`, `tpm_exceeded`).
pub static KEY_RESERVATION_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("polyagent_key_reservations_total", "Key reservation attempts", &["key_id", "outcome"]).unwrap()
});

/// Repair/branch tasks synthesized by the Debugger or IterativeLoop.
pub static BRANCH_TASKS_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("polyagent_branch_tasks_total", "Repair tasks synthesized", &["branch_reason", "source"]).unwrap()
});

/// IterativeLoop rounds completed, by final outcome.
pub static ITERATION_COUNTER: Lazy<CounterVec> =
    Lazy::new(|| register_counter_vec!("polyagent_iterations_total", "Iterative loop rounds run", &["outcome"]).unwrap());

/// Register every metric with the process registry. Idempotent to call
/// once at startup.
pub fn init_metrics() -> Result<()> {
    METRICS_REGISTRY.register(Box::new(REQUEST_COUNTER.clone()))?;
    METRICS_REGISTRY.register(Box::new(REQUEST_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(TOKEN_USAGE.clone()))?;
    METRICS_REGISTRY.register(Box::new(ACTIVE_TASKS.clone()))?;
    METRICS_REGISTRY.register(Box::new(ERROR_COUNTER.clone()))?;
    METRICS_REGISTRY.register(Box::new(KEY_RESERVATION_COUNTER.clone()))?;
    METRICS_REGISTRY.register(Box::new(BRANCH_TASKS_COUNTER.clone()))?;
    METRICS_REGISTRY.register(Box::new(ITERATION_COUNTER.clone()))?;
    Ok(())
}

/// Narrow surface so components depend on a trait rather than the
/// `Lazy` statics directly.
pub trait MetricsCollector: Send + Sync {
    fn record_request(&self, provider: &str, status: &str, duration_secs: f64);
    fn record_tokens(&self, provider: &str, prompt_tokens: u32, completion_tokens: u32);
    fn record_error(&self, error_type: &str, severity: &str);
    fn record_key_reservation(&self, key_id: &str, outcome: &str);
    fn record_branch_task(&self, branch_reason: &str, source: &str);
    fn record_iteration(&self, outcome: &str);
}

#[derive(Clone, Default)]
pub struct DefaultMetricsCollector;

impl MetricsCollector for DefaultMetricsCollector {
    fn record_request(&self, provider: &str, status: &str, duration_secs: f64) {
        REQUEST_COUNTER.with_label_values(&[provider, status]).inc();
        REQUEST_DURATION.with_label_values(&[provider]).observe(duration_secs);
    }

    fn record_tokens(&self, provider: &str, prompt_tokens: u32, completion_tokens: u32) {
        TOKEN_USAGE.with_label_values(&[provider, "prompt"]).inc_by(f64::from(prompt_tokens));
        TOKEN_USAGE.with_label_values(&[provider, "completion"]).inc_by(f64::from(completion_tokens));
    }

    fn record_error(&self, error_type: &str, severity: &str) {
        ERROR_COUNTER.with_label_values(&[error_type, severity]).inc();
    }

    fn record_key_reservation(&self, key_id: &str, outcome: &str) {
        KEY_RESERVATION_COUNTER.with_label_values(&[key_id, outcome]).inc();
    }

    fn record_branch_task(&self, branch_reason: &str, source: &str) {
        BRANCH_TASKS_COUNTER.with_label_values(&[branch_reason, source]).inc();
    }

    fn record_iteration(&self, outcome: &str) {
        ITERATION_COUNTER.with_label_values(&[outcome]).inc();
    }
}
