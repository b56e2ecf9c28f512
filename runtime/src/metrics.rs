//! Engine metrics, exported in Prometheus text format.
//!
//! The execution loop always records through the `metrics` facade; nothing
//! is kept unless a recorder is installed. [`install`] installs the
//! Prometheus one, process-wide:
//! - Planning cycles and consumed events
//! - State store mutation latency
//! - Action dispatch, completion and failure
//! - Entity lifecycle (terminations, planner failures, stalls)
//!
//! # Example
//!
//! ```rust,no_run
//! # fn example() -> Result<(), evtsm_runtime::metrics::MetricsError> {
//! let prometheus = evtsm_runtime::metrics::install()?;
//!
//! // ... run engines ...
//! println!("{}", prometheus.render());
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Mutations and actions are expected in the sub-millisecond to seconds range.
const LATENCY_BUCKETS: &[f64] = &[
    0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0,
];

static RECORDER: OnceLock<Result<PrometheusHandle, MetricsError>> = OnceLock::new();

/// Errors from installing the Prometheus recorder.
#[derive(Error, Debug, Clone)]
pub enum MetricsError {
    /// The exporter rejected its configuration
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Another global recorder is already installed
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Install the Prometheus recorder and return a handle to render it.
///
/// Idempotent: every call after the first returns the first outcome, so
/// tests and binaries can call it freely.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a different recorder was installed
/// first by someone else.
pub fn install() -> Result<&'static PrometheusHandle, MetricsError> {
    RECORDER
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .set_buckets_for_metric(
                    Matcher::Suffix("duration_seconds".to_string()),
                    LATENCY_BUCKETS,
                )
                .map_err(|e| MetricsError::Build(e.to_string()))?
                .install_recorder()
                .map_err(|e| MetricsError::Install(e.to_string()))?;
            register_metrics();
            tracing::info!("Prometheus recorder installed");
            Ok(handle)
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Register all metric descriptions.
fn register_metrics() {
    // Planning Metrics
    describe_counter!(
        "engine_cycles_total",
        "Total number of planning cycles committed"
    );
    describe_counter!(
        "engine_events_consumed_total",
        "Total number of events consumed by planners"
    );
    describe_histogram!(
        "engine_mutation_duration_seconds",
        "Time taken by the state store mutation around a planner call"
    );

    // Action Metrics
    describe_counter!(
        "engine_actions_dispatched_total",
        "Total number of actions dispatched"
    );
    describe_counter!(
        "engine_actions_failed_total",
        "Total number of actions that failed or panicked"
    );
    describe_histogram!(
        "engine_action_duration_seconds",
        "Time taken to run actions"
    );

    // Lifecycle Metrics
    describe_counter!(
        "engine_started_total",
        "Total number of execution loops started"
    );
    describe_counter!(
        "engine_terminated_total",
        "Total number of entities terminated by their planner"
    );
    describe_counter!(
        "engine_planner_failures_total",
        "Total number of planner failures (fail-stop)"
    );
    describe_counter!(
        "engine_stalled_total",
        "Total number of entities stalled after an action failure"
    );
    describe_counter!(
        "engine_force_unlocks_total",
        "Total number of forced guard releases"
    );
}

/// Engine metrics recorder.
pub struct EngineMetrics;

impl EngineMetrics {
    /// Record a committed planning cycle.
    pub fn record_cycle(consumed: usize, duration: Duration) {
        counter!("engine_cycles_total").increment(1);
        counter!("engine_events_consumed_total").increment(consumed as u64);
        histogram!("engine_mutation_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an action dispatch.
    pub fn record_dispatch() {
        counter!("engine_actions_dispatched_total").increment(1);
    }

    /// Record a finished action.
    pub fn record_action(duration: Duration) {
        histogram!("engine_action_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed action.
    pub fn record_action_failure() {
        counter!("engine_actions_failed_total").increment(1);
    }

    /// Record an execution loop start.
    pub fn record_start() {
        counter!("engine_started_total").increment(1);
    }

    /// Record a planner-requested termination.
    pub fn record_termination() {
        counter!("engine_terminated_total").increment(1);
    }

    /// Record a planner failure.
    pub fn record_planner_failure() {
        counter!("engine_planner_failures_total").increment(1);
    }

    /// Record an entity entering the stalled state.
    pub fn record_stall() {
        counter!("engine_stalled_total").increment(1);
    }

    /// Record a forced guard release.
    pub fn record_force_unlock() {
        counter!("engine_force_unlocks_total").increment(1);
    }
}
