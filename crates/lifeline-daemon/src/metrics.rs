//! Prometheus metrics for the LifeLine daemon.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `lifeline_emergencies_created_total` | Counter | `type` |
//! | `lifeline_sos_triggers_total` | Counter | |
//! | `lifeline_helpers_assigned_total` | Counter | |
//! | `lifeline_lifecycle_transitions_total` | Counter | `transition` |
//! | `lifeline_notifications_total` | Counter | `event`, `outcome` |
//! | `lifeline_collaborator_failures_total` | Counter | `collaborator` |
//! | `lifeline_concurrency_conflicts_total` | Counter | `operation` |
//! | `lifeline_http_requests_total` | Counter | `endpoint`, `status` |
//! | `lifeline_time_to_first_accept_seconds` | Histogram | `type` |
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = MetricsRegistry::new()?;
//! let metrics = registry.lifeline_metrics().clone();
//! metrics.emergency_created("fire");
//! let body = registry.encode_text()?;
//! ```

use std::sync::Arc;

use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Buckets for time-to-first-acceptance, in seconds (30 s to 1 h).
pub const FIRST_ACCEPT_BUCKETS: &[f64] = &[30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1800.0, 3600.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Lifecycle and HTTP metrics.
///
/// Cheap to clone; every clone records into the same registry.
#[derive(Clone)]
pub struct LifelineMetrics {
    emergencies_created_total: CounterVec,
    sos_triggers_total: Counter,
    helpers_assigned_total: Counter,
    lifecycle_transitions_total: CounterVec,
    notifications_total: CounterVec,
    collaborator_failures_total: CounterVec,
    concurrency_conflicts_total: CounterVec,
    http_requests_total: CounterVec,
    time_to_first_accept: HistogramVec,
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> MetricsResult<CounterVec> {
    let counter = CounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn counter(registry: &Registry, name: &str, help: &str) -> MetricsResult<Counter> {
    let counter = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl LifelineMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let time_to_first_accept = HistogramVec::new(
            HistogramOpts::new(
                "lifeline_time_to_first_accept_seconds",
                "Time from SOS to the first helper acceptance",
            )
            .buckets(FIRST_ACCEPT_BUCKETS.to_vec()),
            &["type"],
        )?;
        registry.register(Box::new(time_to_first_accept.clone()))?;

        Ok(Self {
            emergencies_created_total: counter_vec(
                registry,
                "lifeline_emergencies_created_total",
                "Emergencies created",
                &["type"],
            )?,
            sos_triggers_total: counter(registry, "lifeline_sos_triggers_total", "SOS triggers")?,
            helpers_assigned_total: counter(
                registry,
                "lifeline_helpers_assigned_total",
                "New helper assignments",
            )?,
            lifecycle_transitions_total: counter_vec(
                registry,
                "lifeline_lifecycle_transitions_total",
                "Committed lifecycle transitions",
                &["transition"],
            )?,
            notifications_total: counter_vec(
                registry,
                "lifeline_notifications_total",
                "Notification attempts by outcome",
                &["event", "outcome"],
            )?,
            collaborator_failures_total: counter_vec(
                registry,
                "lifeline_collaborator_failures_total",
                "Geo index and notification failures",
                &["collaborator"],
            )?,
            concurrency_conflicts_total: counter_vec(
                registry,
                "lifeline_concurrency_conflicts_total",
                "Version conflicts observed on save",
                &["operation"],
            )?,
            http_requests_total: counter_vec(
                registry,
                "lifeline_http_requests_total",
                "HTTP requests by endpoint and status",
                &["endpoint", "status"],
            )?,
            time_to_first_accept,
        })
    }

    /// Records a created emergency.
    pub fn emergency_created(&self, kind: &str) {
        self.emergencies_created_total
            .with_label_values(&[truncate_label(kind)])
            .inc();
    }

    /// Records an SOS trigger.
    pub fn sos_triggered(&self) {
        self.sos_triggers_total.inc();
    }

    /// Records `count` new helper assignments.
    #[allow(clippy::cast_precision_loss)]
    pub fn helpers_assigned(&self, count: usize) {
        self.helpers_assigned_total.inc_by(count as f64);
    }

    /// Records a committed transition (`accepted`, `arrived`, `resolved`, ...).
    pub fn transition(&self, transition: &str) {
        self.lifecycle_transitions_total
            .with_label_values(&[truncate_label(transition)])
            .inc();
    }

    /// Returns the count for a transition. Used by tests.
    #[must_use]
    pub fn transition_count(&self, transition: &str) -> f64 {
        self.lifecycle_transitions_total
            .with_label_values(&[truncate_label(transition)])
            .get()
    }

    /// Records a notification attempt.
    pub fn notification(&self, event: &str, delivered: bool) {
        let outcome = if delivered { "delivered" } else { "failed" };
        self.notifications_total
            .with_label_values(&[truncate_label(event), outcome])
            .inc();
        if !delivered {
            self.collaborator_failed("notification");
        }
    }

    /// Returns the failed-notification count for an event. Used by tests.
    #[must_use]
    pub fn notification_failures(&self, event: &str) -> f64 {
        self.notifications_total
            .with_label_values(&[truncate_label(event), "failed"])
            .get()
    }

    /// Records a collaborator failure.
    pub fn collaborator_failed(&self, collaborator: &str) {
        self.collaborator_failures_total
            .with_label_values(&[truncate_label(collaborator)])
            .inc();
    }

    /// Records a version conflict.
    pub fn conflict(&self, operation: &str) {
        self.concurrency_conflicts_total
            .with_label_values(&[truncate_label(operation)])
            .inc();
    }

    /// Returns the conflict count for an operation. Used by tests.
    #[must_use]
    pub fn conflict_count(&self, operation: &str) -> f64 {
        self.concurrency_conflicts_total
            .with_label_values(&[truncate_label(operation)])
            .get()
    }

    /// Records an HTTP response.
    pub fn http_request(&self, endpoint: &str, status: u16) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[truncate_label(endpoint), status.as_str()])
            .inc();
    }

    /// Returns the request count for an endpoint and status. Used by tests.
    #[must_use]
    pub fn http_request_count(&self, endpoint: &str, status: u16) -> f64 {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[truncate_label(endpoint), status.as_str()])
            .get()
    }

    /// Records time-to-first-acceptance.
    pub fn first_accept_latency(&self, kind: &str, seconds: f64) {
        self.time_to_first_accept
            .with_label_values(&[truncate_label(kind)])
            .observe(seconds);
    }

    /// Returns how many first acceptances were observed for a type. Used by
    /// tests.
    #[must_use]
    pub fn first_accept_samples(&self, kind: &str) -> u64 {
        self.time_to_first_accept
            .with_label_values(&[truncate_label(kind)])
            .get_sample_count()
    }
}

/// Registry owning the daemon's metrics.
pub struct MetricsRegistry {
    registry: Registry,
    lifeline_metrics: LifelineMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let lifeline_metrics = LifelineMetrics::new(&registry)?;
        Ok(Self {
            registry,
            lifeline_metrics,
        })
    }

    /// Returns the lifecycle metrics.
    #[must_use]
    pub const fn lifeline_metrics(&self) -> &LifelineMetrics {
        &self.lifeline_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

/// Truncates a label value at a UTF-8 boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
