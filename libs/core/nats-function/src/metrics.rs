//! Prometheus metrics for functions.

use crate::error::FunctionError;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), FunctionError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| FunctionError::Metrics(e.to_string()))?;
        info!("Prometheus metrics initialized");
        Ok::<_, FunctionError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Metrics helper labelled with the function name.
#[derive(Debug, Clone)]
pub struct FunctionMetrics {
    function: String,
}

impl FunctionMetrics {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Record a message pulled from a consumer stream
    pub fn message_received(&self, stream: &str) {
        counter!(
            "nats_function_messages_received_total",
            "function" => self.function.clone(),
            "stream" => stream.to_string()
        )
        .increment(1);
    }

    /// Record a message whose payload could not be decoded
    pub fn message_undecodable(&self, stream: &str) {
        counter!(
            "nats_function_messages_undecodable_total",
            "function" => self.function.clone(),
            "stream" => stream.to_string()
        )
        .increment(1);
    }

    /// Record a handler invocation that returned successfully
    pub fn handler_succeeded(&self, stream: &str, duration: Duration) {
        counter!(
            "nats_function_handler_calls_total",
            "function" => self.function.clone(),
            "stream" => stream.to_string(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "nats_function_handler_duration_seconds",
            "function" => self.function.clone(),
            "stream" => stream.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a handler invocation that failed or panicked
    pub fn handler_failed(&self, stream: &str, kind: &'static str) {
        counter!(
            "nats_function_handler_calls_total",
            "function" => self.function.clone(),
            "stream" => stream.to_string(),
            "status" => kind
        )
        .increment(1);
    }

    /// Record an acknowledgment outcome (`ack` or `nak`)
    pub fn settled(&self, stream: &str, outcome: &'static str) {
        counter!(
            "nats_function_messages_settled_total",
            "function" => self.function.clone(),
            "stream" => stream.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record a published response
    pub fn response_published(&self, subject: &str) {
        counter!(
            "nats_function_responses_total",
            "function" => self.function.clone(),
            "subject" => subject.to_string(),
            "status" => "published"
        )
        .increment(1);
    }

    /// Record a response that the broker did not accept
    pub fn response_failed(&self, subject: &str) {
        counter!(
            "nats_function_responses_total",
            "function" => self.function.clone(),
            "subject" => subject.to_string(),
            "status" => "failed"
        )
        .increment(1);
    }

    pub fn connection_attempt(&self) {
        counter!(
            "nats_function_connection_attempts_total",
            "function" => self.function.clone()
        )
        .increment(1);
    }

    pub fn connection_failed(&self) {
        counter!(
            "nats_function_connection_failures_total",
            "function" => self.function.clone()
        )
        .increment(1);
    }

    /// Record a completed reconnect cycle
    pub fn reconnected(&self) {
        counter!(
            "nats_function_reconnects_total",
            "function" => self.function.clone()
        )
        .increment(1);
    }
}
