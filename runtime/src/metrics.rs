//! Prometheus metrics.
//!
//! Runtime components record through the `metrics` facade; nothing is
//! exported until a recorder is installed. [`MetricsServer`] installs the
//! Prometheus recorder and describes every `conduit_*` metric:
//!
//! - exchanges and per-processor durations (scheduler)
//! - redeliveries and dead letters (error handler)
//! - breaker transitions, fallbacks and timeouts (resilience)
//! - load balancer selections and browse evictions
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! let text = server.render().unwrap_or_default();
//! # let _ = text;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder and its scrape address.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server for `addr`. Nothing is installed until [`start`](Self::start).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe metrics and install the Prometheus recorder.
    ///
    /// An already installed recorder is tolerated with a warning; the
    /// server then has no handle and [`render`](Self::render) returns `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Scrape address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The recorder handle, once started.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every metric the runtime records.
pub fn register_metrics() {
    // Scheduler
    describe_counter!("conduit_exchanges_total", "Exchanges driven through a route");
    describe_counter!(
        "conduit_exchanges_failed_total",
        "Exchanges that completed with a failure"
    );
    describe_histogram!(
        "conduit_processing_duration_seconds",
        "Time spent in a processor, labelled by processor"
    );

    // Error handler
    describe_counter!("conduit_redeliveries_total", "Redelivery attempts");
    describe_counter!(
        "conduit_redelivery_exhausted_total",
        "Exchanges whose redeliveries were exhausted"
    );
    describe_counter!("conduit_dlq_pushed_total", "Exchanges pushed to a dead letter queue");
    describe_counter!(
        "conduit_dlq_dropped_total",
        "Dead letters dropped because the queue was full"
    );
    describe_gauge!("conduit_dlq_size", "Current dead letter queue size");

    // Resilience
    describe_counter!(
        "conduit_circuit_breaker_state_changes_total",
        "Circuit breaker transitions, labelled by breaker, from and to"
    );
    describe_counter!(
        "conduit_resilience_fallbacks_total",
        "Fallbacks run after a failed, rejected or timed out command"
    );
    describe_counter!(
        "conduit_resilience_timeouts_total",
        "Commands that exceeded their timeout"
    );

    // Service call
    describe_counter!(
        "conduit_load_balancer_selections_total",
        "Service instances chosen, labelled by service"
    );

    // Browse
    describe_counter!(
        "conduit_browse_evicted_total",
        "Exchanges evicted from full browse buffers"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_requires_start() {
        let server = MetricsServer::new("127.0.0.1:9090".parse().unwrap());

        assert!(server.render().is_none());
        assert_eq!(server.addr().port(), 9090);
    }
}
