//! Prometheus metrics for allocation and redemption.
//!
//! Recorded metrics:
//! - `allocations_total{outcome}` and `allocation_duration_seconds`
//! - `tickets_issued_total`
//! - `redemptions_total{outcome}` and `redemption_duration_seconds`
//! - `lock_timeouts_total{operation}`
//! - `credential_collisions_total`
//! - `ticket_render_failures_total`
//!
//! # Example
//!
//! ```rust,no_run
//! use boxoffice_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

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

/// Prometheus metrics recorder with a render handle.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the scrape endpoint is advertised on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder that is
    /// already installed (common in tests) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Allocation
    describe_counter!(
        "allocations_total",
        "Allocation requests by outcome (allocated or the error label)"
    );
    describe_counter!("tickets_issued_total", "Tickets committed by allocations");
    describe_histogram!(
        "allocation_duration_seconds",
        "Time from request to commit or rejection"
    );
    describe_counter!(
        "credential_collisions_total",
        "Credential draws that hit an existing credential"
    );

    // Redemption
    describe_counter!(
        "redemptions_total",
        "Scan attempts by classification (accepted, already_redeemed, unknown)"
    );
    describe_histogram!(
        "redemption_duration_seconds",
        "Time from scan to committed classification"
    );

    // Contention
    describe_counter!(
        "lock_timeouts_total",
        "Transactions abandoned because a lock was not granted in time"
    );

    // Rendering
    describe_counter!(
        "ticket_render_failures_total",
        "Post-commit ticket renders that failed"
    );
}

/// Allocation metrics recorder.
pub struct AllocationMetrics;

impl AllocationMetrics {
    /// Record a finished allocation request.
    pub fn record(outcome: &'static str, duration: Duration, tickets: usize) {
        counter!("allocations_total", "outcome" => outcome).increment(1);
        histogram!("allocation_duration_seconds").record(duration.as_secs_f64());
        if tickets > 0 {
            counter!("tickets_issued_total").increment(tickets as u64);
        }
    }

    /// Record a credential collision.
    pub fn record_collision() {
        counter!("credential_collisions_total").increment(1);
    }
}

/// Redemption metrics recorder.
pub struct RedemptionMetrics;

impl RedemptionMetrics {
    /// Record a committed scan classification.
    pub fn record(outcome: &'static str, duration: Duration) {
        counter!("redemptions_total", "outcome" => outcome).increment(1);
        histogram!("redemption_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Lock contention metrics recorder.
pub struct LockMetrics;

impl LockMetrics {
    /// Record a lock timeout for an operation (`allocate` or `redeem`).
    pub fn record_timeout(operation: &'static str) {
        counter!("lock_timeouts_total", "operation" => operation).increment(1);
    }
}

/// Ticket rendering metrics recorder.
pub struct RenderMetrics;

impl RenderMetrics {
    /// Record a failed post-commit render.
    pub fn record_failure() {
        counter!("ticket_render_failures_total").increment(1);
    }
}
