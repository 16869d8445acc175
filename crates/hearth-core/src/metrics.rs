//! Prometheus metrics helpers for the hearth engine.
//!
//! Components record metrics through the `metrics` facade at the point of
//! work; this module installs the Prometheus recorder, describes every
//! metric the engine emits, and serves `/metrics`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use hearth_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`engine_`, `repository_`, `coalescer_`, ...)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only low-cardinality values (never peer URLs or ids)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_engine_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed,
/// instead of panicking. Useful for tests or optional metrics.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_engine_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds the listener before returning so port conflicts surface to the
/// caller, then serves `/metrics` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for every metric the engine emits.
///
/// Called automatically by [`init_metrics`].
fn register_engine_metrics() {
    // =========================================================================
    // Ingestion
    // =========================================================================

    describe_counter!(
        "engine_events_received_total",
        "Events delivered by peers (before verification and dedupe)"
    );
    describe_counter!(
        "engine_events_accepted_total",
        "First-seen events that passed verification"
    );
    describe_counter!(
        "engine_events_duplicate_total",
        "Events already seen from some peer"
    );
    describe_counter!(
        "engine_events_invalid_total",
        "Events rejected as malformed or unverifiable (label: reason)"
    );
    describe_counter!(
        "engine_notifications_lagged_total",
        "Relay pool notifications dropped because the router fell behind"
    );

    // =========================================================================
    // Repository
    // =========================================================================

    describe_counter!("repository_events_added_total", "Events added to the repository");
    describe_counter!(
        "repository_events_removed_total",
        "Events removed by replacement or deletion"
    );
    describe_counter!(
        "repository_events_stale_total",
        "Events ignored as older than the held version or tombstone"
    );
    describe_counter!("repository_tombstones_total", "Tombstones installed");
    describe_gauge!("repository_live_events", "Live records in the repository");
    describe_counter!(
        "store_diffs_flushed_total",
        "Debounced diff batches delivered to subscribers"
    );

    // =========================================================================
    // Request coalescing
    // =========================================================================

    describe_counter!("coalescer_requests_total", "Logical load requests enqueued");
    describe_counter!("coalescer_flushes_total", "Request queue flushes");
    describe_counter!(
        "coalescer_queries_total",
        "Physical queries sent to peers (one per peer per flush)"
    );
    describe_counter!(
        "coalescer_peer_timeouts_total",
        "Peers force-closed after exceeding a request timeout"
    );
    describe_histogram!(
        "coalescer_query_duration_seconds",
        "Time from sending a query to its completion"
    );

    // =========================================================================
    // Projections
    // =========================================================================

    describe_counter!(
        "projection_events_dispatched_total",
        "Events dispatched to projection handlers"
    );
    describe_counter!("projection_unwrapped_total", "Container events unwrapped");
    describe_counter!(
        "projection_decrypt_miss_total",
        "Container events with no usable key"
    );

    // =========================================================================
    // Feeds
    // =========================================================================

    describe_counter!("feed_notes_total", "Notes added to feeds");
    describe_counter!("feed_orphans_deferred_total", "Replies shown before their parent");
    describe_counter!(
        "feed_ancient_deferred_total",
        "Stale notes held back from a recent batch"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
///
/// Convenience wrapper around `metrics::counter!`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
///
/// Convenience wrapper around `metrics::gauge!`.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // Ensure metrics are initialized exactly once for all tests
    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        ensure_metrics_init();
        increment("test_counter", 0);
        increment("test_counter", 100);
        set_gauge("test_gauge", -1.0);
        set_gauge("test_gauge", f64::MAX);
    }

    #[test]
    fn test_register_engine_metrics_is_repeatable() {
        ensure_metrics_init();
        register_engine_metrics();
        register_engine_metrics();
    }
}
