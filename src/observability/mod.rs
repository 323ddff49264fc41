// src/observability/mod.rs
//! Logging and metrics
//!
//! Logging goes through `tracing`; the subscriber is installed once per
//! process and later calls are no-ops so that several engines (or the C
//! ABI and a host application) can coexist. Metrics use the `metrics`
//! facade and are exported to Prometheus only when a listen address is
//! configured.

use crate::utils::config::{LogFormat, TelemetryConfig};
use crate::utils::errors::{EngineError, Result};
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

pub const BID_REQUESTS_RECEIVED: &str = "rtb_bid_requests_received_total";
pub const BID_REQUESTS_DISPATCHED: &str = "rtb_bid_requests_dispatched_total";
pub const BID_REQUESTS_UNMATCHED: &str = "rtb_bid_requests_unmatched_total";
pub const BID_REQUESTS_EXPIRED: &str = "rtb_bid_requests_expired_total";
pub const BID_REQUESTS_DUPLICATE: &str = "rtb_bid_requests_duplicate_total";
pub const BID_RESPONSES_FORWARDED: &str = "rtb_bid_responses_forwarded_total";
pub const BID_RESPONSES_REJECTED: &str = "rtb_bid_responses_rejected_total";
pub const NOTIFICATIONS_ROUTED: &str = "rtb_notifications_routed_total";
pub const NOTIFICATIONS_UNROUTED: &str = "rtb_notifications_unrouted_total";
pub const QUEUE_OVERFLOWS: &str = "rtb_queue_overflow_total";
pub const PROTOCOL_ERRORS: &str = "rtb_protocol_errors_total";
pub const TRANSPORT_RECONNECTS: &str = "rtb_transport_reconnects_total";
pub const REGISTERED_AGENTS: &str = "rtb_registered_agents";
pub const PENDING_EVENTS: &str = "rtb_pending_events";

static METRICS_INSTALLED: OnceCell<()> = OnceCell::new();

/// Install the global tracing subscriber if none is set yet
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init(),
    };

    if let Err(e) = result {
        debug!("Tracing subscriber already installed: {}", e);
    }

    Ok(())
}

/// Start the Prometheus exporter when `prometheus_listen` is configured.
///
/// Must be called from within a Tokio runtime context. Returns `true` when
/// this call installed the exporter.
pub fn init_metrics(config: &TelemetryConfig) -> Result<bool> {
    let Some(listen) = config.prometheus_listen.as_deref() else {
        return Ok(false);
    };

    if METRICS_INSTALLED.get().is_some() {
        debug!("Metrics exporter already installed");
        return Ok(false);
    }

    let addr: SocketAddr = listen.parse().map_err(|e| {
        EngineError::Config(format!("invalid prometheus_listen {}: {}", listen, e))
    })?;

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            let _ = METRICS_INSTALLED.set(());
            describe_metrics();
            info!("Prometheus exporter listening on {}", addr);
            Ok(true)
        }
        Err(e) => {
            warn!("Failed to install Prometheus exporter: {}", e);
            Err(EngineError::Config(format!("metrics exporter: {}", e)))
        }
    }
}

fn describe_metrics() {
    describe_counter!(BID_REQUESTS_RECEIVED, Unit::Count, "Bid requests received from exchanges");
    describe_counter!(BID_REQUESTS_DISPATCHED, Unit::Count, "Bid request copies delivered to agents");
    describe_counter!(BID_REQUESTS_UNMATCHED, Unit::Count, "Bid requests no agent subscribed to");
    describe_counter!(BID_REQUESTS_EXPIRED, Unit::Count, "Bid requests past deadline on arrival");
    describe_counter!(BID_REQUESTS_DUPLICATE, Unit::Count, "Bid requests whose auction id was already live on that exchange");
    describe_counter!(BID_RESPONSES_FORWARDED, Unit::Count, "Bid responses forwarded to exchanges");
    describe_counter!(BID_RESPONSES_REJECTED, Unit::Count, "Bid responses rejected as stale or over limits");
    describe_counter!(NOTIFICATIONS_ROUTED, Unit::Count, "Win/loss notifications delivered");
    describe_counter!(NOTIFICATIONS_UNROUTED, Unit::Count, "Win/loss notifications with no bidder");
    describe_counter!(QUEUE_OVERFLOWS, Unit::Count, "Events rejected by full agent queues");
    describe_counter!(PROTOCOL_ERRORS, Unit::Count, "Malformed wire messages");
    describe_counter!(TRANSPORT_RECONNECTS, Unit::Count, "Exchange reconnect attempts");
    describe_gauge!(REGISTERED_AGENTS, Unit::Count, "Agents currently registered");
    describe_gauge!(PENDING_EVENTS, Unit::Count, "Events queued across all agents");
}
