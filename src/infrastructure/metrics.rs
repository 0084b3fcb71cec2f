//! Prometheus metrics

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Install the Prometheus exporter serving `/metrics` on `listen`
///
/// Must run inside a tokio runtime.
pub fn init_metrics(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .set_buckets_for_metric(
            Matcher::Full("turn_allocation_duration_seconds".to_string()),
            &[1.0, 10.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0],
        )?
        .install()?;

    describe_gauge!(
        "turn_active_allocations",
        "Number of live TURN allocations"
    );
    describe_counter!(
        "turn_allocations_total",
        "Total number of allocations created"
    );
    describe_histogram!(
        "turn_allocation_duration_seconds",
        "How long allocations lived"
    );
    describe_counter!(
        "turn_requests_total",
        "TURN requests handled, by method and result"
    );
    describe_counter!(
        "turn_relayed_packets_total",
        "Packets relayed, by direction"
    );
    describe_counter!(
        "turn_relayed_bytes_total",
        "Bytes relayed, by direction"
    );
    describe_counter!(
        "turn_dropped_packets_total",
        "Packets dropped, by reason"
    );

    info!("Metrics exporter listening on {}", listen);
    Ok(())
}

/// Direction of relayed traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToPeer,
    ToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ToPeer => "to_peer",
            Direction::ToClient => "to_client",
        }
    }
}

pub fn record_request(method: &'static str, code: Option<u16>) {
    let result = code.map_or_else(|| "success".to_string(), |code| code.to_string());
    counter!("turn_requests_total", "method" => method, "result" => result).increment(1);
}

pub fn record_allocation_created(active: usize) {
    counter!("turn_allocations_total").increment(1);
    gauge!("turn_active_allocations").set(active as f64);
}

pub fn record_allocation_released(active: usize, lived: Duration) {
    gauge!("turn_active_allocations").set(active as f64);
    histogram!("turn_allocation_duration_seconds").record(lived.as_secs_f64());
}

pub fn record_relayed(direction: Direction, bytes: usize) {
    counter!("turn_relayed_packets_total", "direction" => direction.as_str()).increment(1);
    counter!("turn_relayed_bytes_total", "direction" => direction.as_str()).increment(bytes as u64);
}

pub fn record_dropped(reason: &'static str) {
    counter!("turn_dropped_packets_total", "reason" => reason).increment(1);
}
