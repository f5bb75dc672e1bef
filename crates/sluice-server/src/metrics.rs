//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Command deliveries dropped because a connection could not keep up (counter).
pub const WS_DELIVERY_DROPS_TOTAL: &str = "ws_delivery_drops_total";
/// Events fanned out to the connection registry (counter).
pub const EVENTS_BROADCAST_TOTAL: &str = "events_broadcast_total";
/// Event frames delivered to clients, replay and live combined (counter).
pub const EVENTS_DELIVERED_TOTAL: &str = "events_delivered_total";
/// Replay reads started (counter).
pub const REPLAYS_TOTAL: &str = "replays_total";
/// Replay reads that failed (counter).
pub const REPLAY_FAILURES_TOTAL: &str = "replay_failures_total";
/// Replay read duration seconds (histogram).
pub const REPLAY_DURATION_SECONDS: &str = "replay_duration_seconds";
/// Subscriptions dropped for exceeding the replay buffer (counter).
pub const BUFFER_OVERFLOWS_TOTAL: &str = "buffer_overflows_total";
/// Connections closed for missing a pong deadline (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "heartbeat_timeouts_total";
/// Subscriptions currently in live delivery (gauge).
pub const STREAMS_LIVE: &str = "streams_live";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_render() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();

        // Should produce valid (possibly empty) Prometheus text.
        let output = handle.render();
        // Empty or contains valid text; either way no panic.
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_DELIVERY_DROPS_TOTAL,
            EVENTS_BROADCAST_TOTAL,
            EVENTS_DELIVERED_TOTAL,
            REPLAYS_TOTAL,
            REPLAY_FAILURES_TOTAL,
            REPLAY_DURATION_SECONDS,
            BUFFER_OVERFLOWS_TOTAL,
            HEARTBEAT_TIMEOUTS_TOTAL,
            STREAMS_LIVE,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
