use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bunkhouse_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bunkhouse_query_duration_seconds";

// ── Connections and properties ──────────────────────────────────

/// Gauge: open TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bunkhouse_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bunkhouse_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bunkhouse_connections_rejected_total";

/// Gauge: properties with a loaded engine.
pub const PROPERTIES_ACTIVE: &str = "bunkhouse_properties_active";

// ── Booking ─────────────────────────────────────────────────────

/// Counter: reservations durably committed.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "bunkhouse_reservations_committed_total";

/// Counter: reservations rejected because a bed was taken under lock.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "bunkhouse_reservation_conflicts_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bunkhouse_wal_flush_duration_seconds";

/// Histogram: commit batches per flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "bunkhouse_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. Does nothing without a port.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::InsertBeds { .. } => "insert_beds",
        Command::InsertFacility { .. } => "insert_facility",
        Command::InsertPhoto { .. } => "insert_photo",
        Command::InsertGuest { .. } => "insert_guest",
        Command::InsertTransaction { .. } => "insert_transaction",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SelectRooms => "select_rooms",
        Command::SelectAvailableRooms { .. } => "select_available_rooms",
        Command::SelectAvailableBeds { .. } => "select_available_beds",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservationTransaction { .. } => "select_reservation_transaction",
    }
}
