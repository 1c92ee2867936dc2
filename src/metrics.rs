//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Delta gossip (sent, failed, merged)
//! - Cluster membership and connected peers
//! - Change notifications
//! - Domain operation outcomes
//! - Snapshot, restore and integrity runs
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `shelter_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No exporter is installed here; the embedding process chooses one.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Gossip
// =============================================================================

/// Record a delta pushed to a neighbor.
pub fn record_delta_sent(collection: &str, peer_id: &str, entries: usize) {
    counter!("shelter_gossip_deltas_sent_total", "collection" => collection.to_string(), "peer_id" => peer_id.to_string()).increment(1);
    counter!("shelter_gossip_entries_sent_total", "collection" => collection.to_string()).increment(entries as u64);
}

/// Record a failed delta push (entries are re-staged for the next tick).
pub fn record_delta_send_failure(collection: &str, peer_id: &str) {
    counter!("shelter_gossip_send_failures_total", "collection" => collection.to_string(), "peer_id" => peer_id.to_string()).increment(1);
}

/// Record a merged remote delta.
pub fn record_delta_merged(collection: &str, received: usize, applied: usize) {
    counter!("shelter_gossip_entries_received_total", "collection" => collection.to_string()).increment(received as u64);
    counter!("shelter_gossip_entries_applied_total", "collection" => collection.to_string()).increment(applied as u64);
}

/// Record a delta dropped before merge.
pub fn record_delta_dropped(collection: &str, reason: &str) {
    counter!("shelter_gossip_deltas_dropped_total", "collection" => collection.to_string(), "reason" => reason.to_string()).increment(1);
}

/// Gauge for the neighbor set size of one replicated map.
pub fn set_neighbor_count(collection: &str, count: usize) {
    gauge!("shelter_replica_neighbors", "collection" => collection.to_string()).set(count as f64);
}

/// Gauge for the number of entries in one replicated map.
pub fn set_replica_size(collection: &str, entries: usize) {
    gauge!("shelter_replica_entries", "collection" => collection.to_string()).set(entries as f64);
}

// =============================================================================
// Topology
// =============================================================================

/// Record a membership event (`up`, `down`, `reconcile`).
pub fn record_membership_event(kind: &str) {
    counter!("shelter_membership_events_total", "kind" => kind.to_string()).increment(1);
}

/// Gauge for number of connected peers.
pub fn set_connected_peers(count: usize) {
    gauge!("shelter_connected_peers").set(count as f64);
}

/// Record a simulated partition.
pub fn record_partition_simulated(duration: Duration) {
    counter!("shelter_partitions_simulated_total").increment(1);
    histogram!("shelter_partition_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Notifications and domain
// =============================================================================

/// Record a `sync` event raised by the hash watcher.
pub fn record_sync_event(collection: &str) {
    counter!("shelter_sync_events_total", "collection" => collection.to_string()).increment(1);
}

/// Record a domain operation outcome (`ok`, `validation`, `not_found`, `rejected`).
pub fn record_domain_op(operation: &str, outcome: &str) {
    counter!(
        "shelter_domain_operations_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Persistence
// =============================================================================

/// Record a snapshot pass (`saved`, `no_changes`, `failed`).
pub fn record_snapshot(outcome: &str, duration: Duration) {
    counter!("shelter_snapshots_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("shelter_snapshot_duration_seconds").record(duration.as_secs_f64());
}

/// Record rows written for one collection in a snapshot.
pub fn record_snapshot_rows(collection: &str, rows: usize) {
    counter!("shelter_snapshot_rows_written_total", "collection" => collection.to_string()).increment(rows as u64);
}

/// Record rows restored at startup.
pub fn record_restore(collection: &str, restored: usize, skipped: usize) {
    counter!("shelter_restore_rows_total", "collection" => collection.to_string()).increment(restored as u64);
    if skipped > 0 {
        counter!("shelter_restore_rows_skipped_total", "collection" => collection.to_string()).increment(skipped as u64);
    }
}

/// Record an integrity check result.
pub fn record_integrity_check(collection: &str, passed: bool) {
    let status = if passed { "pass" } else { "fail" };
    counter!("shelter_integrity_checks_total", "collection" => collection.to_string(), "status" => status).increment(1);
}

/// Record snapshot store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("shelter_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for node state.
pub fn set_node_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        _ => -1.0,
    };
    gauge!("shelter_node_state").set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; they must not panic.
    #[test]
    fn test_metrics_without_recorder() {
        record_delta_sent("pets", "node-b", 3);
        record_delta_send_failure("pets", "node-b");
        record_delta_merged("pets", 3, 1);
        record_delta_dropped("pets", "decode");
        set_neighbor_count("pets", 2);
        set_replica_size("pets", 10);
        record_membership_event("up");
        set_connected_peers(2);
        record_partition_simulated(Duration::from_millis(50));
        record_sync_event("applications");
        record_domain_op("add_pet", "ok");
        record_snapshot("saved", Duration::from_millis(12));
        record_snapshot_rows("pets", 4);
        record_restore("pets", 4, 1);
        record_integrity_check("pets", true);
        store_retries_total("snapshot_write");
        set_node_state("Running");
        set_node_state("Unknown");
    }
}
