// Centralized metric name constants for the storage crate (WAL, snapshots, collapse).

#[derive(Debug, Clone, Copy)]
pub struct Metric {
    pub name: &'static str,
    pub description: &'static str,
}

// WAL metrics
pub const WAL_APPEND_TOTAL: Metric = Metric {
    name: "halyard_wal_append_total",
    description: "Total number of entries appended to the WAL",
};

pub const WAL_APPEND_BYTES_TOTAL: Metric = Metric {
    name: "halyard_wal_append_bytes_total",
    description: "Total bytes appended to the WAL",
};

pub const WAL_FSYNC_TOTAL: Metric = Metric {
    name: "halyard_wal_fsync_total",
    description: "Total number of WAL group commits (write + sync_data)",
};

pub const WAL_FSYNC_LATENCY_MS: Metric = Metric {
    name: "halyard_wal_fsync_latency_ms",
    description: "Latency of one WAL group commit",
};

pub const WAL_SEGMENT_ROTATE_TOTAL: Metric = Metric {
    name: "halyard_wal_segment_rotate_total",
    description: "Total number of WAL segment rotations",
};

pub const WAL_SEGMENT_DELETE_TOTAL: Metric = Metric {
    name: "halyard_wal_segment_delete_total",
    description: "Total number of WAL segments deleted (reason={collapse,truncate,reset})",
};

pub const WAL_RECOVERY_TRUNCATED_BYTES: Metric = Metric {
    name: "halyard_wal_recovery_truncated_bytes_total",
    description: "Bytes of torn or corrupt tail dropped during WAL recovery",
};

// Snapshot and collapse metrics
pub const SNAPSHOT_INSTALL_TOTAL: Metric = Metric {
    name: "halyard_snapshot_install_total",
    description: "Total number of snapshots installed as active (source={collapse,remote})",
};

pub const COLLAPSE_TOTAL: Metric = Metric {
    name: "halyard_collapse_total",
    description: "Total number of collapse attempts (result={ok,error,rejected})",
};

pub const COLLAPSE_LATENCY_MS: Metric = Metric {
    name: "halyard_collapse_latency_ms",
    description: "Duration of a successful collapse",
};

pub const COUNTERS: &[Metric] = &[
    WAL_APPEND_TOTAL,
    WAL_APPEND_BYTES_TOTAL,
    WAL_FSYNC_TOTAL,
    WAL_SEGMENT_ROTATE_TOTAL,
    WAL_SEGMENT_DELETE_TOTAL,
    WAL_RECOVERY_TRUNCATED_BYTES,
    SNAPSHOT_INSTALL_TOTAL,
    COLLAPSE_TOTAL,
];

pub const HISTOGRAMS: &[Metric] = &[WAL_FSYNC_LATENCY_MS, COLLAPSE_LATENCY_MS];

/// Register descriptions for every storage metric with the installed recorder.
pub fn describe_metrics() {
    for metric in COUNTERS {
        metrics::describe_counter!(metric.name, metric.description);
    }
    for metric in HISTOGRAMS {
        metrics::describe_histogram!(metric.name, metric.description);
    }
}
