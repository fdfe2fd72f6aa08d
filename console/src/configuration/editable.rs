use super::ItemKind;

const COORDINATOR_KEYS: &[&str] = &[
    "replication.max-replicas",
    "schedule.hot-region-schedule-limit",
    "schedule.leader-schedule-limit",
    "schedule.max-merge-region-keys",
    "schedule.max-merge-region-size",
    "schedule.max-pending-peer-count",
    "schedule.max-snapshot-count",
    "schedule.max-store-down-time",
    "schedule.merge-schedule-limit",
    "schedule.region-schedule-limit",
    "schedule.replica-schedule-limit",
];

const KV_KEYS: &[&str] = &[
    "coprocessor.region-max-size",
    "coprocessor.region-split-size",
    "coprocessor.split-region-on-table",
    "gc.batch-keys",
    "gc.max-write-bytes-per-sec",
    "gc.ratio-threshold",
    "raftstore.raft-log-gc-count-limit",
    "raftstore.raft-log-gc-threshold",
    "raftstore.split-region-check-tick-interval",
    "rocksdb.max-background-jobs",
    "storage.block-cache.capacity",
];

const SQL_GLOBAL_KEYS: &[&str] = &[
    "max_execution_time",
    "tidb_auto_analyze_end_time",
    "tidb_auto_analyze_ratio",
    "tidb_auto_analyze_start_time",
    "tidb_build_stats_concurrency",
    "tidb_distsql_scan_concurrency",
    "tidb_gc_life_time",
    "tidb_gc_run_interval",
    "tidb_index_lookup_concurrency",
    "tidb_slow_log_threshold",
];

/// Global variable names end up inside a `SET GLOBAL` statement.
fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

pub fn is_editable(kind: ItemKind, id: &str) -> bool {
    match kind {
        ItemKind::CoordinatorConfig => COORDINATOR_KEYS.contains(&id),
        ItemKind::KvNodeConfig => KV_KEYS.contains(&id),
        ItemKind::SqlGlobalVariable => is_identifier(id) && SQL_GLOBAL_KEYS.contains(&id),
        ItemKind::SqlNodeConfig => false,
    }
}
