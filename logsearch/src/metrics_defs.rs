use shared::metrics_defs::{MetricDef, MetricType};

pub const LOG_TASKS_STARTED: MetricDef = MetricDef {
    name: "logsearch.tasks.started",
    metric_type: MetricType::Counter,
    description: "Number of log search tasks started. Tagged with node_kind.",
};

pub const LOG_TASKS_COMPLETED: MetricDef = MetricDef {
    name: "logsearch.tasks.completed",
    metric_type: MetricType::Counter,
    description: "Number of log search tasks that stopped running. Tagged with state.",
};

pub const LOG_PREVIEW_ROWS: MetricDef = MetricDef {
    name: "logsearch.preview.rows",
    metric_type: MetricType::Counter,
    description: "Number of preview rows persisted",
};

pub const LOG_TASKS_RUNNING: MetricDef = MetricDef {
    name: "logsearch.tasks.running",
    metric_type: MetricType::Gauge,
    description: "Number of log search tasks currently running",
};

pub const LOG_TASK_DURATION: MetricDef = MetricDef {
    name: "logsearch.task.duration",
    metric_type: MetricType::Histogram,
    description: "Duration of a log search task in seconds. Tagged with state.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    LOG_TASKS_STARTED,
    LOG_TASKS_COMPLETED,
    LOG_PREVIEW_ROWS,
    LOG_TASKS_RUNNING,
    LOG_TASK_DURATION,
];
