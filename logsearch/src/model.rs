use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use topology::types::NodeKind;

pub type TaskGroupId = i64;
pub type TaskId = i64;

/// Maximum number of preview lines kept per task, and returned by a merged preview.
pub const TASK_MAX_PREVIEW_LINES: usize = 500;

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStateError {
    kind: &'static str,
    value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Running,
    Finished,
}

impl GroupState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            GroupState::Running => "running",
            GroupState::Finished => "finished",
        }
    }
}

impl FromStr for GroupState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(GroupState::Running),
            "finished" => Ok(GroupState::Finished),
            _ => Err(ParseStateError {
                kind: "group state",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Finished,
    Canceled,
    Error,
}

impl TaskState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Canceled => "canceled",
            TaskState::Error => "error",
        }
    }
}

impl FromStr for TaskState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TaskState::Running),
            "finished" => Ok(TaskState::Finished),
            "canceled" => Ok(TaskState::Canceled),
            "error" => Ok(TaskState::Error),
            _ => Err(ParseStateError {
                kind: "task state",
                value: s.to_string(),
            }),
        }
    }
}

/// Log levels as numbered by the diagnostics service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Unknown = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Trace = 4,
    Critical = 5,
    Error = 6,
}

impl LogLevel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Trace,
            5 => LogLevel::Critical,
            6 => LogLevel::Error,
            _ => LogLevel::Unknown,
        }
    }

    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Position on the severity scale, lowest first.
    fn severity(&self) -> u8 {
        match self {
            LogLevel::Unknown => 0,
            LogLevel::Trace => 1,
            LogLevel::Debug => 2,
            LogLevel::Info => 3,
            LogLevel::Warn => 4,
            LogLevel::Error => 5,
            LogLevel::Critical => 6,
        }
    }

    /// All known levels at least as severe as `min`.
    pub fn at_least(min: LogLevel) -> Vec<LogLevel> {
        [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
            LogLevel::Critical,
        ]
        .into_iter()
        .filter(|l| l.severity() >= min.severity())
        .collect()
    }

    pub const fn label(&self) -> &'static str {
        match self {
            LogLevel::Unknown => "UNKNOWN",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Trace => "TRACE",
            LogLevel::Critical => "CRITICAL",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What to search for. Times are unix milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchLogRequest {
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default = "default_min_level")]
    pub min_level: LogLevel,
    #[serde(default)]
    pub patterns: Vec<String>,
}

fn default_min_level() -> LogLevel {
    LogLevel::Info
}

/// A node to search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub kind: NodeKind,
    pub ip: String,
    pub port: u16,
    pub status_port: u16,
}

impl Target {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Name of the bundle file holding this target's logs.
    pub fn bundle_filename(&self) -> String {
        format!("{}-{}.zip", self.ip, self.port)
    }

    /// Name offered to the operator when a single bundle is downloaded.
    pub fn download_filename(&self) -> String {
        format!("logs-{}-{}-{}.zip", self.kind, self.ip, self.port)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetStats {
    pub num_coordinator_nodes: usize,
    pub num_sql_nodes: usize,
    pub num_kv_nodes: usize,
}

impl TargetStats {
    pub fn from_targets(targets: &[Target]) -> Self {
        let mut stats = TargetStats::default();
        for target in targets {
            match target.kind {
                NodeKind::Coordinator => stats.num_coordinator_nodes += 1,
                NodeKind::Sql => stats.num_sql_nodes += 1,
                NodeKind::Kv => stats.num_kv_nodes += 1,
            }
        }
        stats
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: TaskGroupId,
    pub search_request: SearchLogRequest,
    pub state: GroupState,
    pub target_stats: TargetStats,
    /// Unix milliseconds.
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_group_id: TaskGroupId,
    pub target: Target,
    pub state: TaskState,
    pub error: Option<String>,
    pub log_store_path: Option<String>,
    pub slow_log_store_path: Option<String>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviewRow {
    pub task_id: TaskId,
    pub task_group_id: TaskGroupId,
    pub time: i64,
    pub level: LogLevel,
    pub message: String,
}

/// One line received from a node.
#[derive(Clone, Debug, PartialEq)]
pub struct LogMessage {
    pub time: i64,
    pub level: LogLevel,
    pub message: String,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_at_least() {
        assert_eq!(
            LogLevel::at_least(LogLevel::Warn),
            vec![LogLevel::Warn, LogLevel::Error, LogLevel::Critical]
        );
        assert_eq!(LogLevel::at_least(LogLevel::Unknown).len(), 6);
        assert_eq!(LogLevel::from_u8(6), LogLevel::Error);
        assert_eq!(LogLevel::from_u8(42), LogLevel::Unknown);
        assert_eq!(LogLevel::Warn.as_u8(), 3);
    }

    #[test]
    fn test_state_parse() {
        assert_eq!("canceled".parse::<TaskState>(), Ok(TaskState::Canceled));
        assert_eq!("finished".parse::<GroupState>(), Ok(GroupState::Finished));
        assert!("paused".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_target_stats() {
        let target = |kind| Target {
            kind,
            ip: "10.0.0.1".into(),
            port: 1,
            status_port: 2,
        };
        let stats = TargetStats::from_targets(&[
            target(NodeKind::Sql),
            target(NodeKind::Kv),
            target(NodeKind::Kv),
        ]);
        assert_eq!(stats.num_sql_nodes, 1);
        assert_eq!(stats.num_kv_nodes, 2);
        assert_eq!(stats.num_coordinator_nodes, 0);
    }

    #[test]
    fn test_request_defaults() {
        let request: SearchLogRequest =
            serde_json::from_str(r#"{"start_time": 1, "end_time": 2}"#).unwrap();
        assert_eq!(request.min_level, LogLevel::Info);
        assert!(request.patterns.is_empty());
    }
}
