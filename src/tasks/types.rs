use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Idle,
    Running,
    Cancelling,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskCompletionStatus {
    Completed,
    Failed,
    Cancelled,
    Aborted,
}

/// Outcome of one run of a scheduled task, persisted per worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: String,
    pub key: String,
    pub name: String,
    #[serde(rename = "startTimeUtc")]
    pub start_time_utc: DateTime<Utc>,
    #[serde(rename = "endTimeUtc")]
    pub end_time_utc: DateTime<Utc>,
    pub status: TaskCompletionStatus,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
    #[serde(rename = "longErrorMessage", default)]
    pub long_error_message: Option<String>,
}

impl TaskResult {
    pub fn duration(&self) -> chrono::Duration {
        self.end_time_utc - self.start_time_utc
    }
}

/// Per-run options supplied by the caller or by the firing trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(rename = "maxRuntimeMs", default)]
    pub max_runtime_ms: Option<u64>,
}

impl TaskOptions {
    pub fn with_max_runtime(max_runtime: Duration) -> Self {
        Self {
            max_runtime_ms: Some(max_runtime.as_millis() as u64),
        }
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Daily,
    Weekly,
    Interval,
    Startup,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Interval => "interval",
            Self::Startup => "startup",
        };
        f.pad(s)
    }
}

/// Durable trigger descriptor. Which optional fields are required depends on
/// `kind`; validation happens when the live trigger is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTriggerInfo {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(rename = "timeOfDayMs", default, skip_serializing_if = "Option::is_none")]
    pub time_of_day_ms: Option<u64>,
    #[serde(rename = "intervalMs", default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(rename = "dayOfWeek", default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<Weekday>,
    #[serde(rename = "maxRuntimeMs", default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_ms: Option<u64>,
}

impl TaskTriggerInfo {
    fn bare(kind: TriggerKind) -> Self {
        Self {
            kind,
            time_of_day_ms: None,
            interval_ms: None,
            day_of_week: None,
            max_runtime_ms: None,
        }
    }

    pub fn daily(hour: u32, minute: u32) -> Self {
        Self {
            time_of_day_ms: Some(time_of_day_ms(hour, minute)),
            ..Self::bare(TriggerKind::Daily)
        }
    }

    pub fn weekly(day: Weekday, hour: u32, minute: u32) -> Self {
        Self {
            time_of_day_ms: Some(time_of_day_ms(hour, minute)),
            day_of_week: Some(day),
            ..Self::bare(TriggerKind::Weekly)
        }
    }

    pub fn interval(every: Duration) -> Self {
        Self {
            interval_ms: Some(every.as_millis() as u64),
            ..Self::bare(TriggerKind::Interval)
        }
    }

    pub fn startup() -> Self {
        Self::bare(TriggerKind::Startup)
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime_ms = Some(max_runtime.as_millis() as u64);
        self
    }
}

fn time_of_day_ms(hour: u32, minute: u32) -> u64 {
    (u64::from(hour) * 3600 + u64::from(minute) * 60) * 1000
}

/// Snapshot of a worker for listing.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub key: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub state: TaskState,
    #[serde(rename = "currentProgress")]
    pub current_progress: Option<f64>,
    #[serde(rename = "lastExecutionResult")]
    pub last_execution_result: Option<TaskResult>,
    pub triggers: Vec<TaskTriggerInfo>,
    #[serde(rename = "isHidden")]
    pub is_hidden: bool,
}
