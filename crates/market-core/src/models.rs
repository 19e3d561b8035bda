use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task lifecycle states. A task is born `queued`, bounces between `queued`
/// and `assigned` while workers claim and abandon it, and terminates in
/// `finalized` (quorum reached) or `failed` (attempt budget exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Finalized,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Finalized => "finalized",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "queued" => Ok(TaskStatus::Queued),
            "assigned" => Ok(TaskStatus::Assigned),
            "finalized" => Ok(TaskStatus::Finalized),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::Decode {
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Stale,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Stale => "stale",
            WorkerStatus::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "active" => Ok(WorkerStatus::Active),
            "stale" => Ok(WorkerStatus::Stale),
            "offline" => Ok(WorkerStatus::Offline),
            other => Err(Error::Decode {
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// A unit of labeling work.
///
/// `status = assigned` implies `reserved_by` and `lease_expires_at` are both
/// set; `queued`, `finalized` and `failed` imply both are clear. `final_label`
/// is set exactly when the task is finalized.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub text: String,
    /// Capability tag; `None` means any worker may take it.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: TaskStatus,
    pub final_label: Option<String>,
    pub required_submissions: i64,
    pub created_at: DateTime<Utc>,
    pub reserved_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error_message: Option<String>,
}

/// Listing row: enough for a producer to track progress without the payload.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: TaskStatus,
    pub final_label: Option<String>,
    pub required_submissions: i64,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

/// One worker's answer for one task. `(task_id, worker_id)` is unique.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: i64,
    pub task_id: String,
    pub worker_id: String,
    pub label: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// `None` means the worker accepts any task type.
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerScore {
    pub worker_id: String,
    pub points: i64,
}

/// Decode the `capabilities` column (JSON array of tags, NULL = all).
pub(crate) fn decode_capabilities(raw: Option<String>) -> Result<Option<Vec<String>>, Error> {
    match raw {
        None => Ok(None),
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(caps) => Ok(Some(caps)),
            Err(_) => Err(Error::Decode {
                column: "capabilities",
                value: raw,
            }),
        },
    }
}
