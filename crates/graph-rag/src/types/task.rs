//! Background task records and their progress log

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of work a task performs; `operation_id` points at a document or a KB
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ParseDocument,
    ParseTemporaryDocument,
    ImportKb,
    ExportKb,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseDocument => "parse_document",
            Self::ParseTemporaryDocument => "parse_temporary_document",
            Self::ImportKb => "import_kb",
            Self::ExportKb => "export_kb",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parse_document" => Some(Self::ParseDocument),
            "parse_temporary_document" => Some(Self::ParseTemporaryDocument),
            "import_kb" => Some(Self::ImportKb),
            "export_kb" => Some(Self::ExportKb),
            _ => None,
        }
    }

    /// Number of reported stages for a run of this task
    pub fn stage_count(&self) -> u32 {
        match self {
            Self::ParseDocument | Self::ParseTemporaryDocument => 6,
            Self::ImportKb => 4,
            Self::ExportKb => 3,
        }
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Terminal states never re-enter `pending`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled | Self::Deleted)
    }
}

/// Operator or scheduler action applied through `restart_or_clear`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Retry the task if it has retries left, else fail it
    Restart,
    /// Stop the task; terminal status `canceled`
    Cancel,
    /// Stop the task; terminal status `deleted`
    Delete,
    /// Stop a task whose failure is not worth retrying; terminal status `failed`
    Fail,
}

/// A unit of background work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub retry: u32,
    /// Free-form payload (e.g. source blob id of a KB import)
    pub payload: Option<serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    pub fn new(operation_id: Uuid, task_type: TaskType) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            operation_id,
            task_type,
            status: TaskStatus::Pending,
            retry: 0,
            payload: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Append-only progress entry of a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusReport {
    pub task_id: Uuid,
    pub message: String,
    pub current_stage: u32,
    pub stage_count: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TaskStatusReport {
    pub fn new(task_id: Uuid, message: impl Into<String>, current_stage: u32, stage_count: u32) -> Self {
        Self {
            task_id,
            message: message.into(),
            current_stage,
            stage_count,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Durable FIFO queues consumed by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Pending,
    Success,
    Restart,
    SilentError,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Pending,
        QueueName::Success,
        QueueName::Restart,
        QueueName::SilentError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Restart => "restart",
            Self::SilentError => "silent-error",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
