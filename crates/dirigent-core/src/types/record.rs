//! Request record and task result types
//!
//! The record is the durable unit of the request lifecycle: envelope, plan,
//! per-task results, and the rolled-up status. Terminal statuses are never
//! left once reached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Envelope, ExecutionPlan};

/// Per-task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Parse a wire status string; unrecognized values yield `None`.
    pub fn parse(value: &str) -> Option<TaskStatus> {
        match value {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "canceled" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

/// Structured task failure description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }
}

/// The recorded outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub backend: String,
    pub status: TaskStatus,
    /// Vendor-side correlation id returned by the adapter, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff `status` is terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    /// Fresh result for a task that has not started.
    pub fn queued(task_id: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            backend: backend.into(),
            status: TaskStatus::Queued,
            external_id: None,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Mark this result canceled with the given reason.
    pub fn cancel(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Canceled;
        self.error = Some(TaskError::new(message));
        self.finished_at = Some(Utc::now());
    }
}

/// Request-level status rolled up from task results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Translated and stored; execution not requested
    Planned,
    /// Waiting for the runner to pick it up
    Queued,
    Running,
    Executed,
    Failed,
    Denied,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Executed | RequestStatus::Failed | RequestStatus::Denied
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Planned => "planned",
            RequestStatus::Queued => "queued",
            RequestStatus::Running => "running",
            RequestStatus::Executed => "executed",
            RequestStatus::Failed => "failed",
            RequestStatus::Denied => "denied",
        }
    }

    pub fn parse(value: &str) -> Option<RequestStatus> {
        match value {
            "planned" => Some(RequestStatus::Planned),
            "queued" => Some(RequestStatus::Queued),
            "running" => Some(RequestStatus::Running),
            "executed" => Some(RequestStatus::Executed),
            "failed" => Some(RequestStatus::Failed),
            "denied" => Some(RequestStatus::Denied),
            _ => None,
        }
    }
}

/// The durable request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub envelope: Envelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExecutionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<TaskResult>>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn new(request_id: impl Into<String>, envelope: Envelope, status: RequestStatus) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.into(),
            envelope,
            plan: None,
            results: None,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_results(mut self, results: Vec<TaskResult>) -> Self {
        self.results = Some(results);
        self
    }
}

/// Pointer from an external id back to its owning task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub request_id: String,
    pub task_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_terminality() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_task_status_parse_round_trip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("done"), None);
    }

    #[test]
    fn test_cancel_sets_terminal_fields() {
        let mut result = TaskResult::queued("t1", "aws");
        result.cancel("canceled due to failed dependency t0");
        assert_eq!(result.status, TaskStatus::Canceled);
        assert!(result.finished_at.is_some());
        assert_eq!(
            result.error.as_ref().unwrap().message,
            "canceled due to failed dependency t0"
        );
    }

    #[test]
    fn test_request_status_parse_round_trip() {
        for status in [
            RequestStatus::Planned,
            RequestStatus::Queued,
            RequestStatus::Running,
            RequestStatus::Executed,
            RequestStatus::Failed,
            RequestStatus::Denied,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
    }
}
