//! Task-management fields and the delegation state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Workflow status of a task-management record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Blocked,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "todo" => Some(TaskStatus::Todo),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "done" => Some(TaskStatus::Done),
            _ => None,
        }
    }

    pub fn all() -> &'static [TaskStatus] {
        &[
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Done,
        ]
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task priority. Ordered so that `Urgent` is the greatest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of a background delegation job.
///
/// ```text
/// queued -> running -> completed | failed | cancelled
/// queued -> cancelled | failed
/// ```
///
/// `queued -> failed` covers jobs that could not be scheduled or started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DelegationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationStatus::Queued => "queued",
            DelegationStatus::Running => "running",
            DelegationStatus::Completed => "completed",
            DelegationStatus::Failed => "failed",
            DelegationStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(DelegationStatus::Queued),
            "running" => Some(DelegationStatus::Running),
            "completed" => Some(DelegationStatus::Completed),
            "failed" => Some(DelegationStatus::Failed),
            "cancelled" => Some(DelegationStatus::Cancelled),
            _ => None,
        }
    }

    /// Queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, DelegationStatus::Queued | DelegationStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// Terminal states may be restarted by a new delegation, which always
    /// enters through `Queued`. Crash recovery moves `Running` back to
    /// `Queued`.
    pub fn can_transition_to(&self, next: DelegationStatus) -> bool {
        use DelegationStatus::*;
        match (*self, next) {
            (Queued, Running) | (Queued, Cancelled) | (Queued, Failed) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Running, Queued) | (Queued, Queued) => true,
            (Completed | Failed | Cancelled, Queued) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How much an external agent is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Read and report only
    ReadOnly,
    /// Edit files, ask before anything else
    #[default]
    Standard,
    /// No confirmations
    Autonomous,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::ReadOnly => "read_only",
            PermissionMode::Standard => "standard",
            PermissionMode::Autonomous => "autonomous",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "read_only" => Some(PermissionMode::ReadOnly),
            "standard" => Some(PermissionMode::Standard),
            "autonomous" => Some(PermissionMode::Autonomous),
            _ => None,
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delegation fields of a task header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    pub status: DelegationStatus,
    pub job_id: Option<String>,
    pub agent: Option<String>,
    pub mode: Option<PermissionMode>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub process_id: Option<u32>,
    pub output_file: Option<String>,
    pub progress: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl Delegation {
    pub fn queued(job_id: impl Into<String>, agent: impl Into<String>, mode: PermissionMode) -> Self {
        Self {
            status: DelegationStatus::Queued,
            job_id: Some(job_id.into()),
            agent: Some(agent.into()),
            mode: Some(mode),
            queued_at: Some(crate::now()),
            started_at: None,
            completed_at: None,
            process_id: None,
            output_file: None,
            progress: None,
            error: None,
            attempts: 0,
        }
    }
}

/// Fields carried only by task-management records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskFields {
    pub status: TaskStatus,
    pub priority: Priority,
    pub assignee: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub dependencies: Vec<String>,
    pub blocks: Vec<String>,
    pub delegation: Option<Delegation>,
}

/// Shallow update of task fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub dependencies: Option<Vec<String>>,
    pub blocks: Option<Vec<String>>,
}

impl TaskUpdate {
    pub fn apply(self, task: &mut TaskFields) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(assignee) = self.assignee {
            task.assignee = Some(assignee);
        }
        if let Some(due_date) = self.due_date {
            task.due_date = Some(due_date);
        }
        if let Some(dependencies) = self.dependencies {
            task.dependencies = dependencies;
        }
        if let Some(blocks) = self.blocks {
            task.blocks = blocks;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_delegation_transitions() {
        use DelegationStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in TaskStatus::all() {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(*status));
        }
        assert_eq!(DelegationStatus::from_str("RUNNING"), Some(DelegationStatus::Running));
        assert_eq!(PermissionMode::from_str("read_only"), Some(PermissionMode::ReadOnly));
    }
}
