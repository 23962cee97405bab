//! Task — the unit of work the engine executes, and its in-memory state
//! snapshot.
//!
//! `Task` is the durable record owned by the Durable Store (spec §3): the
//! Worker only ever reads its `id` and `input_prompt`. `TaskState` is the
//! mutable, in-memory snapshot owned exclusively by the Worker; everyone
//! else reads a copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task as persisted by the Durable Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque identifier (UUID-shaped).
    pub id: String,

    /// Optional short title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// The user requirement driving the pipeline.
    pub input_prompt: String,

    /// Current status.
    pub status: TaskStatus,

    /// Set once the task reaches a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task in `PENDING` status.
    pub fn new(input_prompt: impl Into<String>, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            input_prompt: input_prompt.into(),
            status: TaskStatus::Pending,
            result_summary: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The status of a task (spec §3). Transitions monotonically:
/// `Pending -> Running -> {Succeeded, Failed, Cancelled}`, never regressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are absorbing: once reached, the task never
    /// transitions again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// The in-memory snapshot of a running (or completed) task, owned
/// exclusively by its Worker. Readers always receive a clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,
    /// In `[0, 1]`. Non-decreasing while non-terminal; snaps to `1.0` on
    /// `SUCCEEDED`; stays at its last value on `FAILED`/`CANCELLED`
    /// (spec §9 open question: "stays", not snap-to-1).
    pub progress: f32,
    pub current_stage: Option<String>,
    pub last_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The final aggregate, set only once the task reaches `SUCCEEDED`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl TaskState {
    /// A freshly-created snapshot for a task about to start running.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            current_stage: None,
            last_message: None,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}

/// One invocation of one stage, persisted by the Durable Store (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: i64,
    pub task_id: String,
    pub stage_name: String,
    pub status: AgentRunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRunStatus {
    Started,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentRunStatus::Started => "STARTED",
            AgentRunStatus::Running => "RUNNING",
            AgentRunStatus::Completed => "COMPLETED",
            AgentRunStatus::Failed => "FAILED",
            AgentRunStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_pending() {
        let task = Task::new("build a todo app", None);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.id.is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn fresh_state_has_zero_progress() {
        let state = TaskState::new("t-1");
        assert_eq!(state.progress, 0.0);
        assert!(state.current_stage.is_none());
    }
}
