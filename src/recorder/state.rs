//! Task state management
//!
//! Defines the per-task state machine and the reports written to the
//! session manifest.

use super::channel::RecorderKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one recording task
///
/// Tasks only move forward: `NotStarted -> Running -> Stopped`, or straight
/// to `Stopped` when the recorder cannot be spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    NotStarted,
    Running,
    Stopped,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::NotStarted
    }
}

/// Supervisor-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No task running
    Idle,
    /// At least one task running
    Active,
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskOutcome {
    /// Recorder returned cleanly
    Completed,
    /// Recorder returned an error or crashed
    Failed { reason: String },
    /// Recorder could not be started
    SpawnFailed { reason: String },
    /// Recorder ignored the stop request and was killed
    Killed,
}

/// How an execution context reported its exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    Clean,
    /// The device could not be opened; nothing was recorded
    OpenFailed(String),
    Failed(String),
}

impl From<TaskExit> for TaskOutcome {
    fn from(exit: TaskExit) -> Self {
        match exit {
            TaskExit::Clean => TaskOutcome::Completed,
            TaskExit::OpenFailed(reason) => TaskOutcome::SpawnFailed { reason },
            TaskExit::Failed(reason) => TaskOutcome::Failed { reason },
        }
    }
}

/// Recorder processes report their outcome as one JSON line on stdout
impl From<TaskOutcome> for TaskExit {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Completed => TaskExit::Clean,
            TaskOutcome::SpawnFailed { reason } => TaskExit::OpenFailed(reason),
            TaskOutcome::Failed { reason } => TaskExit::Failed(reason),
            TaskOutcome::Killed => TaskExit::Failed("killed".to_string()),
        }
    }
}

/// Snapshot of one task, as stored in `session.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub kind: RecorderKind,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskOutcome>,
}
