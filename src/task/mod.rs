//! Outbound auto-dial task.
//!
//! An [`AutoDialTask`] owns a FIFO queue of [`CallTarget`]s and dials them
//! one at a time through a [`Dialer`], advancing on normalized call events.
//! Progress is pushed to an injected callback as [`TaskEvent`]s; nothing
//! about a call outcome is ever returned as an error.
//!
//! ```text
//!            start()                    queue empty / stop()
//!  Paused ───────────▶ Running ──────────────────────────────▶ Ended
//!    ▲                  │  ▲ │
//!    └──────────────────┘  └─┘ next()
//!   pause() / DISCONNECTED / UNREGISTERED / REGISTER_FAILED
//! ```

mod engine;

pub use engine::AutoDialTask;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One number queued for dialing. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTarget {
    pub phone: String,
    pub id: String,
}

impl CallTarget {
    pub fn new(phone: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            id: id.into(),
        }
    }
}

/// Task lifecycle. `Ended` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Paused,
    Running,
    Ended,
}

/// Running totals, pushed to the listener as a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStatistics {
    pub status: TaskState,
    /// Targets ever enqueued
    pub total: u64,
    /// Dial requests issued
    pub dialed: u64,
    pub answered: u64,
    pub unanswered: u64,
    pub current_target: Option<CallTarget>,
    pub start_timestamp: Option<DateTime<Utc>>,
    /// Seconds since `start_timestamp`, recomputed for every snapshot
    pub duration_seconds: u64,
    /// Short human-readable description of what the task is doing
    pub info: String,
}

/// Who paused the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseSource {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PauseInfo {
    pub source: PauseSource,
    pub reason: String,
}

impl PauseInfo {
    pub fn user() -> Self {
        Self {
            source: PauseSource::User,
            reason: String::new(),
        }
    }

    pub fn system(reason: impl Into<String>) -> Self {
        Self {
            source: PauseSource::System,
            reason: reason.into(),
        }
    }
}

/// Notifications delivered to the task's callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEvent {
    TaskStat(TaskStatistics),
    TaskEnd(TaskStatistics),
    TaskPause(PauseInfo),
    /// The current target picked up; a good moment to show the customer card
    CallAnswer(Option<CallTarget>),
    /// An answered call finished; a good moment to record its disposition
    CallEnd(Option<CallTarget>),
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::TaskStat(_) => "TASK_STAT",
            TaskEvent::TaskEnd(_) => "TASK_END",
            TaskEvent::TaskPause(_) => "TASK_PAUSE",
            TaskEvent::CallAnswer(_) => "CALL_ANSWER",
            TaskEvent::CallEnd(_) => "CALL_END",
        }
    }
}

/// Injected listener for task notifications.
pub type TaskCallback = Box<dyn FnMut(TaskEvent) + Send>;

/// Places one outbound call for the task.
pub trait Dialer {
    /// Request a call to `phone`. Returns the call id if the request was
    /// accepted, `None` if the phone refused it (e.g. not registered).
    fn dial(&mut self, phone: &str) -> Option<String>;
}

/// Misuse of the task API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task has been destroyed")]
    Destroyed,
    #[error("task has ended; create a new task to dial again")]
    AlreadyEnded,
}
