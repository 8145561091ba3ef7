//! Task lifecycle events.
//!
//! Every engine operation is framed by a BEFORE event on entry and an AFTER
//! event on every exit, success or failure. Progress-bearing operations may
//! interleave PROGRESS events between the pair. Events carry the active
//! transaction id so a bus client can filter the stream down to its own work.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle state of a task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "BEFORE")]
    Before,
    #[serde(rename = "AFTER")]
    After,
}

/// Payload kind of a task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "NOTIFICATION")]
    Notification,
    #[serde(rename = "PROGRESS")]
    Progress,
}

/// A single task lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Stable logical operation identifier (e.g. `system.install`).
    pub name: String,
    /// Human-readable task title.
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub state: TaskState,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Percent complete, 0..=100. Meaningful only for progress events.
    pub progress: u8,
    pub transaction: String,
}

/// Destination for task events: the terminal task tracker, the bus signal,
/// or nothing (tests, plain JSON output).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TaskEvent);
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &TaskEvent) {}
}

/// Emits BEFORE/AFTER pairs for one request, bound to its transaction.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn EventSink>,
    transaction: String,
}

impl Reporter {
    pub fn new(sink: Arc<dyn EventSink>, transaction: impl Into<String>) -> Self {
        Self {
            sink,
            transaction: transaction.into(),
        }
    }

    /// Reporter that swallows events, for internal callers.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink), String::new())
    }

    pub fn transaction(&self) -> &str {
        &self.transaction
    }

    /// Emit BEFORE now and return a guard that emits the matching AFTER when
    /// dropped, so the pair closes on every exit path.
    pub fn task(&self, name: &str, display_name: &str) -> TaskGuard {
        self.emit(name, display_name, TaskState::Before, TaskKind::Notification, 0);
        TaskGuard {
            reporter: self.clone(),
            name: name.to_string(),
            display_name: display_name.to_string(),
        }
    }

    /// Emit a PROGRESS event for an in-flight task.
    pub fn progress(&self, name: &str, display_name: &str, percent: u8) {
        self.emit(
            name,
            display_name,
            TaskState::Before,
            TaskKind::Progress,
            percent.min(100),
        );
    }

    fn emit(&self, name: &str, display_name: &str, state: TaskState, kind: TaskKind, progress: u8) {
        let event = TaskEvent {
            name: name.to_string(),
            display_name: display_name.to_string(),
            state,
            kind,
            progress,
            transaction: self.transaction.clone(),
        };
        self.sink.emit(&event);
    }
}

/// Guard emitting the AFTER half of a BEFORE/AFTER pair on drop.
pub struct TaskGuard {
    reporter: Reporter,
    name: String,
    display_name: String,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.reporter.emit(
            &self.name,
            &self.display_name,
            TaskState::After,
            TaskKind::Notification,
            100,
        );
    }
}
