//! Terminal task tracker.
//!
//! One long-running renderer thread owns the screen: a top-line spinner plus
//! a checklist of in-flight tasks, one row per BEFORE event, checked off on
//! the matching AFTER. Senders never block; the renderer drains an unbounded
//! mailbox. `wait_idle` lets the caller sequence the spinner shutdown before
//! printing the response tree so the two never interleave visually.

use crate::events::{EventSink, TaskEvent, TaskKind, TaskState};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::mpsc::{Sender, channel};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

enum Msg {
    Event(TaskEvent),
    /// Reply once the mailbox is drained and every task reached AFTER.
    Flush(Sender<()>),
}

/// The renderer and its mailbox.
pub struct TaskTracker {
    tx: Sender<Msg>,
    multi: MultiProgress,
    _thread: JoinHandle<()>,
}

impl TaskTracker {
    /// Start a tracker with its own renderer thread.
    pub fn spawn() -> Self {
        let (tx, rx) = channel::<Msg>();
        let multi = MultiProgress::new();
        let render_multi = multi.clone();
        let thread = std::thread::spawn(move || {
            let mut rows: HashMap<(String, String), ProgressBar> = HashMap::new();
            let mut pending = 0usize;
            let mut waiting: Vec<Sender<()>> = Vec::new();
            let spinner = render_multi.add(ProgressBar::new_spinner());
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg}")
                    .expect("valid template"),
            );
            spinner.set_message("Working...");
            spinner.enable_steady_tick(Duration::from_millis(80));

            while let Ok(msg) = rx.recv() {
                match msg {
                    Msg::Event(event) => {
                        let key = (event.name.clone(), event.transaction.clone());
                        match event.state {
                            TaskState::Before if event.kind == TaskKind::Notification => {
                                rows.entry(key).or_insert_with(|| {
                                    pending += 1;
                                    let row = render_multi.add(ProgressBar::new_spinner());
                                    row.set_style(
                                        ProgressStyle::default_spinner()
                                            .template("  {spinner:.cyan} {msg}")
                                            .expect("valid template"),
                                    );
                                    row.set_message(event.display_name.clone());
                                    row.enable_steady_tick(Duration::from_millis(120));
                                    row
                                });
                            }
                            TaskState::Before => {
                                // Progress update for an existing row.
                                if let Some(row) = rows.get(&key) {
                                    row.set_message(format!(
                                        "{} ({}%)",
                                        event.display_name, event.progress
                                    ));
                                }
                            }
                            TaskState::After => {
                                if let Some(row) = rows.get(&key)
                                    && !row.is_finished()
                                {
                                    row.finish_with_message(format!(
                                        "{} {}",
                                        "✓".green().bold(),
                                        event.display_name
                                    ));
                                    pending = pending.saturating_sub(1);
                                }
                            }
                        }
                    }
                    Msg::Flush(reply) => waiting.push(reply),
                }
                if pending == 0 {
                    for reply in waiting.drain(..) {
                        let _ = reply.send(());
                    }
                }
            }
            spinner.finish_and_clear();
        });
        Self {
            tx,
            multi,
            _thread: thread,
        }
    }

    /// A cloneable handle that feeds the renderer.
    pub fn handle(&self) -> TrackerHandle {
        TrackerHandle {
            tx: self.tx.clone(),
            multi: self.multi.clone(),
        }
    }

    /// Block until everything queued so far has rendered and every task has
    /// reached AFTER.
    pub fn wait_idle(&self) {
        let (reply_tx, reply_rx) = channel();
        if self.tx.send(Msg::Flush(reply_tx)).is_ok() {
            let _ = reply_rx.recv_timeout(Duration::from_secs(5));
        }
    }

    /// Tear the rendered region down, restoring the screen.
    pub fn clear(&self) {
        self.wait_idle();
        let _ = self.multi.clear();
    }
}

/// Sender half handed to reporters and the dialog gate.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: Sender<Msg>,
    multi: MultiProgress,
}

impl TrackerHandle {
    /// Run `f` with the rendered region hidden (for interactive prompts).
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.multi.suspend(f)
    }
}

impl EventSink for TrackerHandle {
    fn emit(&self, event: &TaskEvent) {
        // Never block the engine: unbounded channel, errors ignored once the
        // renderer is gone.
        let _ = self.tx.send(Msg::Event(event.clone()));
    }
}

/// Process-wide tracker. Starting it twice is a no-op.
pub fn global() -> &'static TaskTracker {
    static TRACKER: OnceLock<TaskTracker> = OnceLock::new();
    static STARTING: Mutex<()> = Mutex::new(());
    let _guard = STARTING.lock().unwrap();
    TRACKER.get_or_init(TaskTracker::spawn)
}
