//! Task Registry — the single source of truth for "is this task running,
//! and what does it look like right now" (spec §2, §4.1).
//!
//! The Registry owns one `RegistryEntry` per task that has ever been
//! started in this process: the live `TaskState` snapshot, a bounded
//! tail buffer of recent events (for late subscribers who missed the
//! bus), and the `CancellationToken` a caller uses to request early
//! stop. It does not own the Worker task itself — that's `worker::spawn`
//! — only the bookkeeping needed to answer `state_snapshot`/`events_since`
//! without going to the Durable Store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::event::{Event, EventKind};
use crate::task::TaskStatus;
use crate::task::TaskState;

struct RegistryEntry {
    state: TaskState,
    tail: VecDeque<Event>,
    cancel_token: CancellationToken,
    running: bool,
}

/// In-memory index of live and recently-finished tasks.
pub struct Registry {
    tail_buffer_len: usize,
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl Registry {
    pub fn new(tail_buffer_len: usize) -> Arc<Self> {
        Arc::new(Self {
            tail_buffer_len,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Reserve a slot for `task_id` and hand back the `CancellationToken`
    /// the Worker should watch. Fails with `AlreadyRunning` if a Worker
    /// for this task is already live (spec §4.1 invariant: at most one
    /// live Worker per task).
    pub fn begin(&self, task_id: &str) -> EngineResult<CancellationToken> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(task_id) {
            if existing.running {
                return Err(EngineError::AlreadyRunning(task_id.to_string()));
            }
        }

        let cancel_token = CancellationToken::new();
        entries.insert(
            task_id.to_string(),
            RegistryEntry {
                state: TaskState::new(task_id),
                tail: VecDeque::new(),
                cancel_token: cancel_token.clone(),
                running: true,
            },
        );
        Ok(cancel_token)
    }

    /// Request cooperative cancellation of a running task. A no-op if the
    /// task isn't running (already terminal, or never started).
    pub fn stop(&self, task_id: &str) -> EngineResult<()> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(task_id)
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;
        if entry.running {
            entry.cancel_token.cancel();
        }
        Ok(())
    }

    /// Fold a freshly-emitted event into the task's live snapshot and
    /// tail buffer. Called by the Worker right after a successful
    /// durable write and bus publish.
    pub fn record_event(&self, event: Event) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&event.task_id) else {
            return;
        };

        apply_event_to_state(&mut entry.state, &event);

        entry.tail.push_back(event);
        while entry.tail.len() > self.tail_buffer_len {
            entry.tail.pop_front();
        }
    }

    /// Mark a task's Worker as finished. The entry and its final state
    /// snapshot remain queryable; only `running` flips.
    pub fn finish(&self, task_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(task_id) {
            entry.running = false;
        }
    }

    /// Current in-memory snapshot, if this task has ever been started.
    pub fn state_snapshot(&self, task_id: &str) -> Option<TaskState> {
        self.entries
            .lock()
            .unwrap()
            .get(task_id)
            .map(|e| e.state.clone())
    }

    /// Events in the tail buffer with `event_id > since_id`. This is a
    /// best-effort in-memory view only — callers needing full history
    /// past the tail window should fall back to the Durable Store.
    pub fn events_since(&self, task_id: &str, since_id: u64) -> Vec<Event> {
        self.entries
            .lock()
            .unwrap()
            .get(task_id)
            .map(|e| {
                e.tail
                    .iter()
                    .filter(|ev| ev.event_id > since_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(task_id)
            .map(|e| e.running)
            .unwrap_or(false)
    }
}

/// Update the live snapshot in response to one event, per spec §3/§9:
/// progress is non-decreasing while non-terminal, snaps to `1.0` on
/// `SUCCEEDED`, and simply holds its last value on `FAILED`/`CANCELLED`.
fn apply_event_to_state(state: &mut TaskState, event: &Event) {
    state.last_message = message_text(&event.kind).or_else(|| state.last_message.clone());

    match &event.kind {
        EventKind::StageStart(payload) => {
            state.status = TaskStatus::Running;
            state.current_stage = event.stage_name.clone();
            if state.started_at.is_none() {
                state.started_at = Some(event.timestamp);
            }
            state.last_message = Some(payload.message.clone());
            state.progress = state.progress.max(stage_entry_progress(&event.stage_name));
        }
        EventKind::StageComplete(payload) => {
            state.last_message = Some(payload.message.clone());
            state.progress = state.progress.max(stage_exit_progress(&event.stage_name));
        }
        EventKind::Result(payload) => {
            state.status = TaskStatus::Succeeded;
            state.progress = 1.0;
            state.completed_at = Some(event.timestamp);
            state.result = Some(payload.result.clone());
        }
        EventKind::Error(payload) => {
            state.status = if payload.message.to_ascii_lowercase().contains("cancel") {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Failed
            };
            state.completed_at = Some(event.timestamp);
        }
        EventKind::Log(_) | EventKind::Message(_) => {}
    }
}

fn message_text(kind: &EventKind) -> Option<String> {
    match kind {
        EventKind::Log(p) => Some(p.message.clone()),
        EventKind::Message(p) => Some(p.message.clone()),
        _ => None,
    }
}

/// Coarse progress checkpoints for the three-stage PM/Architect/Engineer
/// pipeline (spec §4.4). Stage-agnostic: an unrecognized or absent stage
/// name leaves progress unchanged.
fn stage_entry_progress(stage_name: &Option<String>) -> f32 {
    match stage_name.as_deref() {
        Some("PM") => 0.05,
        Some("ARCHITECT") => 0.35,
        Some("ENGINEER") => 0.65,
        _ => 0.0,
    }
}

fn stage_exit_progress(stage_name: &Option<String>) -> f32 {
    match stage_name.as_deref() {
        Some("PM") => 0.33,
        Some("ARCHITECT") => 0.66,
        Some("ENGINEER") => 0.95,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorPayload, ResultPayload, StageStartPayload};
    use chrono::Utc;

    fn event(task_id: &str, id: u64, kind: EventKind, stage: Option<&str>) -> Event {
        Event {
            event_id: id,
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            stage_name: stage.map(String::from),
            kind,
        }
    }

    #[test]
    fn begin_twice_without_finish_is_already_running() {
        let registry = Registry::new(16);
        registry.begin("t-1").unwrap();
        let err = registry.begin("t-1").unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));
    }

    #[test]
    fn begin_after_finish_succeeds() {
        let registry = Registry::new(16);
        registry.begin("t-1").unwrap();
        registry.finish("t-1");
        assert!(registry.begin("t-1").is_ok());
    }

    #[test]
    fn stop_unknown_task_is_not_found() {
        let registry = Registry::new(16);
        assert!(matches!(
            registry.stop("nope").unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[test]
    fn recording_stage_start_updates_snapshot() {
        let registry = Registry::new(16);
        registry.begin("t-1").unwrap();
        registry.record_event(event(
            "t-1",
            1,
            EventKind::StageStart(StageStartPayload {
                message: "PM starting".into(),
            }),
            Some("PM"),
        ));

        let state = registry.state_snapshot("t-1").unwrap();
        assert_eq!(state.status, TaskStatus::Running);
        assert_eq!(state.current_stage.as_deref(), Some("PM"));
        assert!(state.started_at.is_some());
    }

    #[test]
    fn result_event_snaps_progress_to_one() {
        let registry = Registry::new(16);
        registry.begin("t-1").unwrap();
        registry.record_event(event(
            "t-1",
            1,
            EventKind::Result(ResultPayload {
                result: serde_json::json!({"ok": true}),
            }),
            None,
        ));

        let state = registry.state_snapshot("t-1").unwrap();
        assert_eq!(state.status, TaskStatus::Succeeded);
        assert_eq!(state.progress, 1.0);
    }

    #[test]
    fn error_event_with_cancel_wording_sets_cancelled() {
        let registry = Registry::new(16);
        registry.begin("t-1").unwrap();
        registry.record_event(event(
            "t-1",
            1,
            EventKind::Error(ErrorPayload {
                message: "cancelled by caller".into(),
                detail: None,
            }),
            None,
        ));

        let state = registry.state_snapshot("t-1").unwrap();
        assert_eq!(state.status, TaskStatus::Cancelled);
    }

    #[test]
    fn tail_buffer_evicts_oldest() {
        let registry = Registry::new(2);
        registry.begin("t-1").unwrap();
        for i in 1..=3u64 {
            registry.record_event(event(
                "t-1",
                i,
                EventKind::Log(crate::event::LogPayload {
                    message: format!("msg {i}"),
                }),
                None,
            ));
        }

        let events = registry.events_since("t-1", 0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, 2);
        assert_eq!(events[1].event_id, 3);
    }

    #[test]
    fn events_since_filters_by_id() {
        let registry = Registry::new(16);
        registry.begin("t-1").unwrap();
        for i in 1..=3u64 {
            registry.record_event(event(
                "t-1",
                i,
                EventKind::Log(crate::event::LogPayload {
                    message: "x".into(),
                }),
                None,
            ));
        }

        let events = registry.events_since("t-1", 1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, 2);
    }
}
