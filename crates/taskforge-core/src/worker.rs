//! Worker — the per-task coroutine that drives the PM → Architect →
//! Engineer pipeline to completion (spec §2, §4.2, §4.3).
//!
//! One Worker is spawned per `start`. It owns the task's monotonic
//! `event_id` counter, enforces the hard deadline, watches for
//! cooperative cancellation, and guarantees exactly one terminal event
//! (`RESULT` or `ERROR`) is emitted no matter which of the four exit
//! paths is taken: success, a stage error, the deadline elapsing, or
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::SubscriptionBus;
use crate::error::{EngineError, EngineResult};
use crate::event::{Event, ErrorPayload, EventKind, ResultPayload};
use crate::pipeline::{run_with_bracket, EventEmitter, Stage, StageContext};
use crate::registry::Registry;
use crate::store::DurableStore;
use crate::task::{AgentRunStatus, Task, TaskStatus};

/// Drives one task's pipeline and is the sole writer of its events.
///
/// `event_counter` is an async mutex held only for the instant it takes
/// to assign an id, persist, fold into the Registry, and publish to the
/// Bus — this is the "per-task emission lock" (spec §5) that keeps
/// `event_id` strictly monotonic even though stages may, in principle,
/// emit concurrently.
pub struct Worker {
    task_id: String,
    store: Arc<dyn DurableStore>,
    bus: Arc<SubscriptionBus>,
    registry: Arc<Registry>,
    event_counter: AsyncMutex<u64>,
}

impl Worker {
    fn new(
        task_id: String,
        store: Arc<dyn DurableStore>,
        bus: Arc<SubscriptionBus>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            task_id,
            store,
            bus,
            registry,
            event_counter: AsyncMutex::new(0),
        }
    }
}

#[async_trait]
impl EventEmitter for Worker {
    async fn emit(&self, stage_name: &str, kind: EventKind) -> EngineResult<()> {
        let mut counter = self.event_counter.lock().await;
        *counter += 1;
        let event_id = *counter;

        let event = Event {
            event_id,
            task_id: self.task_id.clone(),
            timestamp: chrono::Utc::now(),
            stage_name: Some(stage_name.to_string()).filter(|s| !s.is_empty()),
            kind,
        };
        drop(counter);

        let payload_text = serde_json::to_string(&event.kind)?;
        if let Err(err) = self
            .store
            .insert_event(
                &event.task_id,
                event.kind_name(),
                event.stage_name.as_deref(),
                &payload_text,
            )
            .await
        {
            // Durable writes are best-effort from the Worker's point of view:
            // the in-memory Registry/Bus path must not stall because the
            // store is unavailable (spec §7).
            warn!(task_id = %event.task_id, error = %err, "failed to persist event");
        }

        self.registry.record_event(event.clone());
        self.bus.publish(&event);
        Ok(())
    }
}

/// Start a Worker for `task`, running `stages` in order. Returns once the
/// Worker has been spawned; the pipeline itself runs in the background.
pub fn start(
    task: Task,
    stages: Vec<Arc<dyn Stage>>,
    store: Arc<dyn DurableStore>,
    bus: Arc<SubscriptionBus>,
    registry: Arc<Registry>,
    max_duration: Duration,
) -> EngineResult<tokio::task::JoinHandle<()>> {
    let cancel_token = registry.begin(&task.id)?;

    let handle = tokio::spawn(async move {
        let task_id = task.id.clone();
        let worker = Arc::new(Worker::new(
            task_id.clone(),
            store.clone(),
            bus.clone(),
            registry.clone(),
        ));

        if let Err(err) = store.update_task_status(&task_id, TaskStatus::Running, None).await {
            warn!(task_id = %task_id, error = %err, "failed to mark task running");
        }

        info!(task_id = %task_id, "worker starting");

        let outcome = timeout(
            max_duration,
            run_pipeline(worker.clone(), &task, &stages, cancel_token.clone()),
        )
        .await;

        let (status, terminal_event) = match outcome {
            Ok(Ok(result)) => (
                TaskStatus::Succeeded,
                EventKind::Result(ResultPayload { result }),
            ),
            Ok(Err(EngineError::Cancelled)) => (
                TaskStatus::Cancelled,
                EventKind::Error(ErrorPayload {
                    message: "task cancelled".into(),
                    detail: None,
                }),
            ),
            Ok(Err(err)) => (
                TaskStatus::Failed,
                EventKind::Error(ErrorPayload {
                    message: "stage failed".into(),
                    detail: Some(err.to_string()),
                }),
            ),
            Err(_elapsed) => (
                TaskStatus::Failed,
                EventKind::Error(ErrorPayload {
                    message: "task exceeded maximum duration".into(),
                    detail: None,
                }),
            ),
        };

        finish(worker.as_ref(), &task_id, status, terminal_event).await;
    });

    Ok(handle)
}

/// Request cooperative cancellation of a running task (spec §4.3).
pub fn stop(registry: &Registry, task_id: &str) -> EngineResult<()> {
    registry.stop(task_id)
}

async fn run_pipeline(
    worker: Arc<Worker>,
    task: &Task,
    stages: &[Arc<dyn Stage>],
    cancel_token: CancellationToken,
) -> EngineResult<serde_json::Value> {
    let mut upstream = serde_json::Value::Null;

    for stage in stages {
        if cancel_token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let run_id = worker
            .store
            .start_agent_run(&task.id, stage.name())
            .await
            .unwrap_or(-1);

        let ctx = StageContext::new(
            task.id.clone(),
            task.input_prompt.clone(),
            upstream.clone(),
            worker.as_ref(),
            cancel_token.clone(),
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => Err(EngineError::Cancelled),
            result = run_with_bracket(stage.as_ref(), &ctx) => result,
        };

        let (run_status, summary) = match &outcome {
            Ok(value) => (AgentRunStatus::Completed, Some(value.to_string())),
            Err(EngineError::Cancelled) => (AgentRunStatus::Cancelled, None),
            Err(err) => (AgentRunStatus::Failed, Some(err.to_string())),
        };
        if run_id >= 0 {
            if let Err(err) = worker
                .store
                .finish_agent_run(run_id, run_status, summary.as_deref())
                .await
            {
                warn!(task_id = %task.id, error = %err, "failed to finalize agent run record");
            }
        }

        upstream = outcome?;
    }

    Ok(upstream)
}

/// The single teardown path, reached from all four exit arms (success,
/// stage error, deadline, cancellation): emit exactly one terminal
/// event, persist the final status, and release Registry/Bus resources.
async fn finish(worker: &Worker, task_id: &str, status: TaskStatus, terminal_event: EventKind) {
    let result_summary = match &terminal_event {
        EventKind::Result(payload) => Some(payload.result.to_string()),
        EventKind::Error(payload) => Some(payload.message.clone()),
        _ => None,
    };

    if let Err(err) = worker.emit("", terminal_event).await {
        warn!(task_id = %task_id, error = %err, "failed to emit terminal event");
    }

    if let Err(err) = worker
        .store
        .update_task_status(task_id, status, result_summary.as_deref())
        .await
    {
        warn!(task_id = %task_id, error = %err, "failed to persist final task status");
    }

    worker.registry.finish(task_id);
    worker.bus.close(task_id);

    info!(task_id = %task_id, status = %status, "worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SimulatedStage;
    use crate::store::SqliteStore;

    async fn harness() -> (Task, Arc<dyn DurableStore>, Arc<SubscriptionBus>, Arc<Registry>) {
        let store: Arc<dyn DurableStore> =
            Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let bus = Arc::new(SubscriptionBus::new(64));
        let registry = Registry::new(256);
        let task = Task::new("build a todo app", None);
        store.create_task(&task).await.unwrap();
        (task, store, bus, registry)
    }

    #[tokio::test]
    async fn successful_pipeline_ends_in_succeeded() {
        let (task, store, bus, registry) = harness().await;
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(SimulatedStage::pm(Duration::ZERO)),
            Arc::new(SimulatedStage::architect(Duration::ZERO)),
            Arc::new(SimulatedStage::engineer(Duration::ZERO)),
        ];

        let handle = start(
            task.clone(),
            stages,
            store.clone(),
            bus,
            registry.clone(),
            Duration::from_secs(5),
        )
        .unwrap();
        handle.await.unwrap();

        let state = registry.state_snapshot(&task.id).unwrap();
        assert_eq!(state.status, TaskStatus::Succeeded);
        assert_eq!(state.progress, 1.0);
        assert!(!registry.is_running(&task.id));

        let persisted = store.fetch_task(&task.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn cannot_start_same_task_twice_concurrently() {
        let (task, store, bus, registry) = harness().await;
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(SimulatedStage::pm(Duration::ZERO))];

        let _handle = start(
            task.clone(),
            stages.clone(),
            store.clone(),
            bus.clone(),
            registry.clone(),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = start(task, stages, store, bus, registry, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn cancelling_before_pipeline_starts_yields_cancelled_status() {
        let (task, store, bus, registry) = harness().await;
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(SimulatedStage::pm(Duration::ZERO)),
            Arc::new(SimulatedStage::architect(Duration::ZERO)),
        ];

        let handle = start(
            task.clone(),
            stages,
            store.clone(),
            bus,
            registry.clone(),
            Duration::from_secs(5),
        )
        .unwrap();

        registry.stop(&task.id).unwrap();
        handle.await.unwrap();

        let state = registry.state_snapshot(&task.id).unwrap();
        assert_eq!(state.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn deadline_exceeded_marks_task_failed() {
        struct StallingStage;

        #[async_trait]
        impl Stage for StallingStage {
            fn name(&self) -> &'static str {
                "PM"
            }

            async fn run(
                &self,
                _ctx: &StageContext<'_>,
            ) -> EngineResult<serde_json::Value> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(serde_json::json!({}))
            }
        }

        let (task, store, bus, registry) = harness().await;
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(StallingStage)];

        let handle = start(
            task.clone(),
            stages,
            store.clone(),
            bus,
            registry.clone(),
            Duration::from_millis(10),
        )
        .unwrap();
        handle.await.unwrap();

        let state = registry.state_snapshot(&task.id).unwrap();
        assert_eq!(state.status, TaskStatus::Failed);
    }
}
