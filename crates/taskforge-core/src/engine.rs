//! Engine — the façade that wires Registry, Subscription Bus, Durable
//! Store, and Worker together into the single object a server or CLI
//! actually holds (spec §2).

use std::sync::Arc;
use std::time::Duration;

use crate::bus::SubscriptionBus;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::{SimulatedStage, Stage};
use crate::registry::Registry;
use crate::store::DurableStore;
use crate::stream_session::{CloseReason, StreamSession};
use crate::task::{Task, TaskState, TaskStatus};
use crate::worker;

/// The task execution engine: creates tasks, starts/stops their
/// pipelines, and serves push-stream sessions against them.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn DurableStore>,
    bus: Arc<SubscriptionBus>,
    registry: Arc<Registry>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn DurableStore>) -> Self {
        let bus = Arc::new(SubscriptionBus::new(config.bus.channel_capacity));
        let registry = Registry::new(config.bus.tail_buffer_len);
        Self {
            config,
            store,
            bus,
            registry,
        }
    }

    /// Persist a new task in `PENDING` status. Does not start it.
    pub async fn create_task(
        &self,
        input_prompt: impl Into<String>,
        title: Option<String>,
    ) -> EngineResult<Task> {
        let task = Task::new(input_prompt, title);
        self.store.create_task(&task).await?;
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> EngineResult<Task> {
        self.store
            .fetch_task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))
    }

    pub async fn list_tasks(&self) -> EngineResult<Vec<Task>> {
        self.store.list_tasks().await
    }

    /// Start the PM → Architect → Engineer pipeline for an existing task
    /// (spec §4.4). Fails with `AlreadyRunning` if a Worker for this task
    /// is already live in this process.
    pub async fn start_task(&self, task_id: &str) -> EngineResult<()> {
        let task = self.get_task(task_id).await?;
        let stages = self.build_stages();

        worker::start(
            task,
            stages,
            self.store.clone(),
            self.bus.clone(),
            self.registry.clone(),
            Duration::from_secs(self.config.max_task_duration_seconds),
        )?;
        Ok(())
    }

    /// Request cooperative cancellation of a running task (spec §4.3).
    pub fn stop_task(&self, task_id: &str) -> EngineResult<()> {
        worker::stop(&self.registry, task_id)
    }

    /// The current in-memory snapshot for a task that has been started
    /// at least once in this process; falls back to the Durable Store's
    /// last known status for tasks started in a previous process.
    pub async fn task_state(&self, task_id: &str) -> EngineResult<TaskState> {
        if let Some(state) = self.registry.state_snapshot(task_id) {
            return Ok(state);
        }

        let task = self.get_task(task_id).await?;
        let mut state = TaskState::new(task.id);
        state.status = task.status;
        state.last_message = task.result_summary;
        Ok(state)
    }

    /// Run one push-stream session for `task_id` against `sink`. The
    /// session blocks until it decides to close (spec §4.5); callers
    /// wrap this in their transport's accept loop.
    ///
    /// Per spec §4.5 step 2: if the task is absent from the Registry
    /// (never started in this process) and still `PENDING` in the
    /// Durable Store, this kicks off its Worker before subscribing, so a
    /// client that connects to a freshly-created task actually sees it
    /// run rather than hanging on an entry that will never appear.
    pub async fn stream(
        &self,
        task_id: &str,
        sink: &mut dyn crate::stream_session::EventSink,
    ) -> EngineResult<CloseReason> {
        if self.registry.state_snapshot(task_id).is_none() {
            let task = self.get_task(task_id).await?;
            if task.status != TaskStatus::Pending {
                return Err(EngineError::NotFound(task_id.to_string()));
            }
            match self.start_task(task_id).await {
                Ok(()) | Err(EngineError::AlreadyRunning(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let session = StreamSession::new(
            task_id,
            self.registry.clone(),
            self.bus.clone(),
            &self.config.stream,
        );
        session.run(sink).await
    }

    pub fn store(&self) -> Arc<dyn DurableStore> {
        self.store.clone()
    }

    fn build_stages(&self) -> Vec<Arc<dyn Stage>> {
        // `test_mode` is the only stage backend this crate ships (spec
        // §4.4); a real agent framework would be wired in here behind
        // the same `Stage` trait.
        let _ = self.config.test_mode;
        let delay = Duration::from_millis(self.config.simulated_stage_delay_ms);
        vec![
            Arc::new(SimulatedStage::pm(delay)),
            Arc::new(SimulatedStage::architect(delay)),
            Arc::new(SimulatedStage::engineer(delay)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    async fn engine() -> Engine {
        let store: Arc<dyn DurableStore> =
            Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        Engine::new(EngineConfig::default(), store)
    }

    #[tokio::test]
    async fn create_then_start_then_observe_completion() {
        let engine = engine().await;
        let task = engine
            .create_task("build a todo app", None)
            .await
            .unwrap();

        engine.start_task(&task.id).await.unwrap();

        // Poll briefly for completion; the simulated pipeline is fast.
        for _ in 0..50 {
            let state = engine.task_state(&task.id).await.unwrap();
            if state.status.is_terminal() {
                assert_eq!(state.status, crate::task::TaskStatus::Succeeded);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task did not complete in time");
    }

    #[tokio::test]
    async fn starting_unknown_task_is_not_found() {
        let engine = engine().await;
        assert!(matches!(
            engine.start_task("nope").await.unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn stream_unknown_task_is_not_found() {
        struct NullSink;
        #[async_trait::async_trait]
        impl crate::stream_session::EventSink for NullSink {
            async fn send(&mut self, _frame: crate::stream_session::Frame) -> EngineResult<()> {
                Ok(())
            }
            async fn closed(&mut self) {
                std::future::pending::<()>().await;
            }
        }

        let engine = engine().await;
        let mut sink = NullSink;
        assert!(matches!(
            engine.stream("nope", &mut sink).await.unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    /// A task created but never explicitly started (e.g. `taskforge
    /// create --no-start`) must still run when a client streams it —
    /// spec §4.5 step 2.
    #[tokio::test]
    async fn stream_auto_starts_a_pending_task() {
        struct RecordingSink {
            frames: std::sync::Arc<std::sync::Mutex<Vec<crate::stream_session::Frame>>>,
        }
        #[async_trait::async_trait]
        impl crate::stream_session::EventSink for RecordingSink {
            async fn send(&mut self, frame: crate::stream_session::Frame) -> EngineResult<()> {
                self.frames.lock().unwrap().push(frame);
                Ok(())
            }
            async fn closed(&mut self) {
                std::future::pending::<()>().await;
            }
        }

        let engine = engine().await;
        let task = engine
            .create_task("build a todo app", None)
            .await
            .unwrap();

        let frames = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut sink = RecordingSink {
            frames: frames.clone(),
        };
        let reason = engine.stream(&task.id, &mut sink).await.unwrap();
        assert_eq!(reason, crate::stream_session::CloseReason::TaskTerminal);

        let persisted = engine.get_task(&task.id).await.unwrap();
        assert_eq!(persisted.status, crate::task::TaskStatus::Succeeded);
    }

    /// Exercises cancellation against the actual stages `build_stages`
    /// ships (not a test-only stand-in), confirming the configured yield
    /// delay gives `Registry::stop` a real window to land mid-Architect.
    #[tokio::test]
    async fn stopping_the_shipped_pipeline_mid_architect_cancels_it() {
        let store: Arc<dyn DurableStore> =
            Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let mut config = EngineConfig::default();
        config.simulated_stage_delay_ms = 100;
        let engine = Engine::new(config, store);

        let task = engine
            .create_task("build a todo app", None)
            .await
            .unwrap();
        engine.start_task(&task.id).await.unwrap();

        for _ in 0..100 {
            let state = engine.task_state(&task.id).await.unwrap();
            if state.current_stage.as_deref() == Some("ARCHITECT") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        engine.stop_task(&task.id).unwrap();

        for _ in 0..100 {
            let state = engine.task_state(&task.id).await.unwrap();
            if state.status.is_terminal() {
                assert_eq!(state.status, crate::task::TaskStatus::Cancelled);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task did not reach cancelled state in time");
    }
}
