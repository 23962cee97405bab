//! Stage — the seam between the engine and whatever actually does the
//! work (spec §2, §4.4).
//!
//! The engine never depends on a concrete agent framework. `Stage` is
//! the trait a PM/Architect/Engineer coroutine implements; `StageContext`
//! is the handle through which a stage emits events and observes
//! cancellation. `SimulatedStage` is the only implementation this crate
//! ships — a deterministic stand-in used when `EngineConfig::test_mode`
//! is set, so the rest of the engine (Registry, Bus, Worker, transport)
//! can be exercised end to end without a real agent backend.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::EngineResult;
use crate::event::{
    ErrorPayload, EventKind, ExecutionOutput, FileArtifact, LogPayload, MessagePayload,
    StageCompletePayload, StageStartPayload,
};

/// Something a Worker can hand events to. Implemented by the Worker
/// itself; stages never see the Registry, Bus, or Durable Store
/// directly.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, stage_name: &str, kind: EventKind) -> EngineResult<()>;
}

/// One invocation's view of the world: its input, what the previous
/// stage handed it, and how to talk back.
pub struct StageContext<'a> {
    pub task_id: String,
    pub input_prompt: String,
    /// The previous stage's output, or `Value::Null` for the first stage.
    pub upstream: serde_json::Value,
    emitter: &'a dyn EventEmitter,
    cancel_token: CancellationToken,
}

impl<'a> StageContext<'a> {
    pub fn new(
        task_id: impl Into<String>,
        input_prompt: impl Into<String>,
        upstream: serde_json::Value,
        emitter: &'a dyn EventEmitter,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            input_prompt: input_prompt.into(),
            upstream,
            emitter,
            cancel_token,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub async fn log(&self, stage_name: &str, message: impl Into<String>) -> EngineResult<()> {
        self.emitter
            .emit(
                stage_name,
                EventKind::Log(LogPayload {
                    message: message.into(),
                }),
            )
            .await
    }

    pub async fn message(&self, stage_name: &str, message: impl Into<String>) -> EngineResult<()> {
        self.emitter
            .emit(stage_name, EventKind::Message(MessagePayload::text(message)))
            .await
    }

    pub async fn message_with_artifact(
        &self,
        stage_name: &str,
        message: impl Into<String>,
        artifact: FileArtifact,
    ) -> EngineResult<()> {
        self.emitter
            .emit(
                stage_name,
                EventKind::Message(MessagePayload::with_file_artifact(message, artifact)),
            )
            .await
    }

    pub async fn message_with_execution(
        &self,
        stage_name: &str,
        message: impl Into<String>,
        execution: ExecutionOutput,
    ) -> EngineResult<()> {
        self.emitter
            .emit(
                stage_name,
                EventKind::Message(MessagePayload::with_execution(message, execution)),
            )
            .await
    }
}

/// One stage of the pipeline: PM, Architect, or Engineer (spec §4.4).
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run this stage to completion, emitting `StageStart`/`Message`/
    /// `StageComplete` events as it goes, and returning its output for
    /// the next stage (or the final `RESULT` aggregate, for the last
    /// stage). Stages must check `ctx.is_cancelled()` at reasonable
    /// checkpoints and return `EngineError::Cancelled` promptly.
    async fn run(&self, ctx: &StageContext<'_>) -> EngineResult<serde_json::Value>;
}

/// Which of the three fixed pipeline stages a `SimulatedStage` plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedStageKind {
    Pm,
    Architect,
    Engineer,
}

/// Deterministic stand-in for a real agent. Produces plausible output
/// for its stage without calling out to any model or tool, so the rest
/// of the engine can be exercised deterministically (spec §4.4,
/// `EngineConfig::test_mode`). Sleeps briefly at each yield point so
/// cancellation and deadline checks have a real window to land in,
/// exactly as the reference test-mode implementation is specified to do.
pub struct SimulatedStage {
    kind: SimulatedStageKind,
    delay: Duration,
}

impl SimulatedStage {
    pub fn new(kind: SimulatedStageKind, delay: Duration) -> Self {
        Self { kind, delay }
    }

    pub fn pm(delay: Duration) -> Self {
        Self::new(SimulatedStageKind::Pm, delay)
    }

    pub fn architect(delay: Duration) -> Self {
        Self::new(SimulatedStageKind::Architect, delay)
    }

    pub fn engineer(delay: Duration) -> Self {
        Self::new(SimulatedStageKind::Engineer, delay)
    }

    /// Sleep for this stage's configured yield delay, then re-check
    /// cancellation — the actual "suspension point" a real stage's
    /// `await` would provide (spec §5).
    async fn yield_point(&self, ctx: &StageContext<'_>) -> EngineResult<()> {
        tokio::time::sleep(self.delay).await;
        if ctx.is_cancelled() {
            return Err(crate::error::EngineError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for SimulatedStage {
    fn name(&self) -> &'static str {
        match self.kind {
            SimulatedStageKind::Pm => "PM",
            SimulatedStageKind::Architect => "ARCHITECT",
            SimulatedStageKind::Engineer => "ENGINEER",
        }
    }

    async fn run(&self, ctx: &StageContext<'_>) -> EngineResult<serde_json::Value> {
        let name = self.name();

        if ctx.is_cancelled() {
            return Err(crate::error::EngineError::Cancelled);
        }

        match self.kind {
            SimulatedStageKind::Pm => {
                ctx.log(name, "analyzing requirement").await?;
                self.yield_point(ctx).await?;

                let spec = serde_json::json!({
                    "summary": format!("Requirements for: {}", ctx.input_prompt),
                    "goals": ["ship a working prototype", "keep scope small"],
                });
                ctx.message(
                    name,
                    format!("Drafted requirements for \"{}\"", ctx.input_prompt),
                )
                .await?;
                Ok(spec)
            }
            SimulatedStageKind::Architect => {
                ctx.log(name, "designing module layout").await?;
                self.yield_point(ctx).await?;

                let design = serde_json::json!({
                    "modules": ["main", "lib", "tests"],
                    "based_on": ctx.upstream,
                });
                ctx.message(name, "Proposed a single-binary module layout")
                    .await?;
                self.yield_point(ctx).await?;

                Ok(design)
            }
            SimulatedStageKind::Engineer => {
                ctx.log(name, "writing implementation").await?;
                self.yield_point(ctx).await?;

                let artifact = FileArtifact::code(
                    "src/main.rs",
                    "fn main() {\n    println!(\"hello from the generated prototype\");\n}\n",
                )
                .with_language("rust");

                ctx.message_with_artifact(name, "Wrote src/main.rs", artifact)
                    .await?;
                self.yield_point(ctx).await?;

                let execution = ExecutionOutput {
                    command: "cargo run".into(),
                    stdout: "hello from the generated prototype\n".into(),
                    stderr: String::new(),
                    exit_code: 0,
                };
                ctx.message_with_execution(name, "Ran the generated program", execution)
                    .await?;

                Ok(serde_json::json!({
                    "files_written": ["src/main.rs"],
                    "design": ctx.upstream,
                }))
            }
        }
    }
}

/// Emit this stage's `StageStart`/`StageComplete` bracket around `run`.
/// Shared by every `Stage` driver in `worker::run_pipeline` so the
/// bracketing is identical regardless of which stage is executing.
pub async fn run_with_bracket(
    stage: &dyn Stage,
    ctx: &StageContext<'_>,
) -> EngineResult<serde_json::Value> {
    let name = stage.name();
    ctx.emitter
        .emit(
            name,
            EventKind::StageStart(StageStartPayload {
                message: format!("{name} starting"),
            }),
        )
        .await?;

    match stage.run(ctx).await {
        Ok(output) => {
            ctx.emitter
                .emit(
                    name,
                    EventKind::StageComplete(StageCompletePayload {
                        message: format!("{name} complete"),
                        summary: None,
                    }),
                )
                .await?;
            Ok(output)
        }
        Err(err) => {
            ctx.emitter
                .emit(
                    name,
                    EventKind::Error(ErrorPayload {
                        message: format!("{name} failed"),
                        detail: Some(err.to_string()),
                    }),
                )
                .await
                .ok();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingEmitter {
        events: Mutex<Vec<(String, String)>>,
    }

    impl RecordingEmitter {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventEmitter for RecordingEmitter {
        async fn emit(&self, stage_name: &str, kind: EventKind) -> EngineResult<()> {
            let kind_name = match kind {
                EventKind::Log(_) => "LOG",
                EventKind::Message(_) => "MESSAGE",
                EventKind::StageStart(_) => "STAGE_START",
                EventKind::StageComplete(_) => "STAGE_COMPLETE",
                EventKind::Result(_) => "RESULT",
                EventKind::Error(_) => "ERROR",
            };
            self.events
                .lock()
                .unwrap()
                .push((stage_name.to_string(), kind_name.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn pm_stage_emits_log_then_message() {
        let emitter = RecordingEmitter::new();
        let ctx = StageContext::new(
            "t-1",
            "build a todo app",
            serde_json::Value::Null,
            &emitter,
            CancellationToken::new(),
        );
        let stage = SimulatedStage::pm(Duration::ZERO);
        let output = stage.run(&ctx).await.unwrap();

        assert!(output["summary"].as_str().unwrap().contains("todo app"));
        let events = emitter.events.lock().unwrap();
        assert_eq!(events[0], ("PM".to_string(), "LOG".to_string()));
        assert_eq!(events[1], ("PM".to_string(), "MESSAGE".to_string()));
    }

    #[tokio::test]
    async fn cancelled_stage_returns_cancelled_error() {
        let emitter = RecordingEmitter::new();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = StageContext::new("t-1", "x", serde_json::Value::Null, &emitter, token);

        let err = SimulatedStage::engineer(Duration::ZERO).run(&ctx).await.unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_during_yield_point_is_observed() {
        let emitter = RecordingEmitter::new();
        let token = CancellationToken::new();
        let ctx = StageContext::new(
            "t-1",
            "x",
            serde_json::Value::Null,
            &emitter,
            token.clone(),
        );
        let stage = SimulatedStage::architect(Duration::from_millis(50));

        let run = stage.run(&ctx);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("stage completed before the cancel fired"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => token.cancel(),
        }

        let err = run.await.unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Cancelled));
    }

    #[tokio::test]
    async fn run_with_bracket_emits_start_and_complete() {
        let emitter = RecordingEmitter::new();
        let ctx = StageContext::new(
            "t-1",
            "x",
            serde_json::Value::Null,
            &emitter,
            CancellationToken::new(),
        );
        let stage = SimulatedStage::architect(Duration::ZERO);
        run_with_bracket(&stage, &ctx).await.unwrap();

        let events = emitter.events.lock().unwrap();
        assert_eq!(events.first().unwrap().1, "STAGE_START");
        assert_eq!(events.last().unwrap().1, "STAGE_COMPLETE");
    }
}
