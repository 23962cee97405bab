//! # taskforge-core
//!
//! Core library for the task execution engine: orchestrates a staged
//! PM → Architect → Engineer pipeline per task, exposes both a durable
//! event log and a best-effort live event bus, and serves push-stream
//! sessions against either.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskforge_core::{Engine, EngineConfig};
//! use taskforge_core::store::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::connect("sqlite::memory:").await?);
//!     let engine = Engine::new(EngineConfig::default(), store);
//!
//!     let task = engine.create_task("build a todo app", None).await?;
//!     engine.start_task(&task.id).await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod stream_session;
pub mod task;
pub mod telemetry;
pub mod worker;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use event::{Event, EventKind};
pub use pipeline::{SimulatedStage, Stage, StageContext};
pub use stream_session::{CloseReason, EventSink, Frame, StreamSession};
pub use task::{Task, TaskState, TaskStatus};
