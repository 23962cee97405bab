//! Push-stream session — the transport-agnostic state machine behind the
//! wire protocol (spec §2, §4.5, §6).
//!
//! A `StreamSession` doesn't know about WebSockets, SSE, or anything
//! else; it only knows how to subscribe to the Bus, catch a caller up on
//! the Registry's tail buffer, and decide when to stop. The actual bytes
//! go through whatever implements `EventSink` — `taskforge-server::ws`
//! binds this to an Axum WebSocket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::bus::SubscriptionBus;
use crate::config::StreamConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::Event;
use crate::registry::Registry;
use crate::task::TaskState;

/// One message pushed to a subscriber, in the order a transport should
/// write them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// Sent once, immediately after subscribing: the current snapshot, so
    /// a late subscriber doesn't have to infer state from events alone.
    Connected { task_id: String, state: TaskState },
    /// A live or catch-up event, in `event_id` order.
    Event(Event),
    /// A refreshed state snapshot. Always sent once immediately after the
    /// terminal event, even if its `status` matches what a prior `State`
    /// or `Connected` frame already reported (spec §9 open question).
    State(TaskState),
    /// The session is closing because the peer went idle or the server
    /// gave up waiting for a send to land.
    Error { message: String },
}

/// Something a `StreamSession` can hand frames to, and that can signal
/// when the peer has gone away. Implemented once per transport.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, frame: Frame) -> EngineResult<()>;

    /// Resolve once the peer has disconnected. Implementations that
    /// cannot detect this proactively (e.g. a plain in-process channel)
    /// may simply never resolve; the idle timeout still bounds the
    /// session's lifetime.
    async fn closed(&mut self);
}

/// Why a `StreamSession::run` call returned, so the transport binding can
/// pick the right close code (spec §6: 1000 / 1001 / not-found).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The task reached a terminal status and the drain window elapsed.
    TaskTerminal,
    /// No inbound or outbound traffic for `idle_timeout`.
    Idle,
    /// The peer closed the connection first.
    PeerClosed,
}

/// Drives one subscriber's view of a task's event stream end to end.
pub struct StreamSession {
    task_id: String,
    registry: Arc<Registry>,
    bus: Arc<SubscriptionBus>,
    poll_tick: Duration,
    idle_timeout: Duration,
    drain_window: Duration,
}

impl StreamSession {
    pub fn new(
        task_id: impl Into<String>,
        registry: Arc<Registry>,
        bus: Arc<SubscriptionBus>,
        config: &StreamConfig,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            registry,
            bus,
            poll_tick: Duration::from_millis(config.poll_tick_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            drain_window: Duration::from_millis(config.drain_window_ms),
        }
    }

    /// Run the session to completion against `sink`, returning why it
    /// closed: the task reached a terminal state and the drain window
    /// elapsed, the peer disconnected, or the connection went idle past
    /// `idle_timeout`.
    pub async fn run(&self, sink: &mut dyn EventSink) -> EngineResult<CloseReason> {
        let state = self
            .registry
            .state_snapshot(&self.task_id)
            .ok_or_else(|| EngineError::NotFound(self.task_id.clone()))?;

        let mut rx = self.bus.subscribe(&self.task_id);

        sink.send(Frame::Connected {
            task_id: self.task_id.clone(),
            state: state.clone(),
        })
        .await?;

        let mut last_event_id = 0u64;
        let mut sent_final_state = false;
        for event in self.registry.events_since(&self.task_id, 0) {
            last_event_id = last_event_id.max(event.event_id);
            let terminal = event.is_terminal();
            sink.send(Frame::Event(event)).await?;
            if terminal {
                self.send_final_state(sink).await?;
                sent_final_state = true;
            }
        }

        let mut last_activity = Instant::now();
        let mut drain_deadline = if state.status.is_terminal() {
            if !sent_final_state {
                self.send_final_state(sink).await?;
            }
            Some(Instant::now() + self.drain_window)
        } else {
            None
        };

        loop {
            tokio::select! {
                biased;

                _ = sink.closed() => {
                    debug!(task_id = %self.task_id, "peer disconnected");
                    return Ok(CloseReason::PeerClosed);
                }

                received = rx.recv() => {
                    match received {
                        Some(event) if event.event_id > last_event_id => {
                            let terminal = event.is_terminal();
                            last_event_id = event.event_id;
                            sink.send(Frame::Event(event)).await?;
                            last_activity = Instant::now();
                            if terminal {
                                self.send_final_state(sink).await?;
                                drain_deadline = Some(Instant::now() + self.drain_window);
                            }
                        }
                        Some(_) => {
                            // Already delivered via the catch-up tail; ignore.
                        }
                        None => {
                            // Bus closed: the Worker tore down. Give any
                            // already-queued terminal event its drain window,
                            // then stop.
                            if drain_deadline.is_none() {
                                drain_deadline = Some(Instant::now() + self.drain_window);
                            }
                        }
                    }
                }

                _ = tokio::time::sleep(self.poll_tick) => {
                    if let Some(deadline) = drain_deadline {
                        if Instant::now() >= deadline {
                            return Ok(CloseReason::TaskTerminal);
                        }
                    }
                    if last_activity.elapsed() >= self.idle_timeout {
                        sink.send(Frame::Error {
                            message: "session idle timeout".into(),
                        })
                        .await
                        .ok();
                        return Ok(CloseReason::Idle);
                    }
                }
            }
        }
    }

    /// Send one refreshed `State` frame, reading the freshest snapshot
    /// off the Registry rather than trusting the snapshot carried by the
    /// event that triggered it.
    async fn send_final_state(&self, sink: &mut dyn EventSink) -> EngineResult<()> {
        if let Some(state) = self.registry.state_snapshot(&self.task_id) {
            sink.send(Frame::State(state)).await?;
        }
        Ok(())
    }
}
