//! `GET /stream/:task_id` — the axum WebSocket binding for the
//! push-stream protocol (spec §6).
//!
//! This module's only job is adapting `axum::extract::ws::WebSocket` to
//! `taskforge_core::EventSink`; the protocol state machine itself lives
//! entirely in `taskforge_core::StreamSession`.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use taskforge_core::{CloseReason, EngineError, EventSink, Frame};
use tracing::warn;

use crate::state::AppState;

pub async fn stream_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, task_id, socket))
}

async fn handle_socket(state: AppState, task_id: String, socket: WebSocket) {
    let (sender, receiver) = socket.split();
    let mut sink = WebSocketEventSink { sender, receiver };

    match state.engine.stream(&task_id, &mut sink).await {
        Ok(CloseReason::TaskTerminal) => {
            sink.close(1000, "task terminal").await;
        }
        Ok(CloseReason::Idle) => {
            sink.close(1001, "idle timeout").await;
        }
        Ok(CloseReason::PeerClosed) => {
            // The peer already initiated the close handshake; nothing
            // further to send (spec §4.5 step 6: "peer closed: exit the
            // loop silently").
        }
        Err(EngineError::NotFound(_)) => {
            let _ = sink
                .send(Frame::Error {
                    message: format!("task not found: {task_id}"),
                })
                .await;
            sink.close(4404, "task not found").await;
        }
        Err(err) => {
            warn!(task_id = %task_id, error = %err, "stream session ended with an error");
            sink.close(1011, "internal error").await;
        }
    }
}

struct WebSocketEventSink {
    sender: SplitSink<WebSocket, Message>,
    receiver: SplitStream<WebSocket>,
}

impl WebSocketEventSink {
    async fn close(&mut self, code: u16, reason: &'static str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
}

#[async_trait::async_trait]
impl EventSink for WebSocketEventSink {
    async fn send(&mut self, frame: Frame) -> Result<(), EngineError> {
        let text = serde_json::to_string(&frame)?;
        self.sender
            .send(Message::Text(text))
            .await
            .map_err(|e| EngineError::TransportError(e.to_string()))
    }

    async fn closed(&mut self) {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Close(_))) | None => return,
                Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    }
}
