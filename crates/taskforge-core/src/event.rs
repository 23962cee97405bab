//! Event — the immutable unit of observation emitted by a Worker.
//!
//! An `Event` is one of a closed set of kinds, each carrying its own
//! structured payload. `event_id` is assigned by the Worker under its
//! per-task emission lock and is strictly monotonic, starting at 1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single event in a task's ordered stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing integer, per task, starting at 1.
    pub event_id: u64,

    /// The task this event belongs to.
    pub task_id: String,

    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,

    /// The stage that produced this event, or `None` for engine-level
    /// events (e.g. the startup `LOG` or a terminal `RESULT`/`ERROR`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,

    /// The kind and kind-specific payload, flattened into `kind`/`payload`
    /// on the wire (spec §3, §6).
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Human-readable kind discriminator, e.g. for logging.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EventKind::Log(_) => "LOG",
            EventKind::Message(_) => "MESSAGE",
            EventKind::StageStart(_) => "STAGE_START",
            EventKind::StageComplete(_) => "STAGE_COMPLETE",
            EventKind::Result(_) => "RESULT",
            EventKind::Error(_) => "ERROR",
        }
    }

    /// True for `RESULT` and `ERROR` — the only kinds that may terminate a
    /// task's event stream (spec §3 invariants).
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Result(_) | EventKind::Error(_))
    }
}

/// The closed set of event kinds (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Generic operational note.
    Log(LogPayload),
    /// Stage produced human-readable output (and optionally an artifact
    /// or execution result).
    Message(MessagePayload),
    /// A stage began work.
    StageStart(StageStartPayload),
    /// A stage finished successfully.
    StageComplete(StageCompletePayload),
    /// Terminal success, carrying the final aggregate.
    Result(ResultPayload),
    /// Any failure: stage error, deadline, or internal.
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: String,

    /// Present when this message carries a produced file (spec §4.4:
    /// "one per produced file").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_artifact: Option<FileArtifact>,

    /// Present when this message carries the output of running the
    /// primary artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOutput>,
}

impl MessagePayload {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file_artifact: None,
            execution: None,
        }
    }

    pub fn with_file_artifact(message: impl Into<String>, artifact: FileArtifact) -> Self {
        Self {
            message: message.into(),
            file_artifact: Some(artifact),
            execution: None,
        }
    }

    pub fn with_execution(message: impl Into<String>, execution: ExecutionOutput) -> Self {
        Self {
            message: message.into(),
            file_artifact: None,
            execution: Some(execution),
        }
    }
}

/// A file produced by a stage (spec §4.4: Engineer stage artifacts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileArtifact {
    pub file_path: String,
    pub content: String,
    /// Always `"code"` per spec §4.4; kept as a field rather than a
    /// constant so the payload shape matches the wire format exactly.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl FileArtifact {
    pub fn code(file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            content: content.into(),
            kind: "code".into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Output of running the primary artifact (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStartPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCompletePayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPayload {
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_has_flat_kind_and_payload() {
        let event = Event {
            event_id: 1,
            task_id: "t-1".into(),
            timestamp: Utc::now(),
            stage_name: Some("PM".into()),
            kind: EventKind::StageStart(StageStartPayload {
                message: "PM starting".into(),
            }),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "STAGE_START");
        assert_eq!(json["payload"]["message"], "PM starting");
        assert_eq!(json["stage_name"], "PM");
        assert_eq!(json["event_id"], 1);
    }

    #[test]
    fn is_terminal_only_for_result_and_error() {
        let base = Event {
            event_id: 1,
            task_id: "t".into(),
            timestamp: Utc::now(),
            stage_name: None,
            kind: EventKind::Log(LogPayload {
                message: "x".into(),
            }),
        };
        assert!(!base.is_terminal());

        let mut terminal = base.clone();
        terminal.kind = EventKind::Result(ResultPayload {
            result: serde_json::json!({}),
        });
        assert!(terminal.is_terminal());
    }

    #[test]
    fn round_trips_through_json() {
        let event = Event {
            event_id: 42,
            task_id: "t-1".into(),
            timestamp: Utc::now(),
            stage_name: None,
            kind: EventKind::Error(ErrorPayload {
                message: "cancelled".into(),
                detail: None,
            }),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_id, 42);
        assert!(matches!(parsed.kind, EventKind::Error(_)));
    }
}
