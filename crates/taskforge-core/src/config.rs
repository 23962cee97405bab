//! Configuration for the task execution engine.

use serde::{Deserialize, Serialize};

/// Engine configuration — typically loaded from `taskforge.toml` or
/// environment variables by the server/CLI binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard Worker deadline, in seconds. Cancellation past this point is
    /// reported as `FAILED`, not `CANCELLED` (spec §4.3).
    #[serde(default = "default_max_task_duration_seconds")]
    pub max_task_duration_seconds: u64,

    /// When set, stages use the deterministic simulator instead of a real
    /// agent framework. No environment sniffing — must be set explicitly.
    #[serde(default)]
    pub test_mode: bool,

    /// How long `SimulatedStage` sleeps at each yield point (spec §4.4:
    /// "each stage sleeps briefly at each yield point"). A real agent
    /// backend ignores this field entirely.
    #[serde(default = "default_simulated_stage_delay_ms")]
    pub simulated_stage_delay_ms: u64,

    /// Operational log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database connection string for the Durable Store. Opaque to the
    /// rest of the engine.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Push-stream session timing.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Subscription Bus / Registry tuning.
    #[serde(default)]
    pub bus: BusConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_task_duration_seconds: default_max_task_duration_seconds(),
            test_mode: false,
            simulated_stage_delay_ms: default_simulated_stage_delay_ms(),
            log_level: default_log_level(),
            database_url: default_database_url(),
            telemetry: TelemetryConfig::default(),
            stream: StreamConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

fn default_max_task_duration_seconds() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".into()
}

fn default_simulated_stage_delay_ms() -> u64 {
    20
}

fn default_database_url() -> String {
    "sqlite::memory:".into()
}

/// Telemetry/observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether to export traces via OTLP. Structured logging happens
    /// regardless of this flag.
    #[serde(default)]
    pub enabled: bool,

    /// OTLP exporter endpoint.
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".into()
}

/// Push-stream session timing constants (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Poll tick when no event arrives before the next state check.
    #[serde(default = "default_poll_tick_ms")]
    pub poll_tick_ms: u64,

    /// Idle timeout: close the session if nothing was sent or received.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How long to keep draining queued events after the task goes terminal.
    #[serde(default = "default_drain_window_ms")]
    pub drain_window_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_tick_ms: default_poll_tick_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            drain_window_ms: default_drain_window_ms(),
        }
    }
}

fn default_poll_tick_ms() -> u64 {
    500
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_drain_window_ms() -> u64 {
    300
}

/// Subscription Bus and Registry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Minimum channel capacity per subscriber (spec §4.1: "capacity ≥ 64").
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Maximum number of events kept in the Registry's in-memory tail
    /// buffer per task before the oldest are evicted.
    #[serde(default = "default_tail_buffer_len")]
    pub tail_buffer_len: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            tail_buffer_len: default_tail_buffer_len(),
        }
    }
}

fn default_channel_capacity() -> usize {
    64
}

fn default_tail_buffer_len() -> usize {
    256
}
