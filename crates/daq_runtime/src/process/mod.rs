//! Process Lifecycle Management
//!
//! A process is one long-running acquisition worker. The manager drives it
//! through these hooks:
//! - `init_process`: called once when the process starts
//! - `tick`: called on every tick of the process cadence, never overlapping
//! - `restart`: called on an explicit restart command
//! - `on_request`: called for request/reply commands routed to the process
//! - `on_stop`: called when the process stops

mod handle;
mod manager;

pub use handle::*;
pub use manager::*;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Process Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during process lifecycle
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("Process initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Process already running: {0}")]
    AlreadyRunning(String),

    #[error("Process not running: {0}")]
    NotRunning(String),

    #[error("Tick failed: {0}")]
    TickFailed(String),

    /// The process cannot continue; the loop exits in the failed state
    #[error("Fatal process error: {0}")]
    Fatal(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProcessError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessError::Fatal(_))
    }
}

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;

// ─────────────────────────────────────────────────────────────────────────────
// Process Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for a process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Unique process identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Interval between ticks
    pub tick_interval: Duration,

    /// Timeout for graceful shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl ProcessSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, tick_interval: Duration) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tick_interval,
            shutdown_timeout: default_shutdown_timeout(),
            description: None,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to process lifecycle methods
pub struct ProcessContext {
    pub process_id: String,

    /// Serialized arguments the process was spawned with
    pub args: serde_json::Value,
}

impl ProcessContext {
    pub fn new(process_id: String, args: serde_json::Value) -> Self {
        Self { process_id, args }
    }

    /// Get an argument as a specific type
    pub fn get_arg<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.args
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A long-running worker managed by the [`ProcessManager`]
#[async_trait]
pub trait Process: Send + Sync + 'static {
    /// Returns the process specification
    fn spec(&self) -> ProcessSpec;

    /// Called once when the process starts. If this returns an error the
    /// process ends in the failed state.
    async fn init_process(&mut self, ctx: &ProcessContext) -> ProcessResult<()>;

    /// Called on every tick. A [`ProcessError::Fatal`] ends the process;
    /// other errors are logged and the next tick runs as usual.
    async fn tick(&mut self, ctx: &ProcessContext) -> ProcessResult<()>;

    /// Called on an explicit restart command. The default stops and
    /// re-initializes the process.
    async fn restart(&mut self, ctx: &ProcessContext) -> ProcessResult<()> {
        self.on_stop(ctx).await?;
        self.init_process(ctx).await
    }

    /// Handle a request routed to this process and produce its reply
    async fn on_request(
        &mut self,
        _ctx: &ProcessContext,
        _request: serde_json::Value,
    ) -> ProcessResult<serde_json::Value> {
        Err(ProcessError::RequestFailed("requests not supported".into()))
    }

    /// Called when the process stops. The process is stopped even if this
    /// returns an error.
    async fn on_stop(&mut self, ctx: &ProcessContext) -> ProcessResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_spec_builder() {
        let spec = ProcessSpec::new("1-192.168.1.10:47808", "Gateway 1", Duration::from_secs(5))
            .with_shutdown_timeout(Duration::from_secs(2))
            .with_description("BACnet group");

        assert_eq!(spec.id, "1-192.168.1.10:47808");
        assert_eq!(spec.tick_interval, Duration::from_secs(5));
        assert_eq!(spec.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(spec.description.as_deref(), Some("BACnet group"));
    }

    #[test]
    fn test_context_args() {
        let ctx = ProcessContext::new(
            "group".into(),
            serde_json::json!({ "device_ids": [1, 4, 7] }),
        );
        assert_eq!(ctx.get_arg::<Vec<u32>>("device_ids"), Some(vec![1, 4, 7]));
        assert_eq!(ctx.get_arg::<Vec<u32>>("missing"), None);
    }
}
