//! Process Handle
//!
//! A handle to communicate with a running process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::{mpsc, oneshot};

use super::{ProcessError, ProcessResult};

// ─────────────────────────────────────────────────────────────────────────────
// Process State
// ─────────────────────────────────────────────────────────────────────────────

/// Current state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Failed = 4,
}

impl ProcessState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }

    pub fn is_running(&self) -> bool {
        *self == ProcessState::Running
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Command
// ─────────────────────────────────────────────────────────────────────────────

/// Commands that can be sent to a running process
pub enum ProcessCommand {
    /// Request graceful shutdown
    Shutdown,

    /// Stop and re-initialize the process in place
    Restart,

    /// Run one tick now
    ForceTick,

    /// Request current process state
    GetState(oneshot::Sender<ProcessState>),

    /// Route a request to the process and wait for its reply
    Request {
        payload: serde_json::Value,
        reply: oneshot::Sender<ProcessResult<serde_json::Value>>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Lightweight, cloneable handle to a running process
#[derive(Clone)]
pub struct ProcessHandle {
    pub process_id: String,

    command_tx: mpsc::Sender<ProcessCommand>,

    /// Process state (atomic for lock-free reads)
    state: Arc<AtomicU8>,
}

impl ProcessHandle {
    pub(crate) fn new(
        process_id: String,
        command_tx: mpsc::Sender<ProcessCommand>,
        state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            process_id,
            command_tx,
            state,
        }
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    async fn send(&self, cmd: ProcessCommand) -> ProcessResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| ProcessError::NotRunning(self.process_id.clone()))
    }

    /// Request graceful shutdown
    pub async fn shutdown(&self) -> ProcessResult<()> {
        self.send(ProcessCommand::Shutdown).await
    }

    pub async fn restart(&self) -> ProcessResult<()> {
        self.send(ProcessCommand::Restart).await
    }

    pub async fn force_tick(&self) -> ProcessResult<()> {
        self.send(ProcessCommand::ForceTick).await
    }

    /// Request state via channel (waits for the process loop to answer)
    pub async fn request_state(&self) -> ProcessResult<ProcessState> {
        let (tx, rx) = oneshot::channel();
        self.send(ProcessCommand::GetState(tx)).await?;
        rx.await.map_err(|_| ProcessError::ChannelClosed)
    }

    /// Send a request to the process and wait for its reply
    pub async fn request(&self, payload: serde_json::Value) -> ProcessResult<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        self.send(ProcessCommand::Request { payload, reply }).await?;
        rx.await.map_err(|_| ProcessError::ChannelClosed)?
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("process_id", &self.process_id)
            .field("state", &self.state())
            .finish()
    }
}
