//! Process Manager
//!
//! Spawns processes as isolated tasks, routes commands to them, tracks their
//! liveness and stops them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{
    Process, ProcessCommand, ProcessContext, ProcessError, ProcessHandle, ProcessResult,
    ProcessSpec, ProcessState,
};

// ─────────────────────────────────────────────────────────────────────────────
// Running Process
// ─────────────────────────────────────────────────────────────────────────────

struct RunningProcess {
    handle: ProcessHandle,
    join_handle: JoinHandle<ProcessResult<()>>,
    spec: ProcessSpec,
}

impl RunningProcess {
    /// A process whose task ended (including by panic) is not alive even if
    /// its last recorded state says otherwise
    fn is_alive(&self) -> bool {
        !self.handle.is_terminal() && !self.join_handle.is_finished()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Central manager for all processes
pub struct ProcessManager {
    /// Spawned processes indexed by process id
    processes: DashMap<String, RunningProcess>,

    /// Broadcast channel for shutdown signal
    shutdown_tx: broadcast::Sender<()>,

    default_shutdown_timeout: Duration,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            processes: DashMap::new(),
            shutdown_tx,
            default_shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Spawn a process with its serialized arguments
    ///
    /// A dead process with the same id is replaced; a live one is an error.
    pub async fn spawn<P: Process>(
        &self,
        process: P,
        args: serde_json::Value,
    ) -> ProcessResult<ProcessHandle> {
        let spec = process.spec();
        let process_id = spec.id.clone();

        if let Some(existing) = self.processes.get(&process_id) {
            if existing.is_alive() {
                return Err(ProcessError::AlreadyRunning(process_id));
            }
        }
        self.processes.remove(&process_id);

        let (command_tx, command_rx) = mpsc::channel(64);
        let state = Arc::new(AtomicU8::new(ProcessState::Starting as u8));
        let handle = ProcessHandle::new(process_id.clone(), command_tx, Arc::clone(&state));

        let ctx = ProcessContext::new(process_id.clone(), args);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let tick_interval = spec.tick_interval;
        let shutdown_timeout = spec.shutdown_timeout;
        let state_clone = Arc::clone(&state);

        let join_handle = tokio::spawn(async move {
            run_process_loop(
                process,
                ctx,
                command_rx,
                shutdown_rx,
                state_clone,
                tick_interval,
                shutdown_timeout,
            )
            .await
        });

        self.processes.insert(
            process_id,
            RunningProcess {
                handle: handle.clone(),
                join_handle,
                spec,
            },
        );

        Ok(handle)
    }

    pub fn get(&self, process_id: &str) -> Option<ProcessHandle> {
        self.processes.get(process_id).map(|p| p.handle.clone())
    }

    /// Whether the process exists and its task is still alive
    pub fn is_alive(&self, process_id: &str) -> bool {
        self.processes
            .get(process_id)
            .map(|p| p.is_alive())
            .unwrap_or(false)
    }

    /// Remove records of processes whose task has ended; returns their ids
    pub fn reap(&self) -> Vec<String> {
        let dead: Vec<String> = self
            .processes
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();
        for id in &dead {
            self.processes.remove(id);
        }
        dead
    }

    /// Route a request to a process and wait for its reply
    pub async fn request(
        &self,
        process_id: &str,
        payload: serde_json::Value,
    ) -> ProcessResult<serde_json::Value> {
        let handle = self
            .get(process_id)
            .ok_or_else(|| ProcessError::NotRunning(process_id.to_string()))?;
        handle.request(payload).await
    }

    /// Stop a specific process and wait for it to finish
    pub async fn stop(&self, process_id: &str) -> ProcessResult<()> {
        let running = self
            .processes
            .remove(process_id)
            .map(|(_, v)| v)
            .ok_or_else(|| ProcessError::NotRunning(process_id.to_string()))?;

        let _ = running.handle.shutdown().await;

        // on_stop has its own timeout inside the loop; allow a little extra
        let timeout = running.spec.shutdown_timeout + Duration::from_secs(1);
        match tokio::time::timeout(timeout, running.join_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(process_id, error = ?e, "Process task panicked");
                Err(ProcessError::Internal(format!("Task panicked: {:?}", e)))
            }
            Err(_) => {
                tracing::warn!(process_id, "Process shutdown timed out");
                Err(ProcessError::ShutdownTimeout)
            }
        }
    }

    /// Shut down every process
    pub async fn shutdown_all(&self) -> ProcessResult<()> {
        tracing::info!(count = self.processes.len(), "Shutting down all processes");

        let _ = self.shutdown_tx.send(());

        let timeout = self.default_shutdown_timeout;
        let result = tokio::time::timeout(timeout, async {
            while !self.processes.is_empty() {
                self.processes.retain(|_, p| p.is_alive());
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if result.is_err() {
            tracing::warn!("Some processes did not stop within timeout");
            return Err(ProcessError::ShutdownTimeout);
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Task Loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run_process_loop<P: Process>(
    mut process: P,
    ctx: ProcessContext,
    mut command_rx: mpsc::Receiver<ProcessCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
    state: Arc<AtomicU8>,
    tick_interval: Duration,
    shutdown_timeout: Duration,
) -> ProcessResult<()> {
    state.store(ProcessState::Starting as u8, Ordering::SeqCst);

    if let Err(e) = process.init_process(&ctx).await {
        tracing::error!(process_id = %ctx.process_id, error = %e, "Process failed to initialize");
        state.store(ProcessState::Failed as u8, Ordering::SeqCst);
        return Err(e);
    }

    state.store(ProcessState::Running as u8, Ordering::SeqCst);
    tracing::info!(process_id = %ctx.process_id, "Process started");

    // Ticks never overlap: a slow tick delays the next one
    let mut tick_timer = tokio::time::interval(tick_interval);
    tick_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut failure = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::debug!(process_id = %ctx.process_id, "Received global shutdown signal");
                break;
            }

            Some(cmd) = command_rx.recv() => {
                match cmd {
                    ProcessCommand::Shutdown => {
                        tracing::debug!(process_id = %ctx.process_id, "Received shutdown command");
                        break;
                    }
                    ProcessCommand::Restart => {
                        tracing::info!(process_id = %ctx.process_id, "Restarting process");
                        if let Err(e) = process.restart(&ctx).await {
                            tracing::error!(process_id = %ctx.process_id, error = %e, "Restart failed");
                            failure = Some(e);
                            break;
                        }
                    }
                    ProcessCommand::ForceTick => {
                        if let Err(e) = process.tick(&ctx).await {
                            if e.is_fatal() {
                                failure = Some(e);
                                break;
                            }
                            tracing::warn!(process_id = %ctx.process_id, error = %e, "Error during forced tick");
                        }
                    }
                    ProcessCommand::GetState(tx) => {
                        let current = ProcessState::from_u8(state.load(Ordering::SeqCst));
                        let _ = tx.send(current);
                    }
                    ProcessCommand::Request { payload, reply } => {
                        let result = process.on_request(&ctx, payload).await;
                        let _ = reply.send(result);
                    }
                }
            }

            _ = tick_timer.tick() => {
                if let Err(e) = process.tick(&ctx).await {
                    if e.is_fatal() {
                        failure = Some(e);
                        break;
                    }
                    tracing::warn!(process_id = %ctx.process_id, error = %e, "Error during tick");
                }
            }
        }
    }

    state.store(ProcessState::Stopping as u8, Ordering::SeqCst);
    tracing::debug!(process_id = %ctx.process_id, "Process stopping");

    let stop_result = tokio::time::timeout(shutdown_timeout, process.on_stop(&ctx)).await;

    let result = match (failure, stop_result) {
        (Some(e), _) => {
            tracing::error!(process_id = %ctx.process_id, error = %e, "Process failed");
            Err(e)
        }
        (None, Ok(Ok(()))) => {
            tracing::info!(process_id = %ctx.process_id, "Process stopped");
            Ok(())
        }
        (None, Ok(Err(e))) => {
            tracing::error!(process_id = %ctx.process_id, error = %e, "Process stop failed");
            Err(e)
        }
        (None, Err(_)) => {
            tracing::error!(process_id = %ctx.process_id, "Process stop timed out");
            Err(ProcessError::ShutdownTimeout)
        }
    };

    let final_state = if result.is_ok() {
        ProcessState::Stopped
    } else {
        ProcessState::Failed
    };
    state.store(final_state as u8, Ordering::SeqCst);
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
