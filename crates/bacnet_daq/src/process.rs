//! Device groups as managed processes
//!
//! Each group runs as a [`Process`] under the [`ProcessManager`]. Ticks and
//! requests execute on the blocking pool because every BACnet request
//! blocks until its response arrives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use daq_runtime::{Process, ProcessContext, ProcessError, ProcessManager, ProcessResult, ProcessSpec};

use crate::client::Connector;
use crate::convert::ValueConverter;
use crate::discovery::RemoteDeviceSummary;
use crate::error::{DaqError, DaqResult, ErrorReply};
use crate::inventory::InventorySink;
use crate::model::{PollResult, VariableId};
use crate::recorder::Recorder;
use crate::registry::GroupSpawner;
use crate::scheduler::{GroupShutdown, GroupState, PollScheduler, SchedulerSettings};
use crate::topology::DeviceGroupSpec;

// ─────────────────────────────────────────────────────────────────────────────
// Request / Reply
// ─────────────────────────────────────────────────────────────────────────────

/// Requests routed to a running group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum GroupRequest {
    Write { variable_id: VariableId, value: f64 },
    Discover,
    State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum GroupReply {
    /// The verified read-back of a write
    Written { result: PollResult },
    Discovered { devices: Vec<RemoteDeviceSummary> },
    State { state: GroupState, device_instance: u32 },
    Failed { error: ErrorReply },
}

impl GroupReply {
    fn from_result<T>(result: DaqResult<T>, ok: impl FnOnce(T) -> GroupReply) -> Self {
        match result {
            Ok(value) => ok(value),
            Err(e) => GroupReply::Failed {
                error: ErrorReply::from(&e),
            },
        }
    }
}

/// Send `request` to the group process `key` and decode its reply
pub async fn request_group(
    manager: &ProcessManager,
    key: &str,
    request: &GroupRequest,
) -> DaqResult<GroupReply> {
    let payload = serde_json::to_value(request)
        .map_err(|e| ProcessError::RequestFailed(e.to_string()))?;
    let reply = manager.request(key, payload).await?;
    serde_json::from_value(reply).map_err(|e| ProcessError::RequestFailed(e.to_string()).into())
}

// ─────────────────────────────────────────────────────────────────────────────
// Group Process
// ─────────────────────────────────────────────────────────────────────────────

pub struct GroupProcess {
    spec: DeviceGroupSpec,
    tick_interval: Duration,
    scheduler: Arc<Mutex<PollScheduler>>,
    shutdown: GroupShutdown,
}

impl GroupProcess {
    pub fn new(scheduler: PollScheduler, tick_interval: Duration) -> Self {
        Self {
            spec: scheduler.spec().clone(),
            shutdown: scheduler.shutdown_handle(),
            tick_interval,
            scheduler: Arc::new(Mutex::new(scheduler)),
        }
    }

    pub fn shutdown_handle(&self) -> GroupShutdown {
        self.shutdown.clone()
    }

    /// Arguments the process is spawned with
    pub fn args(&self) -> serde_json::Value {
        serde_json::json!({
            "group": self.spec.key,
            "device_ids": self.spec.device_ids(),
        })
    }

    async fn run_blocking<T, F>(&self, f: F) -> ProcessResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PollScheduler) -> T + Send + 'static,
    {
        let scheduler = Arc::clone(&self.scheduler);
        tokio::task::spawn_blocking(move || f(&mut scheduler.lock()))
            .await
            .map_err(|e| ProcessError::Internal(format!("Group task panicked: {}", e)))
    }
}

#[async_trait]
impl Process for GroupProcess {
    fn spec(&self) -> ProcessSpec {
        let name = if self.spec.gateway.name.is_empty() {
            self.spec.key.clone()
        } else {
            self.spec.gateway.name.clone()
        };
        // A tick may be blocked on a request for the full request timeout
        let shutdown_timeout = self.spec.gateway.request_timeout * 2 + Duration::from_secs(1);
        ProcessSpec::new(self.spec.key.clone(), name, self.tick_interval)
            .with_shutdown_timeout(shutdown_timeout)
            .with_description(format!(
                "BACnet group with {} remote devices and {} objects",
                self.spec.remote_devices.len(),
                self.spec.objects.len()
            ))
    }

    async fn init_process(&mut self, ctx: &ProcessContext) -> ProcessResult<()> {
        tracing::info!(
            group = %ctx.process_id,
            device_ids = ?ctx.get_arg::<Vec<u32>>("device_ids").unwrap_or_default(),
            "Starting device group"
        );
        match self.run_blocking(|s| s.connect()).await? {
            Err(DaqError::Stopped(key)) => Err(ProcessError::InitializationFailed(format!(
                "group {} is stopped",
                key
            ))),
            // Bind failures are retried by the next tick
            _ => Ok(()),
        }
    }

    async fn tick(&mut self, ctx: &ProcessContext) -> ProcessResult<()> {
        let report = self.run_blocking(|s| s.tick()).await?;
        tracing::trace!(
            group = %ctx.process_id,
            state = %report.state,
            reads = report.reads,
            null_reads = report.null_reads,
            emitted = report.emitted.len(),
            "Tick complete"
        );
        // A requested shutdown is followed by the stop command
        if report.state == GroupState::Stopped && !self.shutdown.is_requested() {
            return Err(ProcessError::Fatal(format!("group {} stopped", ctx.process_id)));
        }
        Ok(())
    }

    async fn restart(&mut self, ctx: &ProcessContext) -> ProcessResult<()> {
        tracing::info!(group = %ctx.process_id, "Restarting device group");
        let reconnected = self
            .run_blocking(|s| {
                s.disconnect();
                s.connect()
            })
            .await?;
        match reconnected {
            Ok(()) => Ok(()),
            Err(DaqError::Stopped(key)) => Err(ProcessError::Fatal(format!("group {} is stopped", key))),
            Err(e) => {
                // The group stays disconnected and the next tick binds again
                tracing::warn!(group = %ctx.process_id, kind = ?e.kind(), error = %e, "Reconnect after restart failed");
                Ok(())
            }
        }
    }

    async fn on_request(
        &mut self,
        _ctx: &ProcessContext,
        request: serde_json::Value,
    ) -> ProcessResult<serde_json::Value> {
        let request: GroupRequest = serde_json::from_value(request)
            .map_err(|e| ProcessError::RequestFailed(format!("invalid group request: {}", e)))?;

        let reply = match request {
            GroupRequest::Write { variable_id, value } => {
                let result = self.run_blocking(move |s| s.write(variable_id, value)).await?;
                if let Err(e) = &result {
                    tracing::warn!(variable = variable_id, kind = ?e.kind(), error = %e, "Write failed");
                }
                GroupReply::from_result(result, |result| GroupReply::Written { result })
            }
            GroupRequest::Discover => {
                let result = self.run_blocking(|s| s.discover()).await?;
                GroupReply::from_result(result, |devices| GroupReply::Discovered { devices })
            }
            GroupRequest::State => {
                self.run_blocking(|s| GroupReply::State {
                    state: s.state(),
                    device_instance: s.device_instance(),
                })
                .await?
            }
        };
        serde_json::to_value(reply).map_err(|e| ProcessError::Internal(e.to_string()))
    }

    async fn on_stop(&mut self, ctx: &ProcessContext) -> ProcessResult<()> {
        self.shutdown.cancel();
        self.run_blocking(|s| s.stop()).await?;
        tracing::info!(group = %ctx.process_id, "Device group process finished");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Spawner
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed to turn a group spec into a running process
#[derive(Clone)]
pub struct GroupFactory {
    pub settings: SchedulerSettings,
    pub poll_interval: Duration,
    pub connector: Arc<dyn Connector>,
    pub recorder: Arc<dyn Recorder>,
    pub converter: Option<Arc<dyn ValueConverter>>,
    pub inventory: Option<InventorySink>,
}

impl GroupFactory {
    pub fn scheduler(&self, spec: &DeviceGroupSpec) -> PollScheduler {
        let mut scheduler = PollScheduler::new(
            spec.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.recorder),
        )
        .with_settings(self.settings.clone());
        if let Some(converter) = &self.converter {
            scheduler = scheduler.with_converter(Arc::clone(converter));
        }
        if let Some(inventory) = &self.inventory {
            scheduler = scheduler.with_inventory(inventory.clone());
        }
        scheduler
    }

    pub fn process(&self, spec: &DeviceGroupSpec) -> GroupProcess {
        GroupProcess::new(self.scheduler(spec), self.poll_interval)
    }
}

/// Spawns groups as processes of a shared [`ProcessManager`]
pub struct ManagedGroups {
    manager: Arc<ProcessManager>,
    factory: GroupFactory,
    shutdowns: DashMap<String, GroupShutdown>,
}

impl ManagedGroups {
    pub fn new(manager: Arc<ProcessManager>, factory: GroupFactory) -> Self {
        Self {
            manager,
            factory,
            shutdowns: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }
}

#[async_trait]
impl GroupSpawner for ManagedGroups {
    async fn spawn(&self, spec: &DeviceGroupSpec) -> DaqResult<()> {
        let process = self.factory.process(spec);
        let args = process.args();
        self.shutdowns.insert(spec.key.clone(), process.shutdown_handle());
        self.manager.spawn(process, args).await?;
        Ok(())
    }

    async fn stop(&self, key: &str) -> DaqResult<()> {
        // Abort a request in flight so the tick ends before the stop timeout
        if let Some((_, shutdown)) = self.shutdowns.remove(key) {
            shutdown.cancel();
        }
        match self.manager.stop(key).await {
            Ok(()) | Err(ProcessError::NotRunning(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_alive(&self, key: &str) -> bool {
        self.manager.is_alive(key)
    }

    fn reap(&self) -> Vec<String> {
        let exited = self.manager.reap();
        for key in &exited {
            self.shutdowns.remove(key);
        }
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaqConfig;
    use crate::recorder::MemoryRecorder;
    use crate::testing::MockNetwork;
    use crate::topology::build_groups;
    use bacnet_stack::{ObjectId, ObjectType, PropertyValue};
    use std::net::SocketAddr;

    const FLEET: &str = r#"
        [[gateways]]
        id = 1
        name = "Plant"
        address = "192.168.1.10/24"

        [[remote_devices]]
        id = 2
        gateway_id = 1
        address = "192.168.1.20"
        device_instance = 50

        [[variables]]
        id = 10
        device_id = 2
        object_type = "ao"
        instance = 1
        writeable = true

        [[variables]]
        id = 11
        device_id = 2
        object_type = "ai"
        instance = 1
    "#;

    fn factory(network: &MockNetwork, recorder: &MemoryRecorder) -> GroupFactory {
        GroupFactory {
            settings: SchedulerSettings {
                discovery_on_start: false,
                ..SchedulerSettings::default()
            },
            poll_interval: Duration::from_millis(20),
            connector: Arc::new(network.clone()),
            recorder: Arc::new(recorder.clone()),
            converter: None,
            inventory: None,
        }
    }

    fn setup() -> (MockNetwork, MemoryRecorder, DeviceGroupSpec) {
        let network = MockNetwork::new();
        let addr: SocketAddr = "192.168.1.20:47808".parse().unwrap();
        network.add_device(addr, 50);
        network.set_present_value(addr, ObjectId::new(ObjectType::AnalogInput, 1), PropertyValue::Real(4.0));
        let config = DaqConfig::from_toml_str(FLEET).unwrap();
        let spec = build_groups(&config).unwrap().remove(0);
        (network, MemoryRecorder::new(), spec)
    }

    #[test]
    fn test_request_wire_format() {
        let request: GroupRequest =
            serde_json::from_value(serde_json::json!({ "op": "write", "variable_id": 10, "value": 1.5 }))
                .unwrap();
        assert_eq!(request, GroupRequest::Write { variable_id: 10, value: 1.5 });
        assert_eq!(
            serde_json::to_value(GroupRequest::Discover).unwrap(),
            serde_json::json!({ "op": "discover" })
        );
    }

    #[test]
    fn test_process_spec_from_group() {
        let (network, recorder, spec) = setup();
        let process = factory(&network, &recorder).process(&spec);
        let process_spec = process.spec();

        assert_eq!(process_spec.id, "1-192.168.1.10:47808");
        assert_eq!(process_spec.name, "Plant");
        assert_eq!(process_spec.tick_interval, Duration::from_millis(20));
        assert_eq!(process.args()["device_ids"], serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn test_group_polls_and_routes_writes() {
        let (network, recorder, spec) = setup();
        let manager = ProcessManager::new_shared();
        let groups = ManagedGroups::new(Arc::clone(&manager), factory(&network, &recorder));

        groups.spawn(&spec).await.unwrap();
        assert!(groups.is_alive(&spec.key));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(recorder.results().iter().any(|r| r.variable_id == 11 && r.value == Some(4.0)));

        let reply = request_group(
            &manager,
            &spec.key,
            &GroupRequest::Write { variable_id: 10, value: 12.0 },
        )
        .await
        .unwrap();
        match reply {
            GroupReply::Written { result } => assert_eq!(result.value, Some(12.0)),
            other => panic!("unexpected reply: {:?}", other),
        }

        let reply = request_group(
            &manager,
            &spec.key,
            &GroupRequest::Write { variable_id: 11, value: 1.0 },
        )
        .await
        .unwrap();
        match reply {
            GroupReply::Failed { error } => assert_eq!(error.kind, "not-writeable"),
            other => panic!("unexpected reply: {:?}", other),
        }

        groups.stop(&spec.key).await.unwrap();
        assert!(!groups.is_alive(&spec.key));
        assert_eq!(network.closes(), network.connects());
    }

    #[tokio::test]
    async fn test_state_request() {
        let (network, recorder, spec) = setup();
        let manager = ProcessManager::new_shared();
        let groups = ManagedGroups::new(Arc::clone(&manager), factory(&network, &recorder));
        groups.spawn(&spec).await.unwrap();

        let reply = request_group(&manager, &spec.key, &GroupRequest::State).await.unwrap();
        match reply {
            GroupReply::State { state, device_instance } => {
                assert_eq!(state, GroupState::Polling);
                assert!((3_056_177..3_057_177).contains(&device_instance));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        manager.shutdown_all().await.unwrap();
    }
    #[tokio::test]
    async fn test_restart_with_failing_bind_keeps_group_alive() {
        let (network, recorder, spec) = setup();
        let manager = ProcessManager::new_shared();
        let groups = ManagedGroups::new(Arc::clone(&manager), factory(&network, &recorder));
        groups.spawn(&spec).await.unwrap();

        network.fail_bind(true);
        manager.get(&spec.key).unwrap().restart().await.unwrap();
        let reply = request_group(&manager, &spec.key, &GroupRequest::State).await.unwrap();
        assert!(matches!(reply, GroupReply::State { state: GroupState::Disconnected, .. }));
        assert!(groups.is_alive(&spec.key));

        network.fail_bind(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reply = request_group(&manager, &spec.key, &GroupRequest::State).await.unwrap();
        assert!(matches!(reply, GroupReply::State { state: GroupState::Polling, .. }));
        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_of_stopped_group_ends_process_and_is_reaped() {
        let (network, recorder, spec) = setup();
        let manager = ProcessManager::new_shared();
        let groups = ManagedGroups::new(Arc::clone(&manager), factory(&network, &recorder));
        groups.spawn(&spec).await.unwrap();

        groups.shutdowns.get(&spec.key).unwrap().cancel();
        manager.get(&spec.key).unwrap().restart().await.unwrap();
        for _ in 0..50 {
            if !groups.is_alive(&spec.key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!groups.is_alive(&spec.key));

        assert_eq!(groups.reap(), vec![spec.key.clone()]);
        assert!(manager.get(&spec.key).is_none());
        assert!(groups.shutdowns.is_empty());
        assert!(groups.reap().is_empty());
    }
}
