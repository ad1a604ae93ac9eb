//! Device group polling
//!
//! A [`PollScheduler`] owns one group's connection and drives it through
//! `Idle -> Connecting -> Polling -> (Disconnected -> Connecting | Stopped)`.
//! Each call to [`PollScheduler::tick`] is synchronous and blocks on the
//! group's binding; the caller decides the cadence and never overlaps ticks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use bacnet_stack::{
    CancelHandle, DiscoveryWindow, ErrorKind, PropertyAccessError, PropertyKey, PropertyValue,
    ReadAccessSpec, StackError,
};

use crate::client::{BacnetClient, Connector};
use crate::config::{DaqSettings, StackSettings, VerifyPolicy, random_device_instance};
use crate::convert::{NumericStringConverter, ValueConverter};
use crate::discovery::{self, DiscoveryOptions, RemoteDeviceSummary};
use crate::error::{DaqError, DaqResult};
use crate::inventory::InventorySink;
use crate::model::{DeviceId, MonitoredObject, PollResult, VariableId};
use crate::recorder::Recorder;
use crate::topology::DeviceGroupSpec;
use crate::write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupState {
    Idle,
    Connecting,
    Polling,
    Disconnected,
    Stopped,
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupState::Idle => write!(f, "idle"),
            GroupState::Connecting => write!(f, "connecting"),
            GroupState::Polling => write!(f, "polling"),
            GroupState::Disconnected => write!(f, "disconnected"),
            GroupState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_objects_per_request: usize,
    pub unreachable_after: u32,
    pub discovery_on_start: bool,
    pub discovery_interval_ticks: u32,
    pub discovery_window: DiscoveryWindow,
    pub verify_policy: VerifyPolicy,
}

impl SchedulerSettings {
    pub fn from_config(daq: &DaqSettings, stack: &StackSettings) -> Self {
        Self {
            max_objects_per_request: daq.max_objects_per_request,
            unreachable_after: daq.unreachable_after,
            discovery_on_start: daq.discovery_on_start,
            discovery_interval_ticks: daq.discovery_interval_ticks,
            discovery_window: stack.discovery_window(),
            verify_policy: daq.verify_policy,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&DaqSettings::default(), &StackSettings::default())
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub state: GroupState,
    pub emitted: Vec<PollResult>,
    pub reads: usize,
    pub null_reads: usize,
}

impl TickReport {
    fn idle(state: GroupState) -> Self {
        Self {
            state,
            emitted: Vec::new(),
            reads: 0,
            null_reads: 0,
        }
    }
}

/// Interrupts a group from outside its tick
///
/// Cancelling aborts the request in flight, and the scheduler stops at the
/// start of its next tick instead of reconnecting.
#[derive(Clone, Default)]
pub struct GroupShutdown {
    requested: Arc<AtomicBool>,
    handle: Arc<Mutex<Option<CancelHandle>>>,
}

impl GroupShutdown {
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().as_ref() {
            handle.cancel();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn arm(&self, handle: Option<CancelHandle>) {
        let mut slot = self.handle.lock();
        if self.is_requested() {
            if let Some(handle) = &handle {
                handle.cancel();
            }
        }
        *slot = handle;
    }
}

#[derive(Debug, Default)]
struct DeviceHealth {
    consecutive_failures: u32,
    unreachable: bool,
}

pub struct PollScheduler {
    spec: DeviceGroupSpec,
    device_instance: u32,
    settings: SchedulerSettings,
    connector: Arc<dyn Connector>,
    recorder: Arc<dyn Recorder>,
    converter: Arc<dyn ValueConverter>,
    inventory: Option<InventorySink>,
    shutdown: GroupShutdown,
    state: GroupState,
    client: Option<Box<dyn BacnetClient>>,
    last_values: HashMap<VariableId, f64>,
    health: HashMap<DeviceId, DeviceHealth>,
    ticks: u64,
    discovered: bool,
}

impl PollScheduler {
    pub fn new(spec: DeviceGroupSpec, connector: Arc<dyn Connector>, recorder: Arc<dyn Recorder>) -> Self {
        let device_instance = spec
            .gateway
            .device_instance
            .unwrap_or_else(random_device_instance);
        Self {
            spec,
            device_instance,
            settings: SchedulerSettings::default(),
            connector,
            recorder,
            converter: Arc::new(NumericStringConverter),
            inventory: None,
            shutdown: GroupShutdown::default(),
            state: GroupState::Idle,
            client: None,
            last_values: HashMap::new(),
            health: HashMap::new(),
            ticks: 0,
            discovered: false,
        }
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_inventory(mut self, inventory: InventorySink) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn spec(&self) -> &DeviceGroupSpec {
        &self.spec
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn device_instance(&self) -> u32 {
        self.device_instance
    }

    pub fn shutdown_handle(&self) -> GroupShutdown {
        self.shutdown.clone()
    }

    pub fn last_value(&self, variable_id: VariableId) -> Option<f64> {
        self.last_values.get(&variable_id).copied()
    }

    /// False once the device has failed `unreachable_after` reads in a row
    pub fn is_device_reachable(&self, device_id: DeviceId) -> bool {
        self.health.get(&device_id).is_none_or(|h| !h.unreachable)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Open the binding; on failure the group waits in `Disconnected`
    pub fn connect(&mut self) -> DaqResult<()> {
        if self.state == GroupState::Stopped {
            return Err(DaqError::Stopped(self.spec.key.clone()));
        }
        if self.shutdown.is_requested() {
            self.stop();
            return Err(DaqError::Stopped(self.spec.key.clone()));
        }
        self.close_client();
        self.state = GroupState::Connecting;

        match self.connector.connect(&self.spec.gateway, self.device_instance) {
            Ok(client) => {
                self.shutdown.arm(client.cancel_handle());
                self.client = Some(client);
                self.state = GroupState::Polling;
                tracing::info!(
                    group = %self.spec.key,
                    device_instance = self.device_instance,
                    objects = self.spec.objects.len(),
                    "Device group connected"
                );
                Ok(())
            }
            Err(e) => {
                self.state = GroupState::Disconnected;
                tracing::warn!(
                    group = %self.spec.key,
                    kind = ?e.kind(),
                    error = %e,
                    "Device group could not connect, retrying next tick"
                );
                Err(e.into())
            }
        }
    }

    /// Tear the binding down; the next tick reconnects
    pub fn disconnect(&mut self) {
        if self.state == GroupState::Stopped {
            return;
        }
        self.close_client();
        if self.state != GroupState::Disconnected {
            tracing::info!(group = %self.spec.key, "Device group disconnected");
        }
        self.state = GroupState::Disconnected;
    }

    /// Close the binding for good
    pub fn stop(&mut self) {
        if self.state == GroupState::Stopped {
            return;
        }
        self.close_client();
        self.state = GroupState::Stopped;
        tracing::info!(group = %self.spec.key, "Device group stopped");
    }

    fn close_client(&mut self) {
        self.shutdown.arm(None);
        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.close() {
                tracing::warn!(group = %self.spec.key, error = %e, "Binding did not close cleanly");
            }
        }
    }

    fn ensure_connected(&mut self) -> DaqResult<()> {
        match &self.client {
            Some(client) if client.is_alive() && self.state == GroupState::Polling => Ok(()),
            _ => self.connect(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tick
    // ─────────────────────────────────────────────────────────────────────

    /// Run one scheduling step
    pub fn tick(&mut self) -> TickReport {
        if self.shutdown.is_requested() {
            self.stop();
        }
        match self.state {
            GroupState::Stopped => return TickReport::idle(self.state),
            GroupState::Idle | GroupState::Connecting | GroupState::Disconnected => {
                if self.connect().is_err() {
                    return TickReport::idle(self.state);
                }
            }
            GroupState::Polling => {}
        }

        if !self.client.as_ref().is_some_and(|c| c.is_alive()) {
            tracing::warn!(group = %self.spec.key, "Binding stopped unexpectedly");
            self.disconnect();
            return TickReport::idle(self.state);
        }

        self.ticks += 1;
        if self.discovery_due() {
            self.discovered = true;
            if let Err(e) = self.discover() {
                tracing::warn!(group = %self.spec.key, error = %e, "Discovery failed");
            }
        }

        let report = self.poll();
        if !report.emitted.is_empty() {
            self.recorder.record(&self.spec.key, &report.emitted);
        }
        report
    }

    fn discovery_due(&self) -> bool {
        if self.spec.remote_devices.is_empty() {
            return false;
        }
        if !self.discovered {
            return self.settings.discovery_on_start;
        }
        let interval = u64::from(self.settings.discovery_interval_ticks);
        interval > 0 && self.ticks % interval == 0
    }

    /// Read every monitored object once, device by device
    fn poll(&mut self) -> TickReport {
        let Some(client) = self.client.take() else {
            return TickReport::idle(self.state);
        };

        let mut report = TickReport::idle(self.state);
        let mut cancelled = false;
        let objects = std::mem::take(&mut self.spec.objects);

        for run in objects.chunk_by(|a, b| a.device_id == b.device_id) {
            let device_id = run[0].device_id;
            let Some(peer) = self.spec.address_of(device_id) else {
                continue;
            };
            let mut responded = false;
            let mut failure = None;
            let mut attempted = 0;

            for chunk in run.chunks(self.settings.max_objects_per_request.max(1)) {
                attempted += chunk.len();
                report.reads += chunk.len();
                let specs: Vec<ReadAccessSpec> = chunk
                    .iter()
                    .map(|o| ReadAccessSpec::present_value(o.object))
                    .collect();
                match client.read_properties_multiple(peer, &specs) {
                    Ok(results) => {
                        responded = true;
                        for object in chunk {
                            let outcome = results.get(&PropertyKey::present_value(object.object));
                            match self.numeric_value(object, outcome) {
                                Some(value) => {
                                    if let Some(result) = self.observe(object, value) {
                                        report.emitted.push(result);
                                    }
                                }
                                None => report.null_reads += 1,
                            }
                        }
                    }
                    Err(e) => {
                        report.null_reads += chunk.len();
                        tracing::debug!(
                            group = %self.spec.key,
                            device = device_id,
                            kind = ?e.kind(),
                            error = %e,
                            "Batch read failed"
                        );
                        cancelled = e.kind() == ErrorKind::Cancelled;
                        let silent = e.kind() == ErrorKind::Timeout;
                        failure = Some(e);
                        if cancelled || silent {
                            break;
                        }
                    }
                }
            }

            // A device that timed out is not asked again this tick
            let skipped = run.len() - attempted;
            if skipped > 0 && !cancelled {
                report.reads += skipped;
                report.null_reads += skipped;
            }

            self.note_device(device_id, peer, responded, failure.as_ref());
            if cancelled {
                break;
            }
        }

        self.spec.objects = objects;
        self.client = Some(client);
        if cancelled {
            if self.shutdown.is_requested() {
                self.stop();
            } else {
                self.disconnect();
            }
            report.state = self.state;
        }
        report
    }

    /// Numeric view of one read outcome; `None` counts as a null read
    fn numeric_value(
        &self,
        object: &MonitoredObject,
        outcome: Option<&Result<PropertyValue, PropertyAccessError>>,
    ) -> Option<f64> {
        match outcome {
            Some(Ok(PropertyValue::CharacterString(text))) => {
                let converted = self.converter.convert(object, text);
                if converted.is_none() {
                    tracing::debug!(variable = object.variable_id, value = %text, "String value not convertible");
                }
                converted
            }
            Some(Ok(value)) => {
                let number = value.as_f64().filter(|n| n.is_finite());
                if number.is_none() {
                    tracing::debug!(variable = object.variable_id, value = %value.display(), "Value not numeric");
                }
                number
            }
            Some(Err(e)) => {
                tracing::debug!(variable = object.variable_id, error = %e, "Property read error");
                None
            }
            None => None,
        }
    }

    /// Remember `value`; returns a result when it changed materially
    fn observe(&mut self, object: &MonitoredObject, value: f64) -> Option<PollResult> {
        let previous = self.last_values.get(&object.variable_id).copied();
        if !object.is_material_change(previous, value) {
            return None;
        }
        self.last_values.insert(object.variable_id, value);
        Some(PollResult::new(object.variable_id, Some(value)))
    }

    fn note_device(&mut self, device_id: DeviceId, peer: SocketAddr, responded: bool, failure: Option<&StackError>) {
        let threshold = self.settings.unreachable_after.max(1);
        let health = self.health.entry(device_id).or_default();
        if responded {
            if health.unreachable {
                tracing::info!(group = %self.spec.key, device = device_id, %peer, "Device reachable again");
            }
            *health = DeviceHealth::default();
            return;
        }
        health.consecutive_failures += 1;
        if !health.unreachable && health.consecutive_failures >= threshold {
            health.unreachable = true;
            tracing::warn!(
                group = %self.spec.key,
                device = device_id,
                %peer,
                failures = health.consecutive_failures,
                error = ?failure.map(|e| e.to_string()),
                "Device not accessible"
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Discovery and writes
    // ─────────────────────────────────────────────────────────────────────

    /// Discover the group's remote devices and queue the results for storage
    pub fn discover(&mut self) -> DaqResult<Vec<RemoteDeviceSummary>> {
        self.ensure_connected()?;
        let client = self
            .client
            .as_deref()
            .ok_or_else(|| DaqError::Stopped(self.spec.key.clone()))?;
        let options = DiscoveryOptions {
            window: self.settings.discovery_window,
            max_objects_per_request: self.settings.max_objects_per_request,
        };
        let summaries = discovery::discover_network(client, &self.spec.remote_devices, &options)?;
        if let Some(inventory) = &self.inventory {
            inventory.record(summaries.clone());
        }
        Ok(summaries)
    }

    /// Write a variable and record the verified read-back
    pub fn write(&mut self, variable_id: VariableId, value: f64) -> DaqResult<PollResult> {
        let object = self
            .spec
            .object(variable_id)
            .ok_or(DaqError::UnknownVariable(variable_id))?;
        if !object.writeable {
            return Err(DaqError::NotWriteable { variable_id });
        }

        self.ensure_connected()?;
        let client = self
            .client
            .as_deref()
            .ok_or_else(|| DaqError::Stopped(self.spec.key.clone()))?;
        let result = write::write_variable(
            client,
            &self.spec,
            variable_id,
            value,
            self.settings.verify_policy,
            self.converter.as_ref(),
        )?;

        if let Some(value) = result.value {
            self.last_values.insert(variable_id, value);
            self.recorder.record(&self.spec.key, std::slice::from_ref(&result));
        }
        Ok(result)
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.close_client();
    }
}
