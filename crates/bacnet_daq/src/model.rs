//! Fleet data model: gateways, remote devices, monitored objects, results

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bacnet_stack::{BbmdRegistration, BindingConfig, ObjectId, Segmentation};

use crate::config::{GatewayConfig, RemoteDeviceConfig, StackSettings, VariableConfig};
use crate::error::DaqResult;

pub type DeviceId = u32;
pub type VariableId = u32;

// ─────────────────────────────────────────────────────────────────────────────
// Local Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// A locally hosted BACnet/IP endpoint with its stack parameters resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalGateway {
    pub id: DeviceId,
    pub name: String,
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub port: u16,
    /// None until the group draws a random instance at start
    pub device_instance: Option<u32>,
    pub object_name: String,
    pub max_apdu_length: u16,
    pub segmentation: Segmentation,
    pub vendor_id: u16,
    pub request_timeout: Duration,
    pub bbmd_address: Option<SocketAddr>,
    pub bbmd_ttl: u16,
    pub listen_broadcast: bool,
    pub poll_address: Option<SocketAddr>,
}

impl LocalGateway {
    pub fn from_config(config: &GatewayConfig, stack: &StackSettings) -> DaqResult<Self> {
        let (ip, mask) = config.network()?;
        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            ip,
            mask,
            port: config.port,
            device_instance: config.device_instance,
            object_name: config
                .object_name
                .clone()
                .unwrap_or_else(|| stack.object_name.clone()),
            max_apdu_length: config.max_apdu_length.unwrap_or(stack.max_apdu_length),
            segmentation: config.segmentation.unwrap_or(stack.segmentation),
            vendor_id: config.vendor_id.unwrap_or(stack.vendor_id),
            request_timeout: Duration::from_millis(
                config.request_timeout_ms.unwrap_or(stack.request_timeout_ms),
            ),
            bbmd_address: config.bbmd_address,
            bbmd_ttl: config.bbmd_ttl,
            listen_broadcast: config.listen_broadcast,
            poll_address: config.poll_address,
        })
    }

    /// Identity of the group this gateway anchors: `"<id>-<ip>:<port>"`
    pub fn group_key(&self) -> String {
        format!("{}-{}:{}", self.id, self.ip, self.port)
    }

    pub fn binding_config(&self, device_instance: u32) -> BindingConfig {
        let mut config = BindingConfig::new(self.ip, self.mask, self.port, device_instance);
        config.object_name = self.object_name.clone();
        config.max_apdu_length = self.max_apdu_length;
        config.segmentation = self.segmentation;
        config.vendor_id = self.vendor_id;
        config.request_timeout = self.request_timeout;
        config.listen_broadcast = self.listen_broadcast;
        config.bbmd = self.bbmd_address.map(|address| BbmdRegistration {
            address,
            ttl: self.bbmd_ttl,
        });
        config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote Device
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    pub id: DeviceId,
    pub name: String,
    pub gateway_id: DeviceId,
    pub address: SocketAddr,
    pub device_instance: u32,
}

impl RemoteDevice {
    pub fn from_config(config: &RemoteDeviceConfig) -> DaqResult<Self> {
        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            gateway_id: config.gateway_id,
            address: config.socket_addr()?,
            device_instance: config.device_instance,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitored Object
// ─────────────────────────────────────────────────────────────────────────────

/// One BACnet object bound to one tracked variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredObject {
    pub variable_id: VariableId,
    pub name: String,
    pub device_id: DeviceId,
    pub object: ObjectId,
    pub writeable: bool,
    pub priority: Option<u8>,
    pub deadband: f64,
}

impl From<&VariableConfig> for MonitoredObject {
    fn from(config: &VariableConfig) -> Self {
        Self {
            variable_id: config.id,
            name: config.name.clone(),
            device_id: config.device_id,
            object: ObjectId::new(config.object_type, config.instance),
            writeable: config.writeable,
            priority: config.priority,
            deadband: config.deadband,
        }
    }
}

impl MonitoredObject {
    /// Whether `value` differs enough from `previous` to be recorded
    pub fn is_material_change(&self, previous: Option<f64>, value: f64) -> bool {
        match previous {
            None => true,
            Some(previous) if self.deadband > 0.0 => (value - previous).abs() > self.deadband,
            Some(previous) => value != previous,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Poll Result
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of reading one variable; `None` means the read failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResult {
    pub variable_id: VariableId,
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PollResult {
    pub fn new(variable_id: VariableId, value: Option<f64>) -> Self {
        Self {
            variable_id,
            value,
            timestamp: Utc::now(),
        }
    }
}
