//! Layered configuration
//!
//! Values come from built-in defaults, then a TOML file, then environment
//! variables prefixed with `BACNET_DAQ_` (nested keys split on `__`, e.g.
//! `BACNET_DAQ_DAQ__POLL_INTERVAL_MS=2000`).

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use rand::Rng;
use serde::{Deserialize, Serialize};

use bacnet_stack::{DEFAULT_PORT, DiscoveryWindow, MAX_INSTANCE, ObjectType, Segmentation};

use crate::error::{DaqError, DaqResult};

/// Default configuration file looked up by the binary
pub const DEFAULT_CONFIG_FILE: &str = "bacnet-daq.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BACNET_DAQ_";

/// Base of the random local device instance used when none is configured
pub const DEFAULT_DEVICE_INSTANCE_BASE: u32 = 3_056_177;

/// Pick a local device instance in `3056177..3057177`
pub fn random_device_instance() -> u32 {
    DEFAULT_DEVICE_INSTANCE_BASE + rand::thread_rng().gen_range(0..1000)
}

// ─────────────────────────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    pub daq: DaqSettings,
    pub stack: StackSettings,
    pub gateways: Vec<GatewayConfig>,
    pub remote_devices: Vec<RemoteDeviceConfig>,
    pub variables: Vec<VariableConfig>,
}

impl DaqConfig {
    /// Load from `path` (or [`DEFAULT_CONFIG_FILE`]) plus the environment.
    /// A missing file is not an error; the fleet is then empty unless the
    /// environment fills it.
    pub fn load(path: Option<&Path>) -> DaqResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let config: DaqConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(toml: &str) -> DaqResult<Self> {
        let config: DaqConfig = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references and ranges that serde cannot express
    pub fn validate(&self) -> DaqResult<()> {
        if self.daq.poll_interval_ms == 0 {
            return Err(DaqError::config("daq.poll_interval_ms must be positive"));
        }
        if self.daq.max_objects_per_request == 0 {
            return Err(DaqError::config("daq.max_objects_per_request must be positive"));
        }

        let mut device_ids = HashSet::new();
        for gateway in &self.gateways {
            if !device_ids.insert(gateway.id) {
                return Err(DaqError::config(format!("duplicate device id {}", gateway.id)));
            }
            gateway.network()?;
            if let Some(instance) = gateway.device_instance.filter(|i| *i > MAX_INSTANCE) {
                return Err(DaqError::config(format!(
                    "gateway {}: device_instance {} out of range",
                    gateway.id, instance
                )));
            }
        }

        for device in &self.remote_devices {
            if !device_ids.insert(device.id) {
                return Err(DaqError::config(format!("duplicate device id {}", device.id)));
            }
            if !self.gateways.iter().any(|g| g.id == device.gateway_id) {
                return Err(DaqError::config(format!(
                    "remote device {} refers to unknown gateway {}",
                    device.id, device.gateway_id
                )));
            }
            device.socket_addr()?;
            if device.device_instance > MAX_INSTANCE {
                return Err(DaqError::config(format!(
                    "remote device {}: device_instance {} out of range",
                    device.id, device.device_instance
                )));
            }
        }

        let mut variable_ids = HashSet::new();
        for variable in &self.variables {
            if !variable_ids.insert(variable.id) {
                return Err(DaqError::config(format!("duplicate variable id {}", variable.id)));
            }
            if !variable.object_type.is_recognized() {
                return Err(DaqError::config(format!(
                    "variable {}: unsupported object type {}",
                    variable.id, variable.object_type
                )));
            }
            if variable.instance > MAX_INSTANCE {
                return Err(DaqError::config(format!(
                    "variable {}: instance {} out of range",
                    variable.id, variable.instance
                )));
            }
            if let Some(priority) = variable.priority.filter(|p| !(1..=16).contains(p)) {
                return Err(DaqError::config(format!(
                    "variable {}: priority {} outside 1..=16",
                    variable.id, priority
                )));
            }
            if !variable.deadband.is_finite() || variable.deadband < 0.0 {
                return Err(DaqError::config(format!(
                    "variable {}: deadband must be a non-negative number",
                    variable.id
                )));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [daq]
// ─────────────────────────────────────────────────────────────────────────────

/// How a string read-back is judged after a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyPolicy {
    /// Only a numeric read-back verifies the write
    Numeric,
    /// Run string read-backs through the value converter
    #[default]
    ConvertStrings,
    /// Accept string read-backs and report them as null
    SkipStrings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqSettings {
    pub poll_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub discovery_on_start: bool,
    /// Re-run discovery every N ticks; 0 only discovers on start
    pub discovery_interval_ticks: u32,
    pub inventory_path: PathBuf,
    pub verify_policy: VerifyPolicy,
    pub max_objects_per_request: usize,
    /// Consecutive failed reads before a device is reported unreachable
    pub unreachable_after: u32,
}

impl Default for DaqSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            reconcile_interval_ms: 30_000,
            discovery_on_start: true,
            discovery_interval_ticks: 0,
            inventory_path: PathBuf::from("bacnet-inventory.json"),
            verify_policy: VerifyPolicy::default(),
            max_objects_per_request: 16,
            unreachable_after: 3,
        }
    }
}

impl DaqSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [stack]
// ─────────────────────────────────────────────────────────────────────────────

/// Stack defaults applied to every gateway unless overridden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSettings {
    pub max_apdu_length: u16,
    pub segmentation: Segmentation,
    pub request_timeout_ms: u64,
    pub discovery_quiet_ms: u64,
    pub discovery_max_ms: u64,
    pub object_name: String,
    pub vendor_id: u16,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            max_apdu_length: 1024,
            segmentation: Segmentation::SegmentedBoth,
            request_timeout_ms: 3000,
            discovery_quiet_ms: 2000,
            discovery_max_ms: 10_000,
            object_name: "bacnet-daq".to_string(),
            vendor_id: 0,
        }
    }
}

impl StackSettings {
    pub fn discovery_window(&self) -> DiscoveryWindow {
        DiscoveryWindow {
            quiet: Duration::from_millis(self.discovery_quiet_ms),
            max: Duration::from_millis(self.discovery_max_ms),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fleet
// ─────────────────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bbmd_ttl() -> u16 {
    900
}

/// A locally hosted BACnet/IP endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    /// `192.168.1.10/24`, or a bare address combined with `mask`
    pub address: String,
    #[serde(default)]
    pub mask: Option<Ipv4Addr>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Random in `3056177..3057177` when unset
    #[serde(default)]
    pub device_instance: Option<u32>,
    #[serde(default)]
    pub bbmd_address: Option<SocketAddr>,
    #[serde(default = "default_bbmd_ttl")]
    pub bbmd_ttl: u16,
    /// Also listen on the subnet broadcast address, where many devices
    /// send their I-Am replies
    #[serde(default = "default_true")]
    pub listen_broadcast: bool,
    /// Address of the BACnet device that owns variables bound directly to
    /// this gateway
    #[serde(default)]
    pub poll_address: Option<SocketAddr>,
    #[serde(default)]
    pub max_apdu_length: Option<u16>,
    #[serde(default)]
    pub segmentation: Option<Segmentation>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub vendor_id: Option<u16>,
}

impl GatewayConfig {
    /// Local address and subnet mask
    pub fn network(&self) -> DaqResult<(Ipv4Addr, Ipv4Addr)> {
        parse_network(&self.address, self.mask)
            .map_err(|e| DaqError::config(format!("gateway {}: {}", self.id, e)))
    }
}

fn parse_network(address: &str, mask: Option<Ipv4Addr>) -> Result<(Ipv4Addr, Ipv4Addr), String> {
    match address.split_once('/') {
        Some((ip, prefix)) => {
            let ip: Ipv4Addr = ip
                .trim()
                .parse()
                .map_err(|_| format!("invalid address {:?}", address))?;
            let prefix: u32 = prefix
                .trim()
                .parse()
                .ok()
                .filter(|p| *p <= 32)
                .ok_or_else(|| format!("invalid prefix length in {:?}", address))?;
            let bits = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            Ok((ip, Ipv4Addr::from(bits)))
        }
        None => {
            let ip: Ipv4Addr = address
                .trim()
                .parse()
                .map_err(|_| format!("invalid address {:?}", address))?;
            Ok((ip, mask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0))))
        }
    }
}

/// A field device reached through a gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDeviceConfig {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub gateway_id: u32,
    /// `ip` or `ip:port`
    pub address: String,
    pub device_instance: u32,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl RemoteDeviceConfig {
    pub fn socket_addr(&self) -> DaqResult<SocketAddr> {
        let address = self.address.trim();
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(addr);
        }
        address
            .parse::<Ipv4Addr>()
            .map(|ip| SocketAddr::from((ip, DEFAULT_PORT)))
            .map_err(|_| {
                DaqError::config(format!(
                    "remote device {}: invalid address {:?}",
                    self.id, self.address
                ))
            })
    }
}

/// A tracked value bound to one BACnet object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub device_id: u32,
    pub object_type: ObjectType,
    pub instance: u32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub writeable: bool,
    #[serde(default)]
    pub priority: Option<u8>,
    /// Absolute change needed before a new value is recorded
    #[serde(default)]
    pub deadband: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLEET: &str = r#"
        [daq]
        poll_interval_ms = 1000

        [[gateways]]
        id = 1
        name = "Plant gateway"
        address = "192.168.1.10/24"

        [[remote_devices]]
        id = 2
        name = "AHU-1"
        gateway_id = 1
        address = "192.168.1.20"
        device_instance = 50

        [[variables]]
        id = 10
        name = "Supply air temperature"
        device_id = 2
        object_type = "analog-input"
        instance = 1
    "#;

    #[test]
    fn test_parse_fleet() {
        let config = DaqConfig::from_toml_str(FLEET).unwrap();
        assert_eq!(config.daq.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.daq.verify_policy, VerifyPolicy::ConvertStrings);
        assert_eq!(config.stack.max_apdu_length, 1024);

        let gateway = &config.gateways[0];
        assert_eq!(gateway.port, 47808);
        assert!(gateway.active);
        assert!(gateway.listen_broadcast);
        assert_eq!(
            gateway.network().unwrap(),
            (Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(255, 255, 255, 0))
        );

        let device = &config.remote_devices[0];
        assert_eq!(
            device.socket_addr().unwrap(),
            "192.168.1.20:47808".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.variables[0].object_type, ObjectType::AnalogInput);
        assert!(!config.variables[0].writeable);
    }

    #[test]
    fn test_unknown_object_type_fails_load() {
        let toml = FLEET.replace("analog-input", "flux-capacitor");
        let err = DaqConfig::from_toml_str(&toml).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn test_remote_device_needs_gateway() {
        let toml = FLEET.replace("gateway_id = 1", "gateway_id = 9");
        let err = DaqConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("unknown gateway 9"));
    }

    #[test]
    fn test_priority_range_checked() {
        let toml = format!("{}\npriority = 17\n", FLEET);
        assert!(DaqConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_network_forms() {
        assert_eq!(
            parse_network("10.0.0.5/16", None).unwrap(),
            (Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(255, 255, 0, 0))
        );
        assert_eq!(
            parse_network("10.0.0.5", Some(Ipv4Addr::new(255, 0, 0, 0))).unwrap().1,
            Ipv4Addr::new(255, 0, 0, 0)
        );
        assert!(parse_network("10.0.0.5/33", None).is_err());
        assert!(parse_network("not-an-ip", None).is_err());
    }

    #[test]
    fn test_random_device_instance_range() {
        for _ in 0..50 {
            let instance = random_device_instance();
            assert!((3_056_177..3_057_177).contains(&instance));
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(FLEET.as_bytes()).unwrap();

        let config = DaqConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.gateways.len(), 1);
        assert_eq!(config.remote_devices[0].device_instance, 50);
    }

    #[test]
    fn test_missing_file_yields_empty_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaqConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert!(config.gateways.is_empty());
        assert_eq!(config.daq.max_objects_per_request, 16);
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = DaqConfig::from_toml_str(include_str!("../../../bacnet-daq.toml")).unwrap();
        let groups = crate::topology::build_groups(&config).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].objects.len(), 3);
        assert_eq!(groups[1].gateway.request_timeout, std::time::Duration::from_secs(6));
    }
}
