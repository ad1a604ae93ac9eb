//! Partitioning of the configured fleet into device groups
//!
//! Every active gateway anchors exactly one group. Remote devices join the
//! group of their gateway and never form a group of their own.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::config::DaqConfig;
use crate::error::DaqResult;
use crate::model::{DeviceId, LocalGateway, MonitoredObject, RemoteDevice, VariableId};

/// Membership of one device group
///
/// Two specs compare equal exactly when the group can keep running
/// unchanged; any difference means the group is recreated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceGroupSpec {
    pub key: String,
    pub gateway: LocalGateway,
    pub remote_devices: Vec<RemoteDevice>,
    /// Sorted by device, then object; this is the polling order
    pub objects: Vec<MonitoredObject>,
}

impl DeviceGroupSpec {
    /// Gateway id first, then the member remote devices
    pub fn device_ids(&self) -> Vec<DeviceId> {
        std::iter::once(self.gateway.id)
            .chain(self.remote_devices.iter().map(|d| d.id))
            .collect()
    }

    /// Where the objects of `device_id` are read from
    pub fn address_of(&self, device_id: DeviceId) -> Option<SocketAddr> {
        if device_id == self.gateway.id {
            return self.gateway.poll_address;
        }
        self.remote_devices
            .iter()
            .find(|d| d.id == device_id)
            .map(|d| d.address)
    }

    pub fn object(&self, variable_id: VariableId) -> Option<&MonitoredObject> {
        self.objects.iter().find(|o| o.variable_id == variable_id)
    }
}

/// Compute the groups for the active part of `config`
pub fn build_groups(config: &DaqConfig) -> DaqResult<Vec<DeviceGroupSpec>> {
    let mut gateways: Vec<_> = config.gateways.iter().filter(|g| g.active).collect();
    gateways.sort_by_key(|g| g.id);

    let mut groups = Vec::with_capacity(gateways.len());
    for gateway_config in gateways {
        let gateway = LocalGateway::from_config(gateway_config, &config.stack)?;

        let mut remote_devices = config
            .remote_devices
            .iter()
            .filter(|d| d.active && d.gateway_id == gateway.id)
            .map(RemoteDevice::from_config)
            .collect::<DaqResult<Vec<_>>>()?;
        remote_devices.sort_by_key(|d| d.id);

        let mut members: HashMap<DeviceId, bool> =
            remote_devices.iter().map(|d| (d.id, true)).collect();
        members.insert(gateway.id, gateway.poll_address.is_some());

        let mut objects = Vec::new();
        for variable in config.variables.iter().filter(|v| v.active) {
            match members.get(&variable.device_id) {
                Some(true) => objects.push(MonitoredObject::from(variable)),
                Some(false) => tracing::debug!(
                    variable = variable.id,
                    gateway = gateway.id,
                    "Gateway has no poll address, variable not polled"
                ),
                None => {}
            }
        }
        objects.sort_by(|a, b| {
            (a.device_id, a.object, a.variable_id).cmp(&(b.device_id, b.object, b.variable_id))
        });

        groups.push(DeviceGroupSpec {
            key: gateway.group_key(),
            gateway,
            remote_devices,
            objects,
        });
    }

    let orphaned = config
        .remote_devices
        .iter()
        .filter(|d| d.active && !groups.iter().any(|g| g.gateway.id == d.gateway_id));
    for device in orphaned {
        tracing::warn!(
            device = device.id,
            gateway = device.gateway_id,
            "Remote device's gateway is inactive, device not polled"
        );
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET: &str = r#"
        [[gateways]]
        id = 1
        address = "192.168.1.10/24"

        [[gateways]]
        id = 5
        address = "10.0.0.2/16"
        port = 47809

        [[gateways]]
        id = 9
        address = "10.1.0.2/16"
        active = false

        [[remote_devices]]
        id = 3
        gateway_id = 1
        address = "192.168.1.21"
        device_instance = 51

        [[remote_devices]]
        id = 2
        gateway_id = 1
        address = "192.168.1.20"
        device_instance = 50

        [[remote_devices]]
        id = 4
        gateway_id = 9
        address = "10.1.0.7"
        device_instance = 70

        [[variables]]
        id = 12
        device_id = 3
        object_type = "ai"
        instance = 2

        [[variables]]
        id = 10
        device_id = 2
        object_type = "analog-input"
        instance = 1

        [[variables]]
        id = 11
        device_id = 2
        object_type = "bv"
        instance = 1
        active = false

        [[variables]]
        id = 13
        device_id = 4
        object_type = "ai"
        instance = 1

        [[variables]]
        id = 14
        device_id = 1
        object_type = "av"
        instance = 1
    "#;

    #[test]
    fn test_each_gateway_is_a_group() {
        let config = DaqConfig::from_toml_str(FLEET).unwrap();
        let groups = build_groups(&config).unwrap();

        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, ["1-192.168.1.10:47808", "5-10.0.0.2:47809"]);
        assert_eq!(groups[0].device_ids(), vec![1, 2, 3]);
        assert_eq!(groups[1].device_ids(), vec![5]);
    }

    #[test]
    fn test_objects_are_active_members_in_stable_order() {
        let config = DaqConfig::from_toml_str(FLEET).unwrap();
        let groups = build_groups(&config).unwrap();

        let variables: Vec<VariableId> = groups[0].objects.iter().map(|o| o.variable_id).collect();
        // 11 is inactive, 13 belongs to an inactive gateway, 14 has no poll address
        assert_eq!(variables, vec![10, 12]);
        assert!(groups[1].objects.is_empty());
    }

    #[test]
    fn test_gateway_variables_need_poll_address() {
        let toml = FLEET.replacen(
            "address = \"192.168.1.10/24\"",
            "address = \"192.168.1.10/24\"\npoll_address = \"192.168.1.10:47810\"",
            1,
        );
        let config = DaqConfig::from_toml_str(&toml).unwrap();
        let groups = build_groups(&config).unwrap();

        assert_eq!(groups[0].objects[0].variable_id, 14);
        assert_eq!(
            groups[0].address_of(1),
            Some("192.168.1.10:47810".parse().unwrap())
        );
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let config = DaqConfig::from_toml_str(FLEET).unwrap();
        assert_eq!(build_groups(&config).unwrap(), build_groups(&config).unwrap());
    }
}
