//! Discovery of configured remote devices and their object inventories

use std::collections::HashSet;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bacnet_stack::{
    DiscoveryWindow, ErrorKind, ObjectId, PropertyId, PropertyKey, PropertyRef, PropertyValue,
    ReadAccessSpec, Segmentation, StackError, WhoIs,
};

use crate::client::BacnetClient;
use crate::error::DaqResult;
use crate::model::{DeviceId, RemoteDevice};

/// Width of the stored human-readable summary
pub const SUMMARY_MAX_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub object: ObjectId,
    pub name: Option<String>,
}

/// What discovery learned about one configured remote device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDeviceSummary {
    pub device_id: DeviceId,
    pub device_instance: u32,
    pub address: SocketAddr,
    pub max_apdu: u32,
    pub segmentation: Segmentation,
    pub vendor_id: u16,
    pub vendor_name: Option<String>,
    pub model_name: Option<String>,
    pub objects: Vec<ObjectSummary>,
    /// Bounded to [`SUMMARY_MAX_CHARS`]
    pub summary: String,
    pub discovered_at: DateTime<Utc>,
}

/// Device-object properties read alongside the object list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInventory {
    pub vendor_name: Option<String>,
    pub vendor_id: Option<u32>,
    pub model_name: Option<String>,
    pub objects: Vec<ObjectSummary>,
}

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions {
    pub window: DiscoveryWindow,
    pub max_objects_per_request: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            window: DiscoveryWindow::default(),
            max_objects_per_request: 16,
        }
    }
}

/// Broadcast Who-Is and inventory every configured device that answers
///
/// Responses from addresses that are not in `devices` are ignored. A device
/// whose inventory cannot be read is left out of the result, so whatever was
/// stored for it before stays in place.
pub fn discover_network(
    client: &dyn BacnetClient,
    devices: &[RemoteDevice],
    options: &DiscoveryOptions,
) -> DaqResult<Vec<RemoteDeviceSummary>> {
    let responses = client.who_is(None, WhoIs::default(), options.window)?;
    tracing::debug!(responses = responses.len(), "Who-Is collection complete");

    let mut seen = HashSet::new();
    let mut summaries = Vec::new();
    for response in responses {
        let Some(device) = devices.iter().find(|d| d.address == response.address) else {
            tracing::debug!(
                address = %response.address,
                instance = response.device_instance,
                "Ignoring I-Am from unconfigured device"
            );
            continue;
        };
        if !seen.insert(device.id) {
            continue;
        }
        if device.device_instance != response.device_instance {
            tracing::warn!(
                device = device.id,
                configured = device.device_instance,
                announced = response.device_instance,
                "Device instance differs from configuration, using announced instance"
            );
        }

        let target = RemoteDevice {
            device_instance: response.device_instance,
            ..device.clone()
        };
        match fetch_object_inventory(client, &target, options.max_objects_per_request) {
            Ok(inventory) => {
                let summary = summarize(&inventory);
                tracing::info!(
                    device = device.id,
                    address = %device.address,
                    objects = inventory.objects.len(),
                    "Discovered device inventory"
                );
                summaries.push(RemoteDeviceSummary {
                    device_id: device.id,
                    device_instance: response.device_instance,
                    address: response.address,
                    max_apdu: response.max_apdu,
                    segmentation: response.segmentation,
                    vendor_id: response.vendor_id,
                    vendor_name: inventory.vendor_name,
                    model_name: inventory.model_name,
                    objects: inventory.objects,
                    summary,
                    discovered_at: Utc::now(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    device = device.id,
                    kind = ?e.kind(),
                    error = %e,
                    "Inventory read failed, keeping previous inventory"
                );
            }
        }
    }

    for device in devices.iter().filter(|d| !seen.contains(&d.id)) {
        tracing::debug!(device = device.id, address = %device.address, "No I-Am from configured device");
    }
    Ok(summaries)
}

/// Read a device's object list, names and identity properties
pub fn fetch_object_inventory(
    client: &dyn BacnetClient,
    device: &RemoteDevice,
    max_objects_per_request: usize,
) -> DaqResult<DeviceInventory> {
    let device_object = ObjectId::device(device.device_instance);
    let identity = [
        PropertyId::OBJECT_LIST,
        PropertyId::VENDOR_NAME,
        PropertyId::VENDOR_IDENTIFIER,
        PropertyId::MODEL_NAME,
    ];
    let spec = ReadAccessSpec::new(
        device_object,
        identity.iter().map(|p| PropertyRef::new(*p)).collect(),
    );

    let mut inventory = DeviceInventory::default();
    let key = |property| PropertyKey {
        object: device_object,
        property,
        array_index: None,
    };

    let object_list = match client.read_properties_multiple(device.address, &[spec]) {
        Ok(results) => {
            let value = |property| results.get(&key(property)).and_then(|r| r.as_ref().ok());
            inventory.vendor_name = value(PropertyId::VENDOR_NAME)
                .and_then(PropertyValue::as_str)
                .map(str::to_string);
            inventory.vendor_id = value(PropertyId::VENDOR_IDENTIFIER)
                .and_then(PropertyValue::as_f64)
                .map(|v| v as u32);
            inventory.model_name = value(PropertyId::MODEL_NAME)
                .and_then(PropertyValue::as_str)
                .map(str::to_string);
            value(PropertyId::OBJECT_LIST).and_then(object_ids)
        }
        Err(e) if falls_back(&e) => {
            tracing::debug!(device = device.id, error = %e, "ReadPropertyMultiple refused, reading properties singly");
            let single = |property| {
                client
                    .read_property(device.address, device_object, PropertyRef::new(property))
                    .ok()
            };
            inventory.vendor_name = single(PropertyId::VENDOR_NAME)
                .and_then(|v| v.as_str().map(str::to_string));
            inventory.vendor_id = single(PropertyId::VENDOR_IDENTIFIER)
                .and_then(|v| v.as_f64())
                .map(|v| v as u32);
            inventory.model_name = single(PropertyId::MODEL_NAME)
                .and_then(|v| v.as_str().map(str::to_string));
            None
        }
        Err(e) => return Err(e.into()),
    };

    let objects = match object_list {
        Some(objects) => objects,
        None => read_object_list_by_index(client, device.address, device_object)?,
    };
    inventory.objects = read_object_names(client, device, &objects, max_objects_per_request);
    Ok(inventory)
}

/// Errors after which the device is reachable but wants single reads
fn falls_back(error: &StackError) -> bool {
    matches!(error.kind(), ErrorKind::ProtocolError | ErrorKind::DecodeError)
}

fn object_ids(value: &PropertyValue) -> Option<Vec<ObjectId>> {
    match value {
        PropertyValue::Array(items) => items
            .iter()
            .map(|item| match item {
                PropertyValue::ObjectId(oid) => Some(*oid),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

/// Read the array length at index 0, then every element
fn read_object_list_by_index(
    client: &dyn BacnetClient,
    peer: SocketAddr,
    device_object: ObjectId,
) -> DaqResult<Vec<ObjectId>> {
    let length = client.read_property(
        peer,
        device_object,
        PropertyRef::indexed(PropertyId::OBJECT_LIST, 0),
    )?;
    let length = length
        .as_f64()
        .ok_or_else(|| StackError::decode(format!("object-list length is {}", length.display())))?
        as u32;

    let mut objects = Vec::with_capacity(length as usize);
    for index in 1..=length {
        match client.read_property(
            peer,
            device_object,
            PropertyRef::indexed(PropertyId::OBJECT_LIST, index),
        )? {
            PropertyValue::ObjectId(oid) => objects.push(oid),
            other => {
                return Err(StackError::decode(format!(
                    "object-list[{}] is {}",
                    index,
                    other.display()
                ))
                .into());
            }
        }
    }
    Ok(objects)
}

/// Batch-read object names; a failed batch leaves its names empty
fn read_object_names(
    client: &dyn BacnetClient,
    device: &RemoteDevice,
    objects: &[ObjectId],
    max_objects_per_request: usize,
) -> Vec<ObjectSummary> {
    let mut summaries = Vec::with_capacity(objects.len());
    for chunk in objects.chunks(max_objects_per_request.max(1)) {
        let specs: Vec<ReadAccessSpec> = chunk
            .iter()
            .map(|oid| ReadAccessSpec::new(*oid, vec![PropertyRef::new(PropertyId::OBJECT_NAME)]))
            .collect();
        let results = match client.read_properties_multiple(device.address, &specs) {
            Ok(results) => Some(results),
            Err(e) => {
                tracing::warn!(device = device.id, error = %e, "Object name batch failed");
                None
            }
        };
        for oid in chunk {
            let name = results.as_ref().and_then(|results| {
                let key = PropertyKey {
                    object: *oid,
                    property: PropertyId::OBJECT_NAME,
                    array_index: None,
                };
                results
                    .get(&key)
                    .and_then(|r| r.as_ref().ok())
                    .and_then(|v| v.as_str().map(str::to_string))
            });
            summaries.push(ObjectSummary { object: *oid, name });
        }
    }
    summaries
}

/// Human-readable line stored with the device, cut to the storage width
pub fn summarize(inventory: &DeviceInventory) -> String {
    let mut text = String::new();
    if let Some(vendor) = &inventory.vendor_name {
        text.push_str(vendor);
    }
    if let Some(model) = &inventory.model_name {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(model);
    }
    if !text.is_empty() {
        text.push_str(": ");
    }
    let objects: Vec<String> = inventory.objects.iter().map(|o| o.object.to_string()).collect();
    text.push_str(&objects.join(", "));
    truncate_chars(&text, SUMMARY_MAX_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNetwork;
    use bacnet_stack::ObjectType;

    fn device(id: DeviceId, address: &str, instance: u32) -> RemoteDevice {
        RemoteDevice {
            id,
            name: format!("device-{}", id),
            gateway_id: 1,
            address: address.parse().unwrap(),
            device_instance: instance,
        }
    }

    fn populated_network() -> MockNetwork {
        let network = MockNetwork::new();
        let addr: SocketAddr = "192.168.1.20:47808".parse().unwrap();
        network.add_device(addr, 50);
        let ai1 = ObjectId::new(ObjectType::AnalogInput, 1);
        let bo2 = ObjectId::new(ObjectType::BinaryOutput, 2);
        network.set_object_list(addr, 50, &[ai1, bo2]);
        network.set(addr, ai1, PropertyId::OBJECT_NAME, PropertyValue::CharacterString("SAT".into()));
        network.set(addr, bo2, PropertyId::OBJECT_NAME, PropertyValue::CharacterString("Fan".into()));
        let dev = ObjectId::device(50);
        network.set(addr, dev, PropertyId::VENDOR_NAME, PropertyValue::CharacterString("Acme".into()));
        network.set(addr, dev, PropertyId::VENDOR_IDENTIFIER, PropertyValue::Unsigned(260));
        network.set(addr, dev, PropertyId::MODEL_NAME, PropertyValue::CharacterString("AHU-9".into()));
        network
    }

    #[test]
    fn test_discovers_configured_device() {
        let network = populated_network();
        let client = network.client();
        let devices = [device(2, "192.168.1.20:47808", 50)];

        let summaries = discover_network(&*client, &devices, &DiscoveryOptions::default()).unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.device_id, 2);
        assert_eq!(summary.vendor_name.as_deref(), Some("Acme"));
        assert_eq!(summary.model_name.as_deref(), Some("AHU-9"));
        assert_eq!(summary.objects.len(), 3);
        assert!(summary.objects.iter().any(|o| o.name.as_deref() == Some("Fan")));
        assert!(summary.summary.starts_with("Acme AHU-9: device:50"));
    }

    #[test]
    fn test_unconfigured_device_is_ignored() {
        let network = populated_network();
        network.add_device("192.168.1.99:47808".parse().unwrap(), 77);
        let client = network.client();
        let devices = [device(2, "192.168.1.20:47808", 50)];

        let summaries = discover_network(&*client, &devices, &DiscoveryOptions::default()).unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(summaries.iter().all(|s| s.device_instance != 77));
    }

    #[test]
    fn test_object_list_falls_back_to_indexed_reads() {
        let network = populated_network();
        let addr: SocketAddr = "192.168.1.20:47808".parse().unwrap();
        network.reject_multiple_reads(addr, true);
        let client = network.client();

        let inventory = fetch_object_inventory(&*client, &device(2, "192.168.1.20:47808", 50), 16).unwrap();
        assert_eq!(inventory.objects.len(), 3);
        assert_eq!(inventory.vendor_id, Some(260));
        assert!(inventory.objects.iter().all(|o| o.name.is_none()));
    }

    #[test]
    fn test_unreachable_device_is_left_out() {
        let network = populated_network();
        let addr: SocketAddr = "192.168.1.20:47808".parse().unwrap();
        network.drop_reads(addr, true);
        let client = network.client();
        let devices = [device(2, "192.168.1.20:47808", 50)];

        let summaries = discover_network(&*client, &devices, &DiscoveryOptions::default()).unwrap();
        assert!(summaries.is_empty());
    }

    #[test]
    fn test_summary_is_bounded() {
        let objects = (0..200)
            .map(|i| ObjectSummary {
                object: ObjectId::new(ObjectType::AnalogValue, i),
                name: None,
            })
            .collect();
        let inventory = DeviceInventory {
            vendor_name: Some("Vendör".into()),
            objects,
            ..Default::default()
        };
        let summary = summarize(&inventory);
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS);
        assert!(summary.starts_with("Vendör: analog-value:0"));
    }
}
