//! In-memory BACnet network for engine tests

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use bacnet_stack::{
    CancelHandle, DiscoveryWindow, IAmResponse, ObjectId, PropertyAccessError, PropertyId,
    PropertyKey, PropertyRef, PropertyValue, ReadAccessSpec, ReadResults, Segmentation,
    StackError, StackResult, WhoIs,
};

use crate::client::{BacnetClient, Connector};
use crate::model::LocalGateway;

#[derive(Default)]
struct MockDevice {
    instance: u32,
    properties: BTreeMap<(ObjectId, PropertyId), PropertyValue>,
    drop_reads: bool,
    reject_multiple: bool,
    /// Stop answering right after the next accepted write
    drop_after_write: bool,
}

#[derive(Default)]
struct State {
    devices: HashMap<SocketAddr, MockDevice>,
    fail_bind: bool,
    connects: usize,
    closes: usize,
    writes: Vec<(SocketAddr, ObjectId, PropertyValue, Option<u8>)>,
    requests: usize,
}

/// Shared fake network; clients opened through it see the same devices
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<State>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, addr: SocketAddr, instance: u32) {
        self.state.lock().devices.insert(
            addr,
            MockDevice {
                instance,
                ..Default::default()
            },
        );
    }

    pub fn set(&self, addr: SocketAddr, object: ObjectId, property: PropertyId, value: PropertyValue) {
        if let Some(device) = self.state.lock().devices.get_mut(&addr) {
            device.properties.insert((object, property), value);
        }
    }

    /// Object list always starts with the device object itself
    pub fn set_object_list(&self, addr: SocketAddr, instance: u32, objects: &[ObjectId]) {
        let device_object = ObjectId::device(instance);
        let mut list = vec![PropertyValue::ObjectId(device_object)];
        list.extend(objects.iter().map(|o| PropertyValue::ObjectId(*o)));
        self.set(addr, device_object, PropertyId::OBJECT_LIST, PropertyValue::Array(list));
    }

    pub fn set_present_value(&self, addr: SocketAddr, object: ObjectId, value: PropertyValue) {
        self.set(addr, object, PropertyId::PRESENT_VALUE, value);
    }

    /// Reads time out while set; the device still answers Who-Is
    pub fn drop_reads(&self, addr: SocketAddr, drop: bool) {
        if let Some(device) = self.state.lock().devices.get_mut(&addr) {
            device.drop_reads = drop;
        }
    }

    pub fn reject_multiple_reads(&self, addr: SocketAddr, reject: bool) {
        if let Some(device) = self.state.lock().devices.get_mut(&addr) {
            device.reject_multiple = reject;
        }
    }

    pub fn drop_after_write(&self, addr: SocketAddr) {
        if let Some(device) = self.state.lock().devices.get_mut(&addr) {
            device.drop_after_write = true;
        }
    }

    pub fn fail_bind(&self, fail: bool) {
        self.state.lock().fail_bind = fail;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    pub fn writes(&self) -> Vec<(SocketAddr, ObjectId, PropertyValue, Option<u8>)> {
        self.state.lock().writes.clone()
    }

    pub fn client(&self) -> Box<dyn BacnetClient> {
        Box::new(MockClient {
            state: self.state.clone(),
            open: true,
        })
    }
}

impl Connector for MockNetwork {
    fn connect(&self, gateway: &LocalGateway, _device_instance: u32) -> StackResult<Box<dyn BacnetClient>> {
        let mut state = self.state.lock();
        if state.fail_bind {
            return Err(StackError::Bind {
                addr: SocketAddr::from((gateway.ip, gateway.port)),
                source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
            });
        }
        state.connects += 1;
        drop(state);
        Ok(self.client())
    }
}

struct MockClient {
    state: Arc<Mutex<State>>,
    open: bool,
}

fn timeout(peer: SocketAddr) -> StackError {
    StackError::Timeout {
        peer,
        timeout: Duration::from_millis(10),
    }
}

fn unknown_property() -> PropertyAccessError {
    PropertyAccessError { class: 2, code: 32 }
}

fn lookup(device: &MockDevice, object: ObjectId, reference: PropertyRef) -> Result<PropertyValue, PropertyAccessError> {
    let value = device
        .properties
        .get(&(object, reference.property))
        .ok_or_else(unknown_property)?;
    match (reference.array_index, value) {
        (None, value) => Ok(value.clone()),
        (Some(0), PropertyValue::Array(items)) => Ok(PropertyValue::Unsigned(items.len() as u64)),
        (Some(i), PropertyValue::Array(items)) => items
            .get(i as usize - 1)
            .cloned()
            .ok_or(PropertyAccessError { class: 2, code: 42 }),
        (Some(_), _) => Err(PropertyAccessError { class: 2, code: 50 }),
    }
}

impl MockClient {
    fn with_device<T>(
        &self,
        peer: SocketAddr,
        f: impl FnOnce(&mut MockDevice, &mut Vec<(SocketAddr, ObjectId, PropertyValue, Option<u8>)>) -> StackResult<T>,
    ) -> StackResult<T> {
        if !self.open {
            return Err(StackError::Closed);
        }
        let mut state = self.state.lock();
        state.requests += 1;
        let State { devices, writes, .. } = &mut *state;
        match devices.get_mut(&peer) {
            Some(device) if !device.drop_reads => f(device, writes),
            _ => Err(timeout(peer)),
        }
    }
}

impl BacnetClient for MockClient {
    fn who_is(
        &self,
        _target: Option<SocketAddr>,
        request: WhoIs,
        _window: DiscoveryWindow,
    ) -> StackResult<Vec<IAmResponse>> {
        if !self.open {
            return Err(StackError::Closed);
        }
        let state = self.state.lock();
        let mut found: Vec<IAmResponse> = state
            .devices
            .iter()
            .filter(|(_, d)| request.matches(d.instance))
            .map(|(addr, d)| IAmResponse {
                device_instance: d.instance,
                address: *addr,
                max_apdu: 1476,
                segmentation: Segmentation::NoSegmentation,
                vendor_id: 260,
            })
            .collect();
        found.sort_by_key(|r| r.device_instance);
        Ok(found)
    }

    fn read_properties_multiple(
        &self,
        peer: SocketAddr,
        specs: &[ReadAccessSpec],
    ) -> StackResult<ReadResults> {
        self.with_device(peer, |device, _| {
            if device.reject_multiple {
                return Err(StackError::Reject { peer, reason: 9 });
            }
            let mut results = ReadResults::new();
            for spec in specs {
                for reference in &spec.properties {
                    let key = PropertyKey {
                        object: spec.object,
                        property: reference.property,
                        array_index: reference.array_index,
                    };
                    results.insert(key, lookup(device, spec.object, *reference));
                }
            }
            Ok(results)
        })
    }

    fn read_property(
        &self,
        peer: SocketAddr,
        object: ObjectId,
        reference: PropertyRef,
    ) -> StackResult<PropertyValue> {
        self.with_device(peer, |device, _| {
            lookup(device, object, reference).map_err(|e| StackError::ErrorPdu {
                peer,
                class: e.class,
                code: e.code,
            })
        })
    }

    fn write_property(
        &self,
        peer: SocketAddr,
        object: ObjectId,
        reference: PropertyRef,
        value: &PropertyValue,
        priority: Option<u8>,
    ) -> StackResult<()> {
        self.with_device(peer, |device, writes| {
            writes.push((peer, object, value.clone(), priority));
            device.properties.insert((object, reference.property), value.clone());
            if device.drop_after_write {
                device.drop_reads = true;
            }
            Ok(())
        })
    }

    fn is_alive(&self) -> bool {
        self.open
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        None
    }

    fn close(&mut self) -> StackResult<()> {
        if self.open {
            self.open = false;
            self.state.lock().closes += 1;
        }
        Ok(())
    }
}
