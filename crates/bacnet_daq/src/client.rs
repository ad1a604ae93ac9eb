//! Connection seam between the engine and the BACnet stack
//!
//! The scheduler, discovery and write paths talk to a [`BacnetClient`]; the
//! production implementation wraps a [`StackBinding`] and its correlator.

use std::net::SocketAddr;

use bacnet_stack::{
    CancelHandle, Correlator, DiscoveryWindow, IAmResponse, ObjectId, PropertyRef, PropertyValue,
    ReadAccessSpec, ReadResults, StackBinding, StackResult, WhoIs,
};

use crate::model::LocalGateway;

/// Blocking request surface of one open binding
pub trait BacnetClient: Send {
    fn who_is(
        &self,
        target: Option<SocketAddr>,
        request: WhoIs,
        window: DiscoveryWindow,
    ) -> StackResult<Vec<IAmResponse>>;

    fn read_properties_multiple(
        &self,
        peer: SocketAddr,
        specs: &[ReadAccessSpec],
    ) -> StackResult<ReadResults>;

    fn read_property(
        &self,
        peer: SocketAddr,
        object: ObjectId,
        reference: PropertyRef,
    ) -> StackResult<PropertyValue>;

    fn write_property(
        &self,
        peer: SocketAddr,
        object: ObjectId,
        reference: PropertyRef,
        value: &PropertyValue,
        priority: Option<u8>,
    ) -> StackResult<()>;

    /// False once the background loop has stopped
    fn is_alive(&self) -> bool;

    /// Handle that aborts the request in flight from another thread
    fn cancel_handle(&self) -> Option<CancelHandle>;

    fn close(&mut self) -> StackResult<()>;
}

/// Opens clients for a gateway
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        gateway: &LocalGateway,
        device_instance: u32,
    ) -> StackResult<Box<dyn BacnetClient>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Stack-backed implementation
// ─────────────────────────────────────────────────────────────────────────────

pub struct StackClient {
    binding: StackBinding,
    correlator: Correlator,
}

impl StackClient {
    pub fn new(binding: StackBinding) -> Self {
        let correlator = binding.correlator();
        Self { binding, correlator }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.binding.local_addr()
    }
}

impl BacnetClient for StackClient {
    fn who_is(
        &self,
        target: Option<SocketAddr>,
        request: WhoIs,
        window: DiscoveryWindow,
    ) -> StackResult<Vec<IAmResponse>> {
        self.correlator.who_is(target, request, window)
    }

    fn read_properties_multiple(
        &self,
        peer: SocketAddr,
        specs: &[ReadAccessSpec],
    ) -> StackResult<ReadResults> {
        self.correlator.read_properties_multiple(peer, specs)
    }

    fn read_property(
        &self,
        peer: SocketAddr,
        object: ObjectId,
        reference: PropertyRef,
    ) -> StackResult<PropertyValue> {
        self.correlator.read_property(peer, object, reference)
    }

    fn write_property(
        &self,
        peer: SocketAddr,
        object: ObjectId,
        reference: PropertyRef,
        value: &PropertyValue,
        priority: Option<u8>,
    ) -> StackResult<()> {
        self.correlator
            .write_property(peer, object, reference, value, priority)
    }

    fn is_alive(&self) -> bool {
        self.binding.is_alive()
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        Some(self.binding.cancel_handle())
    }

    fn close(&mut self) -> StackResult<()> {
        self.binding.close()
    }
}

/// Opens a real BACnet/IP binding per connection
#[derive(Debug, Clone, Copy, Default)]
pub struct StackConnector;

impl Connector for StackConnector {
    fn connect(
        &self,
        gateway: &LocalGateway,
        device_instance: u32,
    ) -> StackResult<Box<dyn BacnetClient>> {
        let binding = StackBinding::open(gateway.binding_config(device_instance))?;
        tracing::info!(
            gateway = gateway.id,
            local = %binding.local_addr(),
            device_instance,
            "Opened BACnet/IP binding"
        );
        Ok(Box::new(StackClient::new(binding)))
    }
}
