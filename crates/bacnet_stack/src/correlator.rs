//! Request/response correlation over one binding
//!
//! Only one transaction is in flight per binding. Callers block until the
//! matching confirmation, a protocol-level error, a timeout, or shutdown.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::apdu::{
    self, Apdu, IAm, PropertyAccessError, PropertyRef, ReadAccessSpec, SubscribeCov, WhoIs,
};
use crate::binding::Shared;
use crate::error::{StackError, StackResult};
use crate::frame::{self, BvlcFunction};
use crate::types::{datatype_of, ObjectId, PropertyId, Segmentation};
use crate::value::{cast_value, PropertyValue};

/// Kind of the outstanding request; responses are matched against it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    WhoIs,
    ReadProperty,
    ReadPropertyMultiple,
    WriteProperty,
    SubscribeCov,
}

/// A device that answered Who-Is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IAmResponse {
    pub device_instance: u32,
    pub address: SocketAddr,
    pub max_apdu: u32,
    pub segmentation: Segmentation,
    pub vendor_id: u16,
}

/// How long discovery keeps listening
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryWindow {
    /// Stop once nothing new has arrived for this long
    pub quiet: Duration,
    /// Hard upper bound on the whole collection
    pub max: Duration,
}

impl Default for DiscoveryWindow {
    fn default() -> Self {
        Self {
            quiet: Duration::from_secs(2),
            max: Duration::from_secs(10),
        }
    }
}

/// Key of one property result in a batched read
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyKey {
    pub object: ObjectId,
    pub property: PropertyId,
    pub array_index: Option<u32>,
}

impl PropertyKey {
    pub fn present_value(object: ObjectId) -> Self {
        Self {
            object,
            property: PropertyId::PRESENT_VALUE,
            array_index: None,
        }
    }
}

/// Per-property outcomes of a ReadPropertyMultiple
pub type ReadResults = BTreeMap<PropertyKey, Result<PropertyValue, PropertyAccessError>>;

// ─────────────────────────────────────────────────────────────────────────────
// Pending slot
// ─────────────────────────────────────────────────────────────────────────────

/// The single outstanding request of a binding
#[derive(Debug, Default)]
pub(crate) enum PendingSlot {
    #[default]
    Idle,
    Discovery {
        filter: WhoIs,
        found: Vec<IAmResponse>,
        last_heard: Option<Instant>,
    },
    Confirmed {
        kind: RequestKind,
        invoke_id: u8,
        peer: SocketAddr,
        response: Option<Apdu>,
    },
}

impl PendingSlot {
    /// Offer an I-Am to a running discovery; returns true when it was kept
    pub(crate) fn offer_iam(&mut self, iam: &IAm, from: SocketAddr) -> bool {
        let PendingSlot::Discovery {
            filter,
            found,
            last_heard,
        } = self
        else {
            return false;
        };

        let instance = iam.device.instance;
        if !filter.matches(instance) {
            tracing::trace!(instance, "I-Am outside requested range");
            return false;
        }
        if found.iter().any(|d| d.device_instance == instance) {
            return false;
        }
        found.push(IAmResponse {
            device_instance: instance,
            address: from,
            max_apdu: iam.max_apdu,
            segmentation: iam.segmentation,
            vendor_id: iam.vendor_id,
        });
        *last_heard = Some(Instant::now());
        true
    }

    /// Offer a response PDU; returns true when it completes the pending request
    pub(crate) fn offer_response(&mut self, apdu: Apdu, from: SocketAddr) -> bool {
        let PendingSlot::Confirmed {
            invoke_id,
            peer,
            response,
            ..
        } = self
        else {
            return false;
        };

        if apdu.response_invoke_id() != Some(*invoke_id) || peer.ip() != from.ip() {
            return false;
        }
        if response.is_some() {
            return false;
        }
        *response = Some(apdu);
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Correlator
// ─────────────────────────────────────────────────────────────────────────────

/// Issues requests over a binding and waits for their confirmations
#[derive(Clone)]
pub struct Correlator {
    shared: Arc<Shared>,
}

/// Confirmation decoded from a response PDU
enum Confirmation {
    Ack,
    ReadProperty(PropertyValue),
    ReadPropertyMultiple(ReadResults),
}

impl Correlator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Whether the underlying binding is still running
    pub fn is_alive(&self) -> bool {
        self.shared.is_running()
    }

    /// Broadcast (or unicast to `target`) a Who-Is and collect the I-Am
    /// responses that fall inside the requested range
    pub fn who_is(
        &self,
        target: Option<SocketAddr>,
        request: WhoIs,
        window: DiscoveryWindow,
    ) -> StackResult<Vec<IAmResponse>> {
        let _transaction = self.shared.transaction.lock();
        if !self.shared.is_running() {
            return Err(StackError::Closed);
        }

        {
            let mut slot = self.shared.slot.lock();
            *slot = PendingSlot::Discovery {
                filter: request,
                found: Vec::new(),
                last_heard: None,
            };
        }

        let npdu = frame::encode_npdu(&request.encode(), false);
        let sent = match target {
            Some(addr) => self
                .shared
                .send_to(&frame::encode_bvlc(BvlcFunction::OriginalUnicastNpdu, &npdu), addr),
            None => self.shared.send_broadcast(&npdu),
        };
        if let Err(e) = sent {
            *self.shared.slot.lock() = PendingSlot::Idle;
            return Err(e);
        }
        tracing::debug!(?target, low = ?request.low_limit, high = ?request.high_limit, "Sent Who-Is");

        let started = Instant::now();
        let hard_deadline = started + window.max;
        let mut slot = self.shared.slot.lock();
        loop {
            if !self.shared.is_running() {
                *slot = PendingSlot::Idle;
                return Err(StackError::Cancelled);
            }

            let last = match &*slot {
                PendingSlot::Discovery { last_heard, .. } => last_heard.unwrap_or(started),
                _ => started,
            };
            let deadline = (last + window.quiet).min(hard_deadline);
            if Instant::now() >= deadline {
                break;
            }
            self.shared.signal.wait_until(&mut slot, deadline);
        }

        let mut found = match std::mem::take(&mut *slot) {
            PendingSlot::Discovery { found, .. } => found,
            _ => Vec::new(),
        };
        found.sort_by_key(|d| d.device_instance);
        tracing::debug!(count = found.len(), "Who-Is collection finished");
        Ok(found)
    }

    /// Read several properties of several objects in one transaction
    ///
    /// Property-level errors inside a successful ACK are returned per key; a
    /// value that cannot be decoded to the property's datatype is reported as
    /// [`PropertyValue::Unrepresentable`] without failing its siblings.
    pub fn read_properties_multiple(
        &self,
        peer: SocketAddr,
        specs: &[ReadAccessSpec],
    ) -> StackResult<ReadResults> {
        let limits = self.shared.limits();
        let response = self.transact(RequestKind::ReadPropertyMultiple, peer, |invoke_id| {
            apdu::encode_read_property_multiple(invoke_id, limits, specs)
        })?;
        match confirm(RequestKind::ReadPropertyMultiple, peer, response)? {
            Confirmation::ReadPropertyMultiple(results) => Ok(results),
            _ => Err(StackError::decode("ReadPropertyMultiple confirmed without results")),
        }
    }

    /// Read a single property
    pub fn read_property(
        &self,
        peer: SocketAddr,
        object: ObjectId,
        reference: PropertyRef,
    ) -> StackResult<PropertyValue> {
        let limits = self.shared.limits();
        let response = self.transact(RequestKind::ReadProperty, peer, |invoke_id| {
            Ok(apdu::encode_read_property(invoke_id, limits, object, reference))
        })?;
        match confirm(RequestKind::ReadProperty, peer, response)? {
            Confirmation::ReadProperty(value) => Ok(value),
            _ => Err(StackError::decode("ReadProperty confirmed without a value")),
        }
    }

    /// Write a property; `priority` is 1..=16 when given
    pub fn write_property(
        &self,
        peer: SocketAddr,
        object: ObjectId,
        reference: PropertyRef,
        value: &PropertyValue,
        priority: Option<u8>,
    ) -> StackResult<()> {
        let limits = self.shared.limits();
        let response = self.transact(RequestKind::WriteProperty, peer, |invoke_id| {
            apdu::encode_write_property(invoke_id, limits, object, reference, value, priority)
        })?;
        confirm(RequestKind::WriteProperty, peer, response).map(|_| ())
    }

    /// Subscribe to change-of-value notifications; the acknowledgement is
    /// only logged by callers and never retried here
    pub fn subscribe_cov(&self, peer: SocketAddr, request: SubscribeCov) -> StackResult<()> {
        let limits = self.shared.limits();
        let response = self.transact(RequestKind::SubscribeCov, peer, |invoke_id| {
            Ok(request.encode(invoke_id, limits))
        })?;
        match confirm(RequestKind::SubscribeCov, peer, response) {
            Ok(_) => {
                tracing::debug!(%peer, object = %request.object, "COV subscription acknowledged");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%peer, object = %request.object, error = %e, "COV subscription failed");
                Err(e)
            }
        }
    }

    /// Send one confirmed request and wait for the response addressed to it
    fn transact(
        &self,
        kind: RequestKind,
        peer: SocketAddr,
        encode: impl FnOnce(u8) -> StackResult<Vec<u8>>,
    ) -> StackResult<Apdu> {
        let _transaction = self.shared.transaction.lock();
        if !self.shared.is_running() {
            return Err(StackError::Closed);
        }

        let invoke_id = self.shared.next_invoke_id();
        let apdu = encode(invoke_id)?;
        let npdu = frame::encode_npdu(&apdu, true);
        let datagram = frame::encode_bvlc(BvlcFunction::OriginalUnicastNpdu, &npdu);

        {
            let mut slot = self.shared.slot.lock();
            *slot = PendingSlot::Confirmed {
                kind,
                invoke_id,
                peer,
                response: None,
            };
        }

        if let Err(e) = self.shared.send_to(&datagram, peer) {
            *self.shared.slot.lock() = PendingSlot::Idle;
            return Err(e);
        }
        tracing::trace!(%peer, invoke_id, ?kind, "Request sent");

        let timeout = self.shared.config.request_timeout;
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let PendingSlot::Confirmed { response, .. } = &mut *slot {
                if let Some(apdu) = response.take() {
                    *slot = PendingSlot::Idle;
                    return Ok(apdu);
                }
            }
            if !self.shared.is_running() {
                *slot = PendingSlot::Idle;
                return Err(StackError::Cancelled);
            }
            if Instant::now() >= deadline {
                *slot = PendingSlot::Idle;
                tracing::debug!(%peer, invoke_id, ?kind, "Request timed out");
                return Err(StackError::Timeout { peer, timeout });
            }
            self.shared.signal.wait_until(&mut slot, deadline);
        }
    }
}

/// Match a response PDU against the kind of request that produced it
fn confirm(kind: RequestKind, peer: SocketAddr, response: Apdu) -> StackResult<Confirmation> {
    match (kind, response) {
        (_, Apdu::Error { class, code, .. }) => Err(StackError::ErrorPdu { peer, class, code }),
        (_, Apdu::Reject { reason, .. }) => Err(StackError::Reject { peer, reason }),
        (_, Apdu::Abort { reason, .. }) => Err(StackError::Abort { peer, reason }),
        (RequestKind::WriteProperty | RequestKind::SubscribeCov, Apdu::SimpleAck { .. }) => {
            Ok(Confirmation::Ack)
        }
        (
            RequestKind::ReadProperty | RequestKind::ReadPropertyMultiple,
            Apdu::ComplexAck {
                segmented: true, ..
            },
        ) => Err(StackError::decode("segmented responses are not supported")),
        (RequestKind::ReadPropertyMultiple, Apdu::ComplexAck { payload, .. }) => {
            let raw = apdu::decode_read_property_multiple_ack(&payload)?;
            let mut results = ReadResults::new();
            for entry in raw {
                let key = PropertyKey {
                    object: entry.object,
                    property: entry.reference.property,
                    array_index: entry.reference.array_index,
                };
                let datatype = datatype_of(entry.object.object_type, entry.reference.property);
                let outcome = entry
                    .outcome
                    .map(|values| cast_value(values, datatype.as_ref(), entry.reference.array_index));
                results.insert(key, outcome);
            }
            Ok(Confirmation::ReadPropertyMultiple(results))
        }
        (RequestKind::ReadProperty, Apdu::ComplexAck { payload, .. }) => {
            let (object, reference, values) = apdu::decode_read_property_ack(&payload)?;
            let datatype = datatype_of(object.object_type, reference.property);
            Ok(Confirmation::ReadProperty(cast_value(
                values,
                datatype.as_ref(),
                reference.array_index,
            )))
        }
        (
            RequestKind::WhoIs
            | RequestKind::ReadProperty
            | RequestKind::ReadPropertyMultiple
            | RequestKind::WriteProperty
            | RequestKind::SubscribeCov,
            other,
        ) => Err(StackError::decode(format!(
            "unexpected {:?} in response to {:?}",
            other, kind
        ))),
    }
}

/// Cancels in-flight requests of a binding from another thread
///
/// Cancelling stops the binding's background loop; the owner still has to
/// close the binding to release the socket.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn cancel(&self) {
        self.shared.stop();
    }

    pub fn is_cancelled(&self) -> bool {
        !self.shared.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectType;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_discovery_slot_filters_and_dedups() {
        let mut slot = PendingSlot::Discovery {
            filter: WhoIs {
                low_limit: Some(10),
                high_limit: Some(60),
            },
            found: Vec::new(),
            last_heard: None,
        };
        let iam = |instance| IAm {
            device: ObjectId::device(instance),
            max_apdu: 1476,
            segmentation: Segmentation::NoSegmentation,
            vendor_id: 5,
        };

        assert!(slot.offer_iam(&iam(50), addr("192.168.1.20:47808")));
        assert!(!slot.offer_iam(&iam(50), addr("192.168.1.20:47808")));
        assert!(!slot.offer_iam(&iam(99), addr("192.168.1.21:47808")));

        match slot {
            PendingSlot::Discovery { found, last_heard, .. } => {
                assert_eq!(found.len(), 1);
                assert_eq!(found[0].device_instance, 50);
                assert!(last_heard.is_some());
            }
            other => panic!("unexpected slot {:?}", other),
        }
    }

    #[test]
    fn test_response_must_match_invoke_id_and_peer() {
        let peer = addr("192.168.1.20:47808");
        let mut slot = PendingSlot::Confirmed {
            kind: RequestKind::WriteProperty,
            invoke_id: 4,
            peer,
            response: None,
        };

        let ack = |invoke_id| Apdu::SimpleAck {
            invoke_id,
            service: apdu::confirmed_service::WRITE_PROPERTY,
        };
        assert!(!slot.offer_response(ack(5), peer));
        assert!(!slot.offer_response(ack(4), addr("192.168.1.99:47808")));
        assert!(slot.offer_response(ack(4), peer));
        assert!(!slot.offer_response(ack(4), peer));
    }

    #[test]
    fn test_idle_slot_ignores_everything() {
        let mut slot = PendingSlot::Idle;
        let iam = IAm {
            device: ObjectId::device(1),
            max_apdu: 480,
            segmentation: Segmentation::SegmentedBoth,
            vendor_id: 0,
        };
        assert!(!slot.offer_iam(&iam, addr("10.0.0.1:47808")));
        assert!(!slot.offer_response(
            Apdu::Abort {
                invoke_id: 0,
                reason: 0
            },
            addr("10.0.0.1:47808")
        ));
    }

    #[test]
    fn test_confirm_maps_protocol_errors() {
        let peer = addr("192.168.1.20:47808");
        let err = confirm(
            RequestKind::ReadPropertyMultiple,
            peer,
            Apdu::Reject {
                invoke_id: 1,
                reason: 9,
            },
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolError);

        let err = confirm(
            RequestKind::ReadProperty,
            peer,
            Apdu::SimpleAck {
                invoke_id: 1,
                service: 12,
            },
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::DecodeError);
    }

    #[test]
    fn test_confirm_rpm_casts_values() {
        use bytes::BytesMut;

        use crate::tag;

        let ai1 = ObjectId::new(ObjectType::AnalogInput, 1);
        let bi2 = ObjectId::new(ObjectType::BinaryInput, 2);
        let mut buf = BytesMut::new();
        for (object, value) in [
            (ai1, PropertyValue::Real(23.5)),
            (bi2, PropertyValue::CharacterString("open".into())),
        ] {
            tag::encode_ctx_object_id(&mut buf, 0, object);
            tag::encode_opening(&mut buf, 1);
            tag::encode_ctx_unsigned(&mut buf, 2, PropertyId::PRESENT_VALUE.0 as u64);
            tag::encode_opening(&mut buf, 4);
            tag::encode_app_value(&mut buf, &value).unwrap();
            tag::encode_closing(&mut buf, 4);
            tag::encode_closing(&mut buf, 1);
        }

        let response = Apdu::ComplexAck {
            invoke_id: 1,
            service: apdu::confirmed_service::READ_PROPERTY_MULTIPLE,
            segmented: false,
            payload: buf.to_vec(),
        };
        let Ok(Confirmation::ReadPropertyMultiple(results)) =
            confirm(RequestKind::ReadPropertyMultiple, addr("10.0.0.2:47808"), response)
        else {
            panic!("expected read results");
        };

        assert_eq!(
            results[&PropertyKey::present_value(ai1)],
            Ok(PropertyValue::Real(23.5))
        );
        // A binary point answering with a string does not spoil its sibling
        assert!(results[&PropertyKey::present_value(bi2)]
            .as_ref()
            .unwrap()
            .is_unrepresentable());
    }
}
