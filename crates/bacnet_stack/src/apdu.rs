//! APDU envelope and the service payloads used by the polling engine

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{StackError, StackResult};
use crate::tag::{self, TagReader};
use crate::types::{ObjectId, ObjectType, PropertyId, Segmentation};
use crate::value::PropertyValue;

/// PDU type nibble values
pub mod pdu_type {
    pub const CONFIRMED_REQUEST: u8 = 0x00;
    pub const UNCONFIRMED_REQUEST: u8 = 0x10;
    pub const SIMPLE_ACK: u8 = 0x20;
    pub const COMPLEX_ACK: u8 = 0x30;
    pub const SEGMENT_ACK: u8 = 0x40;
    pub const ERROR: u8 = 0x50;
    pub const REJECT: u8 = 0x60;
    pub const ABORT: u8 = 0x70;
}

/// Confirmed service choices
pub mod confirmed_service {
    pub const SUBSCRIBE_COV: u8 = 5;
    pub const READ_PROPERTY: u8 = 12;
    pub const READ_PROPERTY_MULTIPLE: u8 = 14;
    pub const WRITE_PROPERTY: u8 = 15;
}

/// Unconfirmed service choices
pub mod unconfirmed_service {
    pub const I_AM: u8 = 0;
    pub const WHO_IS: u8 = 8;
}

/// Reject reason: unrecognized service
pub const REJECT_UNRECOGNIZED_SERVICE: u8 = 9;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded APDU
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    ConfirmedRequest {
        invoke_id: u8,
        service: u8,
        payload: Vec<u8>,
    },
    UnconfirmedRequest {
        service: u8,
        payload: Vec<u8>,
    },
    SimpleAck {
        invoke_id: u8,
        service: u8,
    },
    ComplexAck {
        invoke_id: u8,
        service: u8,
        segmented: bool,
        payload: Vec<u8>,
    },
    SegmentAck {
        invoke_id: u8,
    },
    Error {
        invoke_id: u8,
        service: u8,
        class: u32,
        code: u32,
    },
    Reject {
        invoke_id: u8,
        reason: u8,
    },
    Abort {
        invoke_id: u8,
        reason: u8,
    },
}

impl Apdu {
    /// Invoke id of a response PDU, if this is one
    pub fn response_invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::ConfirmedRequest { .. } | Apdu::UnconfirmedRequest { .. } => None,
        }
    }
}

fn byte_at(data: &[u8], idx: usize) -> StackResult<u8> {
    data.get(idx)
        .copied()
        .ok_or_else(|| StackError::decode(format!("APDU truncated at byte {}", idx)))
}

pub fn decode_apdu(data: &[u8]) -> StackResult<Apdu> {
    let first = byte_at(data, 0)?;
    let apdu = match first & 0xF0 {
        pdu_type::CONFIRMED_REQUEST => {
            let segmented = first & 0x08 != 0;
            let header = if segmented { 6 } else { 4 };
            Apdu::ConfirmedRequest {
                invoke_id: byte_at(data, 2)?,
                service: byte_at(data, header - 1)?,
                payload: data.get(header..).unwrap_or_default().to_vec(),
            }
        }
        pdu_type::UNCONFIRMED_REQUEST => Apdu::UnconfirmedRequest {
            service: byte_at(data, 1)?,
            payload: data.get(2..).unwrap_or_default().to_vec(),
        },
        pdu_type::SIMPLE_ACK => Apdu::SimpleAck {
            invoke_id: byte_at(data, 1)?,
            service: byte_at(data, 2)?,
        },
        pdu_type::COMPLEX_ACK => {
            let segmented = first & 0x08 != 0;
            let header = if segmented { 5 } else { 3 };
            Apdu::ComplexAck {
                invoke_id: byte_at(data, 1)?,
                service: byte_at(data, header - 1)?,
                segmented,
                payload: data.get(header..).unwrap_or_default().to_vec(),
            }
        }
        pdu_type::SEGMENT_ACK => Apdu::SegmentAck {
            invoke_id: byte_at(data, 1)?,
        },
        pdu_type::ERROR => {
            let invoke_id = byte_at(data, 1)?;
            let service = byte_at(data, 2)?;
            let mut reader = TagReader::new(data.get(3..).unwrap_or_default());
            // Some services wrap the error in context tag 0
            let wrapped = reader.at_opening(0);
            if wrapped {
                reader.expect_opening(0)?;
            }
            let class = reader.read_app_enumerated()?;
            let code = reader.read_app_enumerated()?;
            Apdu::Error {
                invoke_id,
                service,
                class,
                code,
            }
        }
        pdu_type::REJECT => Apdu::Reject {
            invoke_id: byte_at(data, 1)?,
            reason: byte_at(data, 2)?,
        },
        pdu_type::ABORT => Apdu::Abort {
            invoke_id: byte_at(data, 1)?,
            reason: byte_at(data, 2)?,
        },
        other => {
            return Err(StackError::decode(format!("unknown PDU type 0x{:02X}", other)));
        }
    };
    Ok(apdu)
}

/// Encode the max-APDU field of a confirmed request header
pub fn max_apdu_code(max_apdu: u16) -> u8 {
    match max_apdu {
        0..=127 => 0,
        128..=205 => 1,
        206..=479 => 2,
        480..=1023 => 3,
        1024..=1475 => 4,
        _ => 5,
    }
}

fn confirmed_header(
    buf: &mut BytesMut,
    invoke_id: u8,
    service: u8,
    max_apdu: u16,
    segmentation: Segmentation,
) {
    let sa = if segmentation.accepts_segmented_response() { 0x02 } else { 0x00 };
    buf.put_u8(pdu_type::CONFIRMED_REQUEST | sa);
    // Max segments unspecified
    buf.put_u8(max_apdu_code(max_apdu));
    buf.put_u8(invoke_id);
    buf.put_u8(service);
}

/// Transport limits advertised in confirmed requests
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_apdu: u16,
    pub segmentation: Segmentation,
}

// ─────────────────────────────────────────────────────────────────────────────
// Who-Is / I-Am
// ─────────────────────────────────────────────────────────────────────────────

/// Who-Is request with an optional instance range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WhoIs {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
}

impl WhoIs {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u8(pdu_type::UNCONFIRMED_REQUEST);
        buf.put_u8(unconfirmed_service::WHO_IS);
        // The range is only valid with both limits present
        if let (Some(low), Some(high)) = (self.low_limit, self.high_limit) {
            tag::encode_ctx_unsigned(&mut buf, 0, low as u64);
            tag::encode_ctx_unsigned(&mut buf, 1, high as u64);
        }
        buf.to_vec()
    }

    pub fn decode(payload: &[u8]) -> StackResult<Self> {
        let mut reader = TagReader::new(payload);
        let low = reader.read_optional_ctx_unsigned(0)?;
        let high = reader.read_optional_ctx_unsigned(1)?;
        Ok(WhoIs {
            low_limit: low.map(|v| v as u32),
            high_limit: high.map(|v| v as u32),
        })
    }

    /// Whether a device instance falls inside the requested range
    pub fn matches(&self, instance: u32) -> bool {
        if self.low_limit.is_some_and(|low| instance < low) {
            return false;
        }
        if self.high_limit.is_some_and(|high| instance > high) {
            return false;
        }
        true
    }
}

/// I-Am announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IAm {
    pub device: ObjectId,
    pub max_apdu: u32,
    pub segmentation: Segmentation,
    pub vendor_id: u16,
}

impl IAm {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_u8(pdu_type::UNCONFIRMED_REQUEST);
        buf.put_u8(unconfirmed_service::I_AM);
        tag::encode_app_object_id(&mut buf, self.device);
        tag::encode_app_unsigned(&mut buf, self.max_apdu as u64);
        tag::encode_app_enumerated(&mut buf, self.segmentation.code());
        tag::encode_app_unsigned(&mut buf, self.vendor_id as u64);
        buf.to_vec()
    }

    /// Decode an I-Am payload; an identifier that is not a device object is
    /// a decode error
    pub fn decode(payload: &[u8]) -> StackResult<Self> {
        let mut reader = TagReader::new(payload);
        let device = reader.read_app_object_id()?;
        if device.object_type != ObjectType::Device {
            return Err(StackError::decode(format!(
                "I-Am identifier {} is not a device object",
                device
            )));
        }
        let max_apdu = reader.read_app_unsigned()? as u32;
        let segmentation_code = reader.read_app_enumerated()?;
        let segmentation = Segmentation::from_code(segmentation_code).ok_or_else(|| {
            StackError::decode(format!("invalid segmentation code {}", segmentation_code))
        })?;
        let vendor_id = reader.read_app_unsigned()? as u16;
        Ok(IAm {
            device,
            max_apdu,
            segmentation,
            vendor_id,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ReadProperty / ReadPropertyMultiple
// ─────────────────────────────────────────────────────────────────────────────

/// One property reference inside a read access specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyRef {
    pub property: PropertyId,
    pub array_index: Option<u32>,
}

impl PropertyRef {
    pub fn new(property: PropertyId) -> Self {
        Self {
            property,
            array_index: None,
        }
    }

    pub fn indexed(property: PropertyId, index: u32) -> Self {
        Self {
            property,
            array_index: Some(index),
        }
    }
}

/// Objects and properties requested from one device in one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessSpec {
    pub object: ObjectId,
    pub properties: Vec<PropertyRef>,
}

impl ReadAccessSpec {
    pub fn new(object: ObjectId, properties: Vec<PropertyRef>) -> Self {
        Self { object, properties }
    }

    pub fn present_value(object: ObjectId) -> Self {
        Self::new(object, vec![PropertyRef::new(PropertyId::PRESENT_VALUE)])
    }
}

/// Error class/code attached to a single property in a multiple-read ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("property access error: class {class}, code {code}")]
pub struct PropertyAccessError {
    pub class: u32,
    pub code: u32,
}

/// One property entry in a ReadPropertyMultiple ACK, values still raw
#[derive(Debug, Clone, PartialEq)]
pub struct RawPropertyResult {
    pub object: ObjectId,
    pub reference: PropertyRef,
    pub outcome: Result<Vec<PropertyValue>, PropertyAccessError>,
}

pub fn encode_read_property_multiple(
    invoke_id: u8,
    limits: RequestLimits,
    specs: &[ReadAccessSpec],
) -> StackResult<Vec<u8>> {
    if specs.is_empty() {
        return Err(StackError::InvalidRequest(
            "at least one read access specification required".into(),
        ));
    }
    let mut buf = BytesMut::with_capacity(16 + specs.len() * 12);
    confirmed_header(
        &mut buf,
        invoke_id,
        confirmed_service::READ_PROPERTY_MULTIPLE,
        limits.max_apdu,
        limits.segmentation,
    );
    for spec in specs {
        if spec.properties.is_empty() {
            return Err(StackError::InvalidRequest(format!(
                "no properties requested for {}",
                spec.object
            )));
        }
        tag::encode_ctx_object_id(&mut buf, 0, spec.object);
        tag::encode_opening(&mut buf, 1);
        for reference in &spec.properties {
            tag::encode_ctx_enumerated(&mut buf, 0, reference.property.0);
            if let Some(index) = reference.array_index {
                tag::encode_ctx_unsigned(&mut buf, 1, index as u64);
            }
        }
        tag::encode_closing(&mut buf, 1);
    }
    Ok(buf.to_vec())
}

/// Decode a ReadPropertyMultiple ACK into per-property raw results
pub fn decode_read_property_multiple_ack(payload: &[u8]) -> StackResult<Vec<RawPropertyResult>> {
    let mut reader = TagReader::new(payload);
    let mut results = Vec::new();

    while !reader.is_empty() {
        let object = reader.read_ctx_object_id(0)?;
        reader.expect_opening(1)?;
        while !reader.at_closing(1) {
            let property = PropertyId(reader.read_ctx_unsigned(2)? as u32);
            let array_index = reader.read_optional_ctx_unsigned(3)?.map(|i| i as u32);
            let reference = PropertyRef {
                property,
                array_index,
            };

            let outcome = if reader.at_opening(4) {
                reader.expect_opening(4)?;
                Ok(reader.read_values_until_closing(4)?)
            } else if reader.at_opening(5) {
                reader.expect_opening(5)?;
                let class = reader.read_app_enumerated()?;
                let code = reader.read_app_enumerated()?;
                reader.expect_closing(5)?;
                Err(PropertyAccessError { class, code })
            } else {
                return Err(StackError::decode(format!(
                    "missing read result for {} {}",
                    object, property
                )));
            };

            results.push(RawPropertyResult {
                object,
                reference,
                outcome,
            });
        }
        reader.expect_closing(1)?;
    }

    Ok(results)
}

pub fn encode_read_property(
    invoke_id: u8,
    limits: RequestLimits,
    object: ObjectId,
    reference: PropertyRef,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    confirmed_header(
        &mut buf,
        invoke_id,
        confirmed_service::READ_PROPERTY,
        limits.max_apdu,
        limits.segmentation,
    );
    tag::encode_ctx_object_id(&mut buf, 0, object);
    tag::encode_ctx_enumerated(&mut buf, 1, reference.property.0);
    if let Some(index) = reference.array_index {
        tag::encode_ctx_unsigned(&mut buf, 2, index as u64);
    }
    buf.to_vec()
}

/// Decode a ReadProperty ACK into (object, reference, raw values)
pub fn decode_read_property_ack(
    payload: &[u8],
) -> StackResult<(ObjectId, PropertyRef, Vec<PropertyValue>)> {
    let mut reader = TagReader::new(payload);
    let object = reader.read_ctx_object_id(0)?;
    let property = PropertyId(reader.read_ctx_unsigned(1)? as u32);
    let array_index = reader.read_optional_ctx_unsigned(2)?.map(|i| i as u32);
    reader.expect_opening(3)?;
    let values = reader.read_values_until_closing(3)?;
    Ok((
        object,
        PropertyRef {
            property,
            array_index,
        },
        values,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// WriteProperty / SubscribeCOV
// ─────────────────────────────────────────────────────────────────────────────

pub fn encode_write_property(
    invoke_id: u8,
    limits: RequestLimits,
    object: ObjectId,
    reference: PropertyRef,
    value: &PropertyValue,
    priority: Option<u8>,
) -> StackResult<Vec<u8>> {
    if let Some(p) = priority {
        if !(1..=16).contains(&p) {
            return Err(StackError::InvalidRequest(format!("write priority {} outside 1..=16", p)));
        }
    }
    let mut buf = BytesMut::with_capacity(24);
    confirmed_header(
        &mut buf,
        invoke_id,
        confirmed_service::WRITE_PROPERTY,
        limits.max_apdu,
        limits.segmentation,
    );
    tag::encode_ctx_object_id(&mut buf, 0, object);
    tag::encode_ctx_enumerated(&mut buf, 1, reference.property.0);
    if let Some(index) = reference.array_index {
        tag::encode_ctx_unsigned(&mut buf, 2, index as u64);
    }
    tag::encode_opening(&mut buf, 3);
    tag::encode_app_value(&mut buf, value)?;
    tag::encode_closing(&mut buf, 3);
    if let Some(p) = priority {
        tag::encode_ctx_unsigned(&mut buf, 4, p as u64);
    }
    Ok(buf.to_vec())
}

/// SubscribeCOV request parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeCov {
    pub subscriber_process_id: u32,
    pub object: ObjectId,
    pub confirmed: Option<bool>,
    pub lifetime_seconds: Option<u32>,
}

impl SubscribeCov {
    pub fn encode(&self, invoke_id: u8, limits: RequestLimits) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(20);
        confirmed_header(
            &mut buf,
            invoke_id,
            confirmed_service::SUBSCRIBE_COV,
            limits.max_apdu,
            limits.segmentation,
        );
        tag::encode_ctx_unsigned(&mut buf, 0, self.subscriber_process_id as u64);
        tag::encode_ctx_object_id(&mut buf, 1, self.object);
        if let Some(confirmed) = self.confirmed {
            tag::encode_ctx_boolean(&mut buf, 2, confirmed);
        }
        if let Some(lifetime) = self.lifetime_seconds {
            tag::encode_ctx_unsigned(&mut buf, 3, lifetime as u64);
        }
        buf.to_vec()
    }
}

/// Reject PDU answering a confirmed request this stack does not serve
pub fn encode_reject(invoke_id: u8, reason: u8) -> Vec<u8> {
    vec![pdu_type::REJECT, invoke_id, reason]
}

/// Client-side Abort PDU
pub fn encode_abort(invoke_id: u8, reason: u8) -> Vec<u8> {
    vec![pdu_type::ABORT, invoke_id, reason]
}

/// Abort reason: segmentation not supported
pub const ABORT_SEGMENTATION_NOT_SUPPORTED: u8 = 4;
