//! BACnet identifiers and enumerations used by the polling engine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Largest object instance number that fits in an object identifier
pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

/// Default BACnet/IP UDP port (0xBAC0)
pub const DEFAULT_PORT: u16 = 47808;

// ─────────────────────────────────────────────────────────────────────────────
// Object Type
// ─────────────────────────────────────────────────────────────────────────────

/// BACnet object type
///
/// Named variants cover the standard types the engine knows how to poll or
/// describe. Anything else decoded from the wire is kept as `Other` so an
/// object list never loses entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Calendar,
    Command,
    Device,
    EventEnrollment,
    File,
    Group,
    Loop,
    MultiStateInput,
    MultiStateOutput,
    NotificationClass,
    Program,
    Schedule,
    Averaging,
    MultiStateValue,
    TrendLog,
    Other(u16),
}

const NAMED_TYPES: [(ObjectType, u16, &str); 21] = [
    (ObjectType::AnalogInput, 0, "analog-input"),
    (ObjectType::AnalogOutput, 1, "analog-output"),
    (ObjectType::AnalogValue, 2, "analog-value"),
    (ObjectType::BinaryInput, 3, "binary-input"),
    (ObjectType::BinaryOutput, 4, "binary-output"),
    (ObjectType::BinaryValue, 5, "binary-value"),
    (ObjectType::Calendar, 6, "calendar"),
    (ObjectType::Command, 7, "command"),
    (ObjectType::Device, 8, "device"),
    (ObjectType::EventEnrollment, 9, "event-enrollment"),
    (ObjectType::File, 10, "file"),
    (ObjectType::Group, 11, "group"),
    (ObjectType::Loop, 12, "loop"),
    (ObjectType::MultiStateInput, 13, "multi-state-input"),
    (ObjectType::MultiStateOutput, 14, "multi-state-output"),
    (ObjectType::NotificationClass, 15, "notification-class"),
    (ObjectType::Program, 16, "program"),
    (ObjectType::Schedule, 17, "schedule"),
    (ObjectType::Averaging, 18, "averaging"),
    (ObjectType::MultiStateValue, 19, "multi-state-value"),
    (ObjectType::TrendLog, 20, "trend-log"),
];

impl ObjectType {
    /// Map a wire code to an object type
    pub fn from_code(code: u16) -> Self {
        NAMED_TYPES
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(t, _, _)| *t)
            .unwrap_or(ObjectType::Other(code))
    }

    /// Wire code of this object type
    pub fn code(&self) -> u16 {
        match self {
            ObjectType::Other(code) => *code,
            named => NAMED_TYPES
                .iter()
                .find(|(t, _, _)| t == named)
                .map(|(_, c, _)| *c)
                .unwrap_or_default(),
        }
    }

    /// Whether the type is one of the standard types known to this stack
    pub fn is_recognized(&self) -> bool {
        !matches!(self, ObjectType::Other(_))
    }

    pub fn is_analog(&self) -> bool {
        matches!(
            self,
            ObjectType::AnalogInput | ObjectType::AnalogOutput | ObjectType::AnalogValue
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            ObjectType::BinaryInput | ObjectType::BinaryOutput | ObjectType::BinaryValue
        )
    }

    pub fn is_multi_state(&self) -> bool {
        matches!(
            self,
            ObjectType::MultiStateInput | ObjectType::MultiStateOutput | ObjectType::MultiStateValue
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Other(code) => write!(f, "object-type-{}", code),
            named => {
                let name = NAMED_TYPES
                    .iter()
                    .find(|(t, _, _)| t == named)
                    .map(|(_, _, n)| *n)
                    .unwrap_or("unknown");
                f.write_str(name)
            }
        }
    }
}

impl FromStr for ObjectType {
    type Err = String;

    /// Accepts kebab-case names, snake_case, run-together names and the
    /// common two/three letter abbreviations (`ai`, `bo`, `msv`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['_', ' '], "-");
        let abbreviated = match normalized.as_str() {
            "ai" => Some(ObjectType::AnalogInput),
            "ao" => Some(ObjectType::AnalogOutput),
            "av" => Some(ObjectType::AnalogValue),
            "bi" => Some(ObjectType::BinaryInput),
            "bo" => Some(ObjectType::BinaryOutput),
            "bv" => Some(ObjectType::BinaryValue),
            "msi" => Some(ObjectType::MultiStateInput),
            "mso" => Some(ObjectType::MultiStateOutput),
            "msv" => Some(ObjectType::MultiStateValue),
            _ => None,
        };
        if let Some(t) = abbreviated {
            return Ok(t);
        }

        let compact = normalized.replace('-', "");
        NAMED_TYPES
            .iter()
            .find(|(_, _, name)| *name == normalized || name.replace('-', "") == compact)
            .map(|(t, _, _)| *t)
            .ok_or_else(|| format!("unknown BACnet object type: {}", s))
    }
}

impl Serialize for ObjectType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Object Identifier
// ─────────────────────────────────────────────────────────────────────────────

/// BACnet object identifier (type + instance)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance: instance & MAX_INSTANCE,
        }
    }

    pub fn device(instance: u32) -> Self {
        Self::new(ObjectType::Device, instance)
    }

    /// Packed 32-bit wire form: 10 bits type, 22 bits instance
    pub fn to_raw(&self) -> u32 {
        ((self.object_type.code() as u32) << 22) | (self.instance & MAX_INSTANCE)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            object_type: ObjectType::from_code((raw >> 22) as u16),
            instance: raw & MAX_INSTANCE,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Property Identifier
// ─────────────────────────────────────────────────────────────────────────────

/// BACnet property identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyId(pub u32);

impl PropertyId {
    pub const APPLICATION_SOFTWARE_VERSION: PropertyId = PropertyId(12);
    pub const DESCRIPTION: PropertyId = PropertyId(28);
    pub const EVENT_STATE: PropertyId = PropertyId(36);
    pub const FIRMWARE_REVISION: PropertyId = PropertyId(44);
    pub const MAX_APDU_LENGTH_ACCEPTED: PropertyId = PropertyId(62);
    pub const MODEL_NAME: PropertyId = PropertyId(70);
    pub const NUMBER_OF_STATES: PropertyId = PropertyId(74);
    pub const OBJECT_IDENTIFIER: PropertyId = PropertyId(75);
    pub const OBJECT_LIST: PropertyId = PropertyId(76);
    pub const OBJECT_NAME: PropertyId = PropertyId(77);
    pub const OBJECT_TYPE: PropertyId = PropertyId(79);
    pub const OUT_OF_SERVICE: PropertyId = PropertyId(81);
    pub const PRESENT_VALUE: PropertyId = PropertyId(85);
    pub const PRIORITY_ARRAY: PropertyId = PropertyId(87);
    pub const PROTOCOL_VERSION: PropertyId = PropertyId(98);
    pub const RELIABILITY: PropertyId = PropertyId(103);
    pub const SEGMENTATION_SUPPORTED: PropertyId = PropertyId(107);
    pub const STATE_TEXT: PropertyId = PropertyId(110);
    pub const STATUS_FLAGS: PropertyId = PropertyId(111);
    pub const SYSTEM_STATUS: PropertyId = PropertyId(112);
    pub const UNITS: PropertyId = PropertyId(117);
    pub const VENDOR_IDENTIFIER: PropertyId = PropertyId(120);
    pub const VENDOR_NAME: PropertyId = PropertyId(121);

    fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::APPLICATION_SOFTWARE_VERSION => "application-software-version",
            Self::DESCRIPTION => "description",
            Self::EVENT_STATE => "event-state",
            Self::FIRMWARE_REVISION => "firmware-revision",
            Self::MAX_APDU_LENGTH_ACCEPTED => "max-apdu-length-accepted",
            Self::MODEL_NAME => "model-name",
            Self::NUMBER_OF_STATES => "number-of-states",
            Self::OBJECT_IDENTIFIER => "object-identifier",
            Self::OBJECT_LIST => "object-list",
            Self::OBJECT_NAME => "object-name",
            Self::OBJECT_TYPE => "object-type",
            Self::OUT_OF_SERVICE => "out-of-service",
            Self::PRESENT_VALUE => "present-value",
            Self::PRIORITY_ARRAY => "priority-array",
            Self::PROTOCOL_VERSION => "protocol-version",
            Self::RELIABILITY => "reliability",
            Self::SEGMENTATION_SUPPORTED => "segmentation-supported",
            Self::STATE_TEXT => "state-text",
            Self::STATUS_FLAGS => "status-flags",
            Self::SYSTEM_STATUS => "system-status",
            Self::UNITS => "units",
            Self::VENDOR_IDENTIFIER => "vendor-identifier",
            Self::VENDOR_NAME => "vendor-name",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "property-{}", self.0),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Segmentation
// ─────────────────────────────────────────────────────────────────────────────

/// Segmentation support advertised in I-Am
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Segmentation {
    #[default]
    SegmentedBoth,
    SegmentedTransmit,
    SegmentedReceive,
    NoSegmentation,
}

impl Segmentation {
    pub fn code(&self) -> u32 {
        match self {
            Segmentation::SegmentedBoth => 0,
            Segmentation::SegmentedTransmit => 1,
            Segmentation::SegmentedReceive => 2,
            Segmentation::NoSegmentation => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Segmentation::SegmentedBoth),
            1 => Some(Segmentation::SegmentedTransmit),
            2 => Some(Segmentation::SegmentedReceive),
            3 => Some(Segmentation::NoSegmentation),
            _ => None,
        }
    }

    /// Whether a peer with this support can receive segmented responses
    pub fn accepts_segmented_response(&self) -> bool {
        matches!(self, Segmentation::SegmentedBoth | Segmentation::SegmentedReceive)
    }
}

impl fmt::Display for Segmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Segmentation::SegmentedBoth => "segmented-both",
            Segmentation::SegmentedTransmit => "segmented-transmit",
            Segmentation::SegmentedReceive => "segmented-receive",
            Segmentation::NoSegmentation => "no-segmentation",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Datatypes
// ─────────────────────────────────────────────────────────────────────────────

/// Expected datatype of a property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datatype {
    Boolean,
    Unsigned,
    Real,
    CharacterString,
    BitString,
    Enumerated,
    ObjectId,
    Array(Box<Datatype>),
}

/// Expected datatype of `property` on an object of `object_type`
///
/// Returns `None` for combinations this stack does not know; callers decode
/// those to an unrepresentable marker.
pub fn datatype_of(object_type: ObjectType, property: PropertyId) -> Option<Datatype> {
    let datatype = match property {
        PropertyId::OBJECT_IDENTIFIER => Datatype::ObjectId,
        PropertyId::OBJECT_NAME
        | PropertyId::DESCRIPTION
        | PropertyId::VENDOR_NAME
        | PropertyId::MODEL_NAME
        | PropertyId::FIRMWARE_REVISION
        | PropertyId::APPLICATION_SOFTWARE_VERSION => Datatype::CharacterString,
        PropertyId::OBJECT_TYPE
        | PropertyId::EVENT_STATE
        | PropertyId::RELIABILITY
        | PropertyId::UNITS
        | PropertyId::SYSTEM_STATUS
        | PropertyId::SEGMENTATION_SUPPORTED => Datatype::Enumerated,
        PropertyId::STATUS_FLAGS => Datatype::BitString,
        PropertyId::OUT_OF_SERVICE => Datatype::Boolean,
        PropertyId::VENDOR_IDENTIFIER
        | PropertyId::MAX_APDU_LENGTH_ACCEPTED
        | PropertyId::PROTOCOL_VERSION
        | PropertyId::NUMBER_OF_STATES => Datatype::Unsigned,
        PropertyId::OBJECT_LIST if object_type == ObjectType::Device => {
            Datatype::Array(Box::new(Datatype::ObjectId))
        }
        PropertyId::STATE_TEXT if object_type.is_multi_state() => {
            Datatype::Array(Box::new(Datatype::CharacterString))
        }
        PropertyId::PRESENT_VALUE => present_value_datatype(object_type)?,
        _ => return None,
    };
    Some(datatype)
}

/// Datatype of the present-value property for pollable object types
pub fn present_value_datatype(object_type: ObjectType) -> Option<Datatype> {
    if object_type.is_analog() || object_type == ObjectType::Averaging {
        Some(Datatype::Real)
    } else if object_type.is_binary() {
        Some(Datatype::Enumerated)
    } else if object_type.is_multi_state() {
        Some(Datatype::Unsigned)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_parse_variants() {
        assert_eq!("analog-input".parse::<ObjectType>(), Ok(ObjectType::AnalogInput));
        assert_eq!("analog_input".parse::<ObjectType>(), Ok(ObjectType::AnalogInput));
        assert_eq!("AnalogInput".parse::<ObjectType>(), Ok(ObjectType::AnalogInput));
        assert_eq!("msv".parse::<ObjectType>(), Ok(ObjectType::MultiStateValue));
        assert!("thermostat".parse::<ObjectType>().is_err());
    }

    #[test]
    fn test_object_id_raw_packing() {
        let oid = ObjectId::new(ObjectType::AnalogInput, 1);
        assert_eq!(oid.to_raw(), 0x0000_0001);

        let device = ObjectId::device(50);
        assert_eq!(device.to_raw(), (8 << 22) | 50);
        assert_eq!(ObjectId::from_raw(device.to_raw()), device);
    }

    #[test]
    fn test_unknown_type_survives_raw_packing() {
        let oid = ObjectId::from_raw((200 << 22) | 7);
        assert_eq!(oid.object_type, ObjectType::Other(200));
        assert!(!oid.object_type.is_recognized());
        assert_eq!(oid.to_string(), "object-type-200:7");
    }

    #[test]
    fn test_present_value_datatypes() {
        assert_eq!(
            datatype_of(ObjectType::AnalogValue, PropertyId::PRESENT_VALUE),
            Some(Datatype::Real)
        );
        assert_eq!(
            datatype_of(ObjectType::BinaryOutput, PropertyId::PRESENT_VALUE),
            Some(Datatype::Enumerated)
        );
        assert_eq!(datatype_of(ObjectType::Device, PropertyId::PRESENT_VALUE), None);
        assert_eq!(
            datatype_of(ObjectType::Device, PropertyId::OBJECT_LIST),
            Some(Datatype::Array(Box::new(Datatype::ObjectId)))
        );
    }
}
