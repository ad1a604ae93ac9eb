//! Decoded property values

use serde::{Deserialize, Serialize};

use crate::types::{Datatype, ObjectId};

/// A decoded BACnet property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString { unused_bits: u8, bits: Vec<u8> },
    Enumerated(u32),
    Date([u8; 4]),
    Time([u8; 4]),
    ObjectId(ObjectId),
    Array(Vec<PropertyValue>),
    /// Value whose datatype this stack cannot represent; carries a short
    /// description of what was received
    Unrepresentable(String),
}

impl PropertyValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            PropertyValue::Unsigned(u) => Some(*u as f64),
            PropertyValue::Signed(i) => Some(*i as f64),
            PropertyValue::Real(r) => Some(*r as f64),
            PropertyValue::Double(d) => Some(*d),
            PropertyValue::Enumerated(e) => Some(*e as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::CharacterString(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_unrepresentable(&self) -> bool {
        matches!(self, PropertyValue::Unrepresentable(_))
    }

    /// Short human-readable rendering used in discovery summaries
    pub fn display(&self) -> String {
        match self {
            PropertyValue::Null => "null".to_string(),
            PropertyValue::Boolean(b) => b.to_string(),
            PropertyValue::Unsigned(u) => u.to_string(),
            PropertyValue::Signed(i) => i.to_string(),
            PropertyValue::Real(r) => r.to_string(),
            PropertyValue::Double(d) => d.to_string(),
            PropertyValue::CharacterString(s) => s.clone(),
            PropertyValue::Enumerated(e) => e.to_string(),
            PropertyValue::ObjectId(oid) => oid.to_string(),
            PropertyValue::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.display()).collect();
                format!("[{}]", parts.join(","))
            }
            PropertyValue::Unrepresentable(_) => "?".to_string(),
            other => format!("{:?}", other),
        }
    }

    fn matches(&self, datatype: &Datatype) -> bool {
        matches!(
            (self, datatype),
            (PropertyValue::Boolean(_), Datatype::Boolean)
                | (PropertyValue::Unsigned(_), Datatype::Unsigned)
                | (PropertyValue::Real(_), Datatype::Real)
                | (PropertyValue::CharacterString(_), Datatype::CharacterString)
                | (PropertyValue::BitString { .. }, Datatype::BitString)
                | (PropertyValue::Enumerated(_), Datatype::Enumerated)
                | (PropertyValue::ObjectId(_), Datatype::ObjectId)
        )
    }
}

/// Interpret the raw application values of one property result
///
/// `datatype` is the property's expected type. For array properties an
/// `array_index` of 0 yields the array length and any other index yields a
/// single element; without an index the whole array is returned. Anything
/// that does not match the expected shape becomes `Unrepresentable`, so one
/// odd property never fails its siblings.
pub fn cast_value(
    raw: Vec<PropertyValue>,
    datatype: Option<&Datatype>,
    array_index: Option<u32>,
) -> PropertyValue {
    let Some(datatype) = datatype else {
        return PropertyValue::Unrepresentable(format!("unknown datatype ({} raw values)", raw.len()));
    };

    match (datatype, array_index) {
        (Datatype::Array(_), Some(0)) => cast_scalar(raw, &Datatype::Unsigned),
        (Datatype::Array(element), Some(_)) => cast_scalar(raw, element),
        (Datatype::Array(element), None) => {
            let mut items = Vec::with_capacity(raw.len());
            for value in raw {
                if value.matches(element) {
                    items.push(value);
                } else {
                    return PropertyValue::Unrepresentable(format!(
                        "array element {:?} is not {:?}",
                        value, element
                    ));
                }
            }
            PropertyValue::Array(items)
        }
        (scalar, _) => cast_scalar(raw, scalar),
    }
}

fn cast_scalar(mut raw: Vec<PropertyValue>, datatype: &Datatype) -> PropertyValue {
    if raw.len() != 1 {
        return PropertyValue::Unrepresentable(format!(
            "expected one {:?} value, got {}",
            datatype,
            raw.len()
        ));
    }
    let value = raw.remove(0);
    if value.matches(datatype) {
        return value;
    }
    // Devices commonly answer with a wider numeric encoding than declared
    match (&value, datatype) {
        (PropertyValue::Double(d), Datatype::Real) => PropertyValue::Real(*d as f32),
        (PropertyValue::Unsigned(u), Datatype::Real) => PropertyValue::Real(*u as f32),
        (PropertyValue::Signed(i), Datatype::Real) => PropertyValue::Real(*i as f32),
        // A null present-value means the point is relinquished
        (PropertyValue::Null, _) => PropertyValue::Null,
        _ => PropertyValue::Unrepresentable(format!("{:?} is not {:?}", value, datatype)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectType;

    #[test]
    fn test_cast_scalar_present_value() {
        let v = cast_value(vec![PropertyValue::Real(23.5)], Some(&Datatype::Real), None);
        assert_eq!(v, PropertyValue::Real(23.5));
        assert_eq!(v.as_f64(), Some(23.5));
    }

    #[test]
    fn test_cast_mismatch_is_unrepresentable() {
        let v = cast_value(
            vec![PropertyValue::CharacterString("on".into())],
            Some(&Datatype::Enumerated),
            None,
        );
        assert!(v.is_unrepresentable());
    }

    #[test]
    fn test_cast_unknown_datatype() {
        let v = cast_value(vec![PropertyValue::Unsigned(3)], None, None);
        assert!(v.is_unrepresentable());
    }

    #[test]
    fn test_cast_array_index_zero_is_length() {
        let list = Datatype::Array(Box::new(Datatype::ObjectId));
        let v = cast_value(vec![PropertyValue::Unsigned(12)], Some(&list), Some(0));
        assert_eq!(v, PropertyValue::Unsigned(12));

        let oid = ObjectId::new(ObjectType::AnalogInput, 1);
        let v = cast_value(vec![PropertyValue::ObjectId(oid)], Some(&list), Some(3));
        assert_eq!(v, PropertyValue::ObjectId(oid));
    }

    #[test]
    fn test_cast_whole_array() {
        let list = Datatype::Array(Box::new(Datatype::ObjectId));
        let a = ObjectId::device(50);
        let b = ObjectId::new(ObjectType::AnalogInput, 1);
        let v = cast_value(
            vec![PropertyValue::ObjectId(a), PropertyValue::ObjectId(b)],
            Some(&list),
            None,
        );
        assert_eq!(v, PropertyValue::Array(vec![PropertyValue::ObjectId(a), PropertyValue::ObjectId(b)]));
    }
}
