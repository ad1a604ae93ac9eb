//! String-to-number conversion for string-valued reads

use crate::model::MonitoredObject;

/// Turns a string property value into a number
///
/// Used by the poll loop when a present-value arrives as a character string,
/// and by the write path when verifying a string read-back.
pub trait ValueConverter: Send + Sync {
    fn convert(&self, object: &MonitoredObject, raw: &str) -> Option<f64>;
}

/// Parses decimal numbers and the usual two-state words
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericStringConverter;

impl ValueConverter for NumericStringConverter {
    fn convert(&self, _object: &MonitoredObject, raw: &str) -> Option<f64> {
        let trimmed = raw.trim();
        if let Ok(value) = trimmed.parse::<f64>() {
            return value.is_finite().then_some(value);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "active" | "on" | "true" | "yes" => Some(1.0),
            "inactive" | "off" | "false" | "no" => Some(0.0),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bacnet_stack::{ObjectId, ObjectType};

    fn object() -> MonitoredObject {
        MonitoredObject {
            variable_id: 1,
            name: "mode".into(),
            device_id: 2,
            object: ObjectId::new(ObjectType::AnalogValue, 3),
            writeable: true,
            priority: None,
            deadband: 0.0,
        }
    }

    #[test]
    fn test_numeric_strings() {
        let converter = NumericStringConverter;
        assert_eq!(converter.convert(&object(), " 21.5 "), Some(21.5));
        assert_eq!(converter.convert(&object(), "-3"), Some(-3.0));
        assert_eq!(converter.convert(&object(), "NaN"), None);
    }

    #[test]
    fn test_state_words() {
        let converter = NumericStringConverter;
        assert_eq!(converter.convert(&object(), "Active"), Some(1.0));
        assert_eq!(converter.convert(&object(), "off"), Some(0.0));
        assert_eq!(converter.convert(&object(), "fault"), None);
    }
}
