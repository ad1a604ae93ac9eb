//! Write handling with read-back verification
//!
//! A write reports the value read back from the device, never the value
//! that was requested. When the read-back fails the result is
//! [`DaqError::VerificationFailed`] even though the write itself may already
//! have taken effect on the device; callers must not treat that error as
//! "nothing changed".

use bacnet_stack::{
    Datatype, ObjectType, PropertyId, PropertyKey, PropertyRef, PropertyValue, ReadAccessSpec,
    StackError, present_value_datatype,
};

use crate::client::BacnetClient;
use crate::config::VerifyPolicy;
use crate::convert::ValueConverter;
use crate::error::{DaqError, DaqResult};
use crate::model::{MonitoredObject, PollResult, VariableId};
use crate::topology::DeviceGroupSpec;

/// Write `value` to the present-value of the variable's object and read it
/// back
pub fn write_variable(
    client: &dyn BacnetClient,
    group: &DeviceGroupSpec,
    variable_id: VariableId,
    value: f64,
    policy: VerifyPolicy,
    converter: &dyn ValueConverter,
) -> DaqResult<PollResult> {
    let object = group
        .object(variable_id)
        .ok_or(DaqError::UnknownVariable(variable_id))?;
    if !object.writeable {
        return Err(DaqError::NotWriteable { variable_id });
    }
    let peer = group.address_of(object.device_id).ok_or_else(|| {
        DaqError::config(format!("device {} has no BACnet address", object.device_id))
    })?;
    let encoded = encode_present_value(object.object.object_type, value)?;

    client.write_property(
        peer,
        object.object,
        PropertyRef::new(PropertyId::PRESENT_VALUE),
        &encoded,
        object.priority,
    )?;
    tracing::debug!(
        variable = variable_id,
        object = %object.object,
        %peer,
        value,
        priority = ?object.priority,
        "Write acknowledged, reading back"
    );

    let verification_failed = |reason: String| DaqError::VerificationFailed {
        variable_id,
        reason,
    };
    let results = client
        .read_properties_multiple(peer, &[ReadAccessSpec::present_value(object.object)])
        .map_err(|e| verification_failed(format!("read-back failed: {}", e)))?;
    let read_back = match results.get(&PropertyKey::present_value(object.object)) {
        Some(Ok(value)) => value,
        Some(Err(e)) => return Err(verification_failed(format!("read-back failed: {}", e))),
        None => {
            return Err(verification_failed(
                "read-back missing from acknowledgement".to_string(),
            ));
        }
    };

    let verified = verify_read_back(object, read_back, policy, converter).map_err(verification_failed)?;
    tracing::info!(
        variable = variable_id,
        object = %object.object,
        requested = value,
        read_back = ?verified,
        "Write verified"
    );
    Ok(PollResult::new(variable_id, verified))
}

/// Encode a numeric value with the present-value datatype of `object_type`
pub fn encode_present_value(object_type: ObjectType, value: f64) -> DaqResult<PropertyValue> {
    if !value.is_finite() {
        return Err(StackError::InvalidRequest(format!("cannot write {}", value)).into());
    }
    match present_value_datatype(object_type) {
        Some(Datatype::Real) => Ok(PropertyValue::Real(value as f32)),
        Some(Datatype::Enumerated) => Ok(PropertyValue::Enumerated(u32::from(value != 0.0))),
        Some(Datatype::Unsigned) if value >= 0.0 => Ok(PropertyValue::Unsigned(value.round() as u64)),
        _ => Err(StackError::InvalidRequest(format!(
            "cannot write {} to the present-value of {}",
            value, object_type
        ))
        .into()),
    }
}

fn verify_read_back(
    object: &MonitoredObject,
    value: &PropertyValue,
    policy: VerifyPolicy,
    converter: &dyn ValueConverter,
) -> Result<Option<f64>, String> {
    if let Some(number) = value.as_f64().filter(|n| n.is_finite()) {
        return Ok(Some(number));
    }
    let Some(text) = value.as_str() else {
        return Err(format!("read-back {} is not numeric", value.display()));
    };
    match policy {
        VerifyPolicy::Numeric => Err(format!("read-back {:?} is a string", text)),
        VerifyPolicy::ConvertStrings => converter
            .convert(object, text)
            .map(Some)
            .ok_or_else(|| format!("read-back {:?} is not numeric", text)),
        VerifyPolicy::SkipStrings => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::convert::NumericStringConverter;
    use crate::testing::MockNetwork;
    use crate::topology::build_groups;
    use crate::config::DaqConfig;
    use bacnet_stack::ObjectId;
    use std::net::SocketAddr;

    const FLEET: &str = r#"
        [[gateways]]
        id = 1
        address = "192.168.1.10/24"

        [[remote_devices]]
        id = 2
        gateway_id = 1
        address = "192.168.1.20"
        device_instance = 50

        [[variables]]
        id = 10
        device_id = 2
        object_type = "analog-output"
        instance = 1
        writeable = true
        priority = 8

        [[variables]]
        id = 11
        device_id = 2
        object_type = "analog-input"
        instance = 1
    "#;

    fn setup() -> (MockNetwork, DeviceGroupSpec, SocketAddr) {
        let config = DaqConfig::from_toml_str(FLEET).unwrap();
        let group = build_groups(&config).unwrap().remove(0);
        let network = MockNetwork::new();
        let addr: SocketAddr = "192.168.1.20:47808".parse().unwrap();
        network.add_device(addr, 50);
        (network, group, addr)
    }

    #[test]
    fn test_write_reports_read_back() {
        let (network, group, addr) = setup();
        let client = network.client();

        let result = write_variable(
            &*client,
            &group,
            10,
            21.5,
            VerifyPolicy::default(),
            &NumericStringConverter,
        )
        .unwrap();
        assert_eq!(result.variable_id, 10);
        assert_eq!(result.value, Some(21.5));

        let writes = network.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, addr);
        assert_eq!(writes[0].1, ObjectId::new(ObjectType::AnalogOutput, 1));
        assert_eq!(writes[0].2, PropertyValue::Real(21.5));
        assert_eq!(writes[0].3, Some(8));
    }

    #[test]
    fn test_not_writeable_does_no_io() {
        let (network, group, _) = setup();
        let client = network.client();

        let err = write_variable(&*client, &group, 11, 1.0, VerifyPolicy::default(), &NumericStringConverter)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotWriteable);
        assert_eq!(network.requests(), 0);
    }

    #[test]
    fn test_failed_read_back_is_verification_failure() {
        let (network, group, addr) = setup();
        network.drop_after_write(addr);
        let client = network.client();

        let err = write_variable(&*client, &group, 10, 30.0, VerifyPolicy::default(), &NumericStringConverter)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerificationFailed);
        // The write itself went out
        assert_eq!(network.writes().len(), 1);
    }

    #[test]
    fn test_unknown_variable() {
        let (network, group, _) = setup();
        let client = network.client();
        let err = write_variable(&*client, &group, 99, 1.0, VerifyPolicy::default(), &NumericStringConverter)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownVariable);
    }

    #[test]
    fn test_string_read_back_policies() {
        let object = MonitoredObject {
            variable_id: 10,
            name: String::new(),
            device_id: 2,
            object: ObjectId::new(ObjectType::AnalogValue, 1),
            writeable: true,
            priority: None,
            deadband: 0.0,
        };
        let text = PropertyValue::CharacterString("21.5".into());
        let converter = NumericStringConverter;

        assert!(verify_read_back(&object, &text, VerifyPolicy::Numeric, &converter).is_err());
        assert_eq!(
            verify_read_back(&object, &text, VerifyPolicy::ConvertStrings, &converter),
            Ok(Some(21.5))
        );
        assert_eq!(
            verify_read_back(&object, &text, VerifyPolicy::SkipStrings, &converter),
            Ok(None)
        );
        let garbage = PropertyValue::CharacterString("fault".into());
        assert!(verify_read_back(&object, &garbage, VerifyPolicy::ConvertStrings, &converter).is_err());
        assert!(
            verify_read_back(&object, &PropertyValue::Null, VerifyPolicy::SkipStrings, &converter).is_err()
        );
    }

    #[test]
    fn test_encode_present_value() {
        assert_eq!(
            encode_present_value(ObjectType::BinaryOutput, 1.0).unwrap(),
            PropertyValue::Enumerated(1)
        );
        assert_eq!(
            encode_present_value(ObjectType::MultiStateValue, 2.6).unwrap(),
            PropertyValue::Unsigned(3)
        );
        assert!(encode_present_value(ObjectType::Schedule, 1.0).is_err());
        assert!(encode_present_value(ObjectType::AnalogValue, f64::NAN).is_err());
    }
}
