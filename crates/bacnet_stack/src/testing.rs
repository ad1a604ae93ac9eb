//! Scripted loopback BACnet device for socket-level tests

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use crate::apdu::{self, Apdu, IAm, WhoIs, confirmed_service, pdu_type, unconfirmed_service};
use crate::error::StackResult;
use crate::frame::{self, BvlcFunction, Frame};
use crate::tag::{self, TagReader};
use crate::types::{ObjectId, PropertyId, Segmentation};
use crate::value::PropertyValue;

type PropertyTable = HashMap<(ObjectId, PropertyId), PropertyValue>;

/// A fake device answering Who-Is, ReadProperty, ReadPropertyMultiple,
/// WriteProperty and SubscribeCOV from an in-memory property table
pub(crate) struct FakeDevice {
    addr: SocketAddr,
    properties: Arc<Mutex<PropertyTable>>,
    silent: Arc<AtomicBool>,
    iam_broadcast: Arc<Mutex<Option<SocketAddr>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeDevice {
    pub(crate) fn start(instance: u32) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        socket.set_broadcast(true).unwrap();
        let addr = socket.local_addr().unwrap();

        let properties = Arc::new(Mutex::new(PropertyTable::new()));
        properties.lock().insert(
            (ObjectId::device(instance), PropertyId::OBJECT_IDENTIFIER),
            PropertyValue::ObjectId(ObjectId::device(instance)),
        );
        let silent = Arc::new(AtomicBool::new(false));
        let iam_broadcast = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));

        let responder = Responder {
            instance,
            socket,
            properties: properties.clone(),
            silent: silent.clone(),
            iam_broadcast: iam_broadcast.clone(),
            running: running.clone(),
        };
        let thread = std::thread::spawn(move || responder.run());

        Self {
            addr,
            properties,
            silent,
            iam_broadcast,
            running,
            thread: Some(thread),
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn set(&self, object: ObjectId, property: PropertyId, value: PropertyValue) {
        self.properties.lock().insert((object, property), value);
    }

    pub(crate) fn get(&self, object: ObjectId, property: PropertyId) -> Option<PropertyValue> {
        self.properties.lock().get(&(object, property)).cloned()
    }

    /// Drop every request without answering
    pub(crate) fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Answer Who-Is with an Original-Broadcast-NPDU I-Am sent to `target`
    pub(crate) fn answer_who_is_with_broadcast(&self, target: SocketAddr) {
        *self.iam_broadcast.lock() = Some(target);
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Responder {
    instance: u32,
    socket: UdpSocket,
    properties: Arc<Mutex<PropertyTable>>,
    silent: Arc<AtomicBool>,
    iam_broadcast: Arc<Mutex<Option<SocketAddr>>>,
    running: Arc<AtomicBool>,
}

impl Responder {
    fn run(self) {
        let mut buf = [0u8; 1500];
        while self.running.load(Ordering::SeqCst) {
            let Ok((len, src)) = self.socket.recv_from(&mut buf) else {
                continue;
            };
            if self.silent.load(Ordering::SeqCst) {
                continue;
            }
            if let Ok(Some(reply)) = self.answer(&buf[..len]) {
                let npdu = frame::encode_npdu(&reply, false);
                let is_iam = reply.get(1) == Some(&unconfirmed_service::I_AM)
                    && reply.first() == Some(&pdu_type::UNCONFIRMED_REQUEST);
                let broadcast = *self.iam_broadcast.lock();
                let (function, dest) = match broadcast {
                    Some(target) if is_iam => (BvlcFunction::OriginalBroadcastNpdu, target),
                    _ => (BvlcFunction::OriginalUnicastNpdu, src),
                };
                let _ = self.socket.send_to(&frame::encode_bvlc(function, &npdu), dest);
            }
        }
    }

    fn answer(&self, data: &[u8]) -> StackResult<Option<Vec<u8>>> {
        let Frame::Npdu { npdu, .. } = frame::decode_bvlc(data)? else {
            return Ok(None);
        };
        let npdu = frame::decode_npdu(npdu)?;
        let reply = match apdu::decode_apdu(npdu.apdu)? {
            Apdu::UnconfirmedRequest {
                service: unconfirmed_service::WHO_IS,
                payload,
            } => {
                if !WhoIs::decode(&payload)?.matches(self.instance) {
                    return Ok(None);
                }
                IAm {
                    device: ObjectId::device(self.instance),
                    max_apdu: 1476,
                    segmentation: Segmentation::NoSegmentation,
                    vendor_id: 260,
                }
                .encode()
            }
            Apdu::ConfirmedRequest {
                invoke_id,
                service,
                payload,
            } => match service {
                confirmed_service::READ_PROPERTY_MULTIPLE => self.read_multiple(invoke_id, &payload)?,
                confirmed_service::READ_PROPERTY => self.read_single(invoke_id, &payload)?,
                confirmed_service::WRITE_PROPERTY => self.write(invoke_id, &payload)?,
                confirmed_service::SUBSCRIBE_COV => {
                    vec![pdu_type::SIMPLE_ACK, invoke_id, service]
                }
                _ => apdu::encode_reject(invoke_id, apdu::REJECT_UNRECOGNIZED_SERVICE),
            },
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }

    fn lookup(&self, object: ObjectId, property: PropertyId, index: Option<u64>) -> Option<PropertyValue> {
        let value = self.properties.lock().get(&(object, property)).cloned()?;
        match (value, index) {
            (PropertyValue::Array(items), Some(0)) => Some(PropertyValue::Unsigned(items.len() as u64)),
            (PropertyValue::Array(items), Some(i)) => items.get(i as usize - 1).cloned(),
            (value, _) => Some(value),
        }
    }

    fn read_multiple(&self, invoke_id: u8, payload: &[u8]) -> StackResult<Vec<u8>> {
        let mut reader = TagReader::new(payload);
        let mut ack = BytesMut::new();
        ack.put_slice(&[pdu_type::COMPLEX_ACK, invoke_id, confirmed_service::READ_PROPERTY_MULTIPLE]);

        while !reader.is_empty() {
            let object = reader.read_ctx_object_id(0)?;
            reader.expect_opening(1)?;
            tag::encode_ctx_object_id(&mut ack, 0, object);
            tag::encode_opening(&mut ack, 1);
            while !reader.at_closing(1) {
                let property = PropertyId(reader.read_ctx_unsigned(0)? as u32);
                let index = reader.read_optional_ctx_unsigned(1)?;
                tag::encode_ctx_unsigned(&mut ack, 2, property.0 as u64);
                if let Some(i) = index {
                    tag::encode_ctx_unsigned(&mut ack, 3, i);
                }
                match self.lookup(object, property, index) {
                    Some(value) => {
                        tag::encode_opening(&mut ack, 4);
                        tag::encode_app_value(&mut ack, &value)?;
                        tag::encode_closing(&mut ack, 4);
                    }
                    None => {
                        // object / unknown-object
                        tag::encode_opening(&mut ack, 5);
                        tag::encode_app_enumerated(&mut ack, 1);
                        tag::encode_app_enumerated(&mut ack, 31);
                        tag::encode_closing(&mut ack, 5);
                    }
                }
            }
            reader.expect_closing(1)?;
            tag::encode_closing(&mut ack, 1);
        }
        Ok(ack.to_vec())
    }

    fn read_single(&self, invoke_id: u8, payload: &[u8]) -> StackResult<Vec<u8>> {
        let mut reader = TagReader::new(payload);
        let object = reader.read_ctx_object_id(0)?;
        let property = PropertyId(reader.read_ctx_unsigned(1)? as u32);
        let index = reader.read_optional_ctx_unsigned(2)?;

        let Some(value) = self.lookup(object, property, index) else {
            return Ok(vec![
                pdu_type::ERROR,
                invoke_id,
                confirmed_service::READ_PROPERTY,
                0x91,
                1,
                0x91,
                31,
            ]);
        };

        let mut ack = BytesMut::new();
        ack.put_slice(&[pdu_type::COMPLEX_ACK, invoke_id, confirmed_service::READ_PROPERTY]);
        tag::encode_ctx_object_id(&mut ack, 0, object);
        tag::encode_ctx_unsigned(&mut ack, 1, property.0 as u64);
        if let Some(i) = index {
            tag::encode_ctx_unsigned(&mut ack, 2, i);
        }
        tag::encode_opening(&mut ack, 3);
        tag::encode_app_value(&mut ack, &value)?;
        tag::encode_closing(&mut ack, 3);
        Ok(ack.to_vec())
    }

    fn write(&self, invoke_id: u8, payload: &[u8]) -> StackResult<Vec<u8>> {
        let mut reader = TagReader::new(payload);
        let object = reader.read_ctx_object_id(0)?;
        let property = PropertyId(reader.read_ctx_unsigned(1)? as u32);
        let _index = reader.read_optional_ctx_unsigned(2)?;
        reader.expect_opening(3)?;
        let mut values = reader.read_values_until_closing(3)?;
        if values.len() != 1 {
            return Ok(apdu::encode_reject(invoke_id, 0));
        }
        self.properties.lock().insert((object, property), values.remove(0));
        Ok(vec![pdu_type::SIMPLE_ACK, invoke_id, confirmed_service::WRITE_PROPERTY])
    }
}
