//! Application and context tag codec
//!
//! Encoders append to a `BytesMut`; decoding goes through [`TagReader`],
//! a cursor over a service payload.

use bytes::{BufMut, BytesMut};

use crate::error::{StackError, StackResult};
use crate::types::ObjectId;
use crate::value::PropertyValue;

/// Application tag numbers
pub mod app {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const UNSIGNED: u8 = 2;
    pub const SIGNED: u8 = 3;
    pub const REAL: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const OCTET_STRING: u8 = 6;
    pub const CHARACTER_STRING: u8 = 7;
    pub const BIT_STRING: u8 = 8;
    pub const ENUMERATED: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const OBJECT_ID: u8 = 12;
}

const CONTEXT_CLASS: u8 = 0x08;
const OPENING: u8 = 0x06;
const CLOSING: u8 = 0x07;
const CHARSET_UTF8: u8 = 0;

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

fn encode_tag(buf: &mut BytesMut, number: u8, context: bool, len: usize) {
    let class = if context { CONTEXT_CLASS } else { 0 };
    let lvt = if len <= 4 { len as u8 } else { 5 };
    if number <= 14 {
        buf.put_u8((number << 4) | class | lvt);
    } else {
        buf.put_u8(0xF0 | class | lvt);
        buf.put_u8(number);
    }
    if len > 4 {
        if len <= 253 {
            buf.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            buf.put_u8(254);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(255);
            buf.put_u32(len as u32);
        }
    }
}

pub fn encode_opening(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | CONTEXT_CLASS | OPENING);
}

pub fn encode_closing(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | CONTEXT_CLASS | CLOSING);
}

fn unsigned_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(7).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn signed_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    // Drop redundant sign-extension bytes
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        if (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

pub fn encode_ctx_unsigned(buf: &mut BytesMut, number: u8, value: u64) {
    let bytes = unsigned_bytes(value);
    encode_tag(buf, number, true, bytes.len());
    buf.put_slice(&bytes);
}

pub fn encode_ctx_enumerated(buf: &mut BytesMut, number: u8, value: u32) {
    encode_ctx_unsigned(buf, number, value as u64);
}

pub fn encode_ctx_boolean(buf: &mut BytesMut, number: u8, value: bool) {
    encode_tag(buf, number, true, 1);
    buf.put_u8(value as u8);
}

pub fn encode_ctx_object_id(buf: &mut BytesMut, number: u8, oid: ObjectId) {
    encode_tag(buf, number, true, 4);
    buf.put_u32(oid.to_raw());
}

pub fn encode_app_unsigned(buf: &mut BytesMut, value: u64) {
    let bytes = unsigned_bytes(value);
    encode_tag(buf, app::UNSIGNED, false, bytes.len());
    buf.put_slice(&bytes);
}

pub fn encode_app_enumerated(buf: &mut BytesMut, value: u32) {
    let bytes = unsigned_bytes(value as u64);
    encode_tag(buf, app::ENUMERATED, false, bytes.len());
    buf.put_slice(&bytes);
}

pub fn encode_app_object_id(buf: &mut BytesMut, oid: ObjectId) {
    encode_tag(buf, app::OBJECT_ID, false, 4);
    buf.put_u32(oid.to_raw());
}

/// Encode any property value with its application tag
pub fn encode_app_value(buf: &mut BytesMut, value: &PropertyValue) -> StackResult<()> {
    match value {
        PropertyValue::Null => encode_tag(buf, app::NULL, false, 0),
        // Boolean carries its value in the length field
        PropertyValue::Boolean(b) => encode_tag(buf, app::BOOLEAN, false, *b as usize),
        PropertyValue::Unsigned(u) => encode_app_unsigned(buf, *u),
        PropertyValue::Signed(i) => {
            let bytes = signed_bytes(*i);
            encode_tag(buf, app::SIGNED, false, bytes.len());
            buf.put_slice(&bytes);
        }
        PropertyValue::Real(r) => {
            encode_tag(buf, app::REAL, false, 4);
            buf.put_f32(*r);
        }
        PropertyValue::Double(d) => {
            encode_tag(buf, app::DOUBLE, false, 8);
            buf.put_f64(*d);
        }
        PropertyValue::OctetString(bytes) => {
            encode_tag(buf, app::OCTET_STRING, false, bytes.len());
            buf.put_slice(bytes);
        }
        PropertyValue::CharacterString(s) => {
            encode_tag(buf, app::CHARACTER_STRING, false, s.len() + 1);
            buf.put_u8(CHARSET_UTF8);
            buf.put_slice(s.as_bytes());
        }
        PropertyValue::BitString { unused_bits, bits } => {
            encode_tag(buf, app::BIT_STRING, false, bits.len() + 1);
            buf.put_u8(*unused_bits);
            buf.put_slice(bits);
        }
        PropertyValue::Enumerated(e) => encode_app_enumerated(buf, *e),
        PropertyValue::Date(d) => {
            encode_tag(buf, app::DATE, false, 4);
            buf.put_slice(d);
        }
        PropertyValue::Time(t) => {
            encode_tag(buf, app::TIME, false, 4);
            buf.put_slice(t);
        }
        PropertyValue::ObjectId(oid) => encode_app_object_id(buf, *oid),
        PropertyValue::Array(items) => {
            for item in items {
                encode_app_value(buf, item)?;
            }
        }
        PropertyValue::Unrepresentable(what) => {
            return Err(StackError::InvalidRequest(format!(
                "cannot encode unrepresentable value ({})",
                what
            )));
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Shape of a decoded tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Primitive value with `len` content bytes (for application booleans,
    /// `len` is the value itself and no content follows)
    Value { len: usize },
    Opening,
    Closing,
}

/// A decoded tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub context: bool,
    pub kind: TagKind,
}

impl Tag {
    pub fn is_opening(&self, number: u8) -> bool {
        self.context && self.number == number && self.kind == TagKind::Opening
    }

    pub fn is_closing(&self, number: u8) -> bool {
        self.context && self.number == number && self.kind == TagKind::Closing
    }

    pub fn is_context(&self, number: u8) -> bool {
        self.context && self.number == number && matches!(self.kind, TagKind::Value { .. })
    }
}

/// Cursor over tagged service data
#[derive(Debug, Clone)]
pub struct TagReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TagReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> StackResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(StackError::decode(format!(
                "truncated data: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.data.len() - self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> StackResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Decode the next tag header without consuming it
    pub fn peek_tag(&self) -> StackResult<Tag> {
        let mut probe = self.clone();
        probe.read_tag()
    }

    /// Decode and consume the next tag header
    pub fn read_tag(&mut self) -> StackResult<Tag> {
        let first = self.take_u8()?;
        let context = first & CONTEXT_CLASS != 0;
        let mut number = first >> 4;
        if number == 0x0F {
            number = self.take_u8()?;
        }
        let lvt = first & 0x07;

        let kind = match (context, lvt) {
            (true, OPENING) => TagKind::Opening,
            (true, CLOSING) => TagKind::Closing,
            (_, 5) => {
                let len = match self.take_u8()? {
                    254 => {
                        let b = self.take(2)?;
                        u16::from_be_bytes([b[0], b[1]]) as usize
                    }
                    255 => {
                        let b = self.take(4)?;
                        u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
                    }
                    n => n as usize,
                };
                TagKind::Value { len }
            }
            (_, n) => TagKind::Value { len: n as usize },
        };

        Ok(Tag {
            number,
            context,
            kind,
        })
    }

    fn value_len(tag: &Tag) -> StackResult<usize> {
        match tag.kind {
            TagKind::Value { len } => Ok(len),
            _ => Err(StackError::decode(format!(
                "expected primitive tag, found {:?} tag {}",
                tag.kind, tag.number
            ))),
        }
    }

    fn read_unsigned_content(&mut self, len: usize) -> StackResult<u64> {
        if len == 0 || len > 8 {
            return Err(StackError::decode(format!("unsigned of length {}", len)));
        }
        Ok(self
            .take(len)?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    fn read_signed_content(&mut self, len: usize) -> StackResult<i64> {
        if len == 0 || len > 8 {
            return Err(StackError::decode(format!("signed of length {}", len)));
        }
        let bytes = self.take(len)?;
        let negative = bytes[0] & 0x80 != 0;
        let init: i64 = if negative { -1 } else { 0 };
        Ok(bytes.iter().fold(init, |acc, b| (acc << 8) | *b as i64))
    }

    /// Expect an opening tag with `number`
    pub fn expect_opening(&mut self, number: u8) -> StackResult<()> {
        let tag = self.read_tag()?;
        if tag.is_opening(number) {
            Ok(())
        } else {
            Err(StackError::decode(format!("expected opening tag {}, found {:?}", number, tag)))
        }
    }

    /// Expect a closing tag with `number`
    pub fn expect_closing(&mut self, number: u8) -> StackResult<()> {
        let tag = self.read_tag()?;
        if tag.is_closing(number) {
            Ok(())
        } else {
            Err(StackError::decode(format!("expected closing tag {}, found {:?}", number, tag)))
        }
    }

    /// Whether the next tag is the opening tag `number`
    pub fn at_opening(&self, number: u8) -> bool {
        self.peek_tag().map(|t| t.is_opening(number)).unwrap_or(false)
    }

    /// Whether the next tag is the closing tag `number`
    pub fn at_closing(&self, number: u8) -> bool {
        self.peek_tag().map(|t| t.is_closing(number)).unwrap_or(false)
    }

    /// Whether the next tag is the primitive context tag `number`
    pub fn at_context(&self, number: u8) -> bool {
        self.peek_tag().map(|t| t.is_context(number)).unwrap_or(false)
    }

    pub fn read_ctx_unsigned(&mut self, number: u8) -> StackResult<u64> {
        let tag = self.read_tag()?;
        if !tag.is_context(number) {
            return Err(StackError::decode(format!("expected context tag {}, found {:?}", number, tag)));
        }
        let len = Self::value_len(&tag)?;
        self.read_unsigned_content(len)
    }

    pub fn read_ctx_object_id(&mut self, number: u8) -> StackResult<ObjectId> {
        let raw = self.read_ctx_unsigned(number)?;
        Ok(ObjectId::from_raw(raw as u32))
    }

    /// Read an optional context-tagged unsigned
    pub fn read_optional_ctx_unsigned(&mut self, number: u8) -> StackResult<Option<u64>> {
        if self.at_context(number) {
            self.read_ctx_unsigned(number).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read one application-tagged value
    pub fn read_app_value(&mut self) -> StackResult<PropertyValue> {
        let tag = self.read_tag()?;
        if tag.context {
            return Err(StackError::decode(format!(
                "expected application tag, found context tag {}",
                tag.number
            )));
        }
        let len = Self::value_len(&tag)?;

        let value = match tag.number {
            app::NULL => PropertyValue::Null,
            app::BOOLEAN => PropertyValue::Boolean(len != 0),
            app::UNSIGNED => PropertyValue::Unsigned(self.read_unsigned_content(len)?),
            app::SIGNED => PropertyValue::Signed(self.read_signed_content(len)?),
            app::REAL => {
                let b = self.take(4)?;
                PropertyValue::Real(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            app::DOUBLE => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                PropertyValue::Double(f64::from_be_bytes(raw))
            }
            app::OCTET_STRING => PropertyValue::OctetString(self.take(len)?.to_vec()),
            app::CHARACTER_STRING => {
                let content = self.take(len)?;
                match content.split_first() {
                    Some((&CHARSET_UTF8, text)) => {
                        PropertyValue::CharacterString(String::from_utf8_lossy(text).into_owned())
                    }
                    // ISO 8859-1: every byte maps straight onto a code point
                    Some((5, text)) => {
                        PropertyValue::CharacterString(text.iter().map(|b| *b as char).collect())
                    }
                    Some((charset, _)) => {
                        PropertyValue::Unrepresentable(format!("character set {}", charset))
                    }
                    None => PropertyValue::CharacterString(String::new()),
                }
            }
            app::BIT_STRING => {
                let content = self.take(len)?;
                match content.split_first() {
                    Some((unused, bits)) => PropertyValue::BitString {
                        unused_bits: *unused,
                        bits: bits.to_vec(),
                    },
                    None => PropertyValue::BitString {
                        unused_bits: 0,
                        bits: Vec::new(),
                    },
                }
            }
            app::ENUMERATED => PropertyValue::Enumerated(self.read_unsigned_content(len)? as u32),
            app::DATE | app::TIME => {
                let b = self.take(4)?;
                let raw = [b[0], b[1], b[2], b[3]];
                if tag.number == app::DATE {
                    PropertyValue::Date(raw)
                } else {
                    PropertyValue::Time(raw)
                }
            }
            app::OBJECT_ID => {
                let raw = self.read_unsigned_content(4)?;
                PropertyValue::ObjectId(ObjectId::from_raw(raw as u32))
            }
            other => {
                self.take(len)?;
                PropertyValue::Unrepresentable(format!("application tag {}", other))
            }
        };
        Ok(value)
    }

    /// Read application values up to (and including) the closing tag `number`
    ///
    /// Constructed values nested inside are skipped and reported as
    /// unrepresentable rather than aborting the surrounding decode.
    pub fn read_values_until_closing(&mut self, number: u8) -> StackResult<Vec<PropertyValue>> {
        let mut values = Vec::new();
        loop {
            let tag = self.peek_tag()?;
            if tag.is_closing(number) {
                self.read_tag()?;
                return Ok(values);
            }
            if tag.context {
                self.skip_element()?;
                values.push(PropertyValue::Unrepresentable(format!(
                    "constructed context tag {}",
                    tag.number
                )));
            } else {
                values.push(self.read_app_value()?);
            }
        }
    }

    /// Skip one element, including any nested constructed content
    pub fn skip_element(&mut self) -> StackResult<()> {
        let tag = self.read_tag()?;
        match tag.kind {
            TagKind::Value { len } => {
                if !(tag.number == app::BOOLEAN && !tag.context) {
                    self.take(len)?;
                }
                Ok(())
            }
            TagKind::Opening => {
                while !self.at_closing(tag.number) {
                    self.skip_element()?;
                }
                self.read_tag()?;
                Ok(())
            }
            TagKind::Closing => Err(StackError::decode(format!(
                "unbalanced closing tag {}",
                tag.number
            ))),
        }
    }

    /// Read a bare application-tagged enumerated (error class/code)
    pub fn read_app_enumerated(&mut self) -> StackResult<u32> {
        match self.read_app_value()? {
            PropertyValue::Enumerated(e) => Ok(e),
            other => Err(StackError::decode(format!("expected enumerated, found {:?}", other))),
        }
    }

    pub fn read_app_unsigned(&mut self) -> StackResult<u64> {
        match self.read_app_value()? {
            PropertyValue::Unsigned(u) => Ok(u),
            other => Err(StackError::decode(format!("expected unsigned, found {:?}", other))),
        }
    }

    pub fn read_app_object_id(&mut self) -> StackResult<ObjectId> {
        match self.read_app_value()? {
            PropertyValue::ObjectId(oid) => Ok(oid),
            other => Err(StackError::decode(format!("expected object identifier, found {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectType;

    #[test]
    fn test_unsigned_minimal_encoding() {
        let mut buf = BytesMut::new();
        encode_app_unsigned(&mut buf, 0);
        assert_eq!(&buf[..], &[0x21, 0x00]);

        let mut buf = BytesMut::new();
        encode_app_unsigned(&mut buf, 1476);
        assert_eq!(&buf[..], &[0x22, 0x05, 0xC4]);
    }

    #[test]
    fn test_context_tags() {
        let mut buf = BytesMut::new();
        encode_ctx_object_id(&mut buf, 0, ObjectId::new(ObjectType::AnalogInput, 1));
        encode_opening(&mut buf, 1);
        encode_ctx_unsigned(&mut buf, 0, 85);
        encode_closing(&mut buf, 1);
        assert_eq!(&buf[..], &[0x0C, 0x00, 0x00, 0x00, 0x01, 0x1E, 0x09, 0x55, 0x1F]);

        let mut reader = TagReader::new(&buf);
        assert_eq!(
            reader.read_ctx_object_id(0).unwrap(),
            ObjectId::new(ObjectType::AnalogInput, 1)
        );
        reader.expect_opening(1).unwrap();
        assert_eq!(reader.read_ctx_unsigned(0).unwrap(), 85);
        reader.expect_closing(1).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn test_real_and_string_values() {
        let mut buf = BytesMut::new();
        encode_app_value(&mut buf, &PropertyValue::Real(23.5)).unwrap();
        encode_app_value(&mut buf, &PropertyValue::CharacterString("Boiler plant supply temperature".into()))
            .unwrap();
        encode_closing(&mut buf, 3);

        let mut reader = TagReader::new(&buf);
        let values = reader.read_values_until_closing(3).unwrap();
        assert_eq!(values[0], PropertyValue::Real(23.5));
        assert_eq!(
            values[1],
            PropertyValue::CharacterString("Boiler plant supply temperature".into())
        );
    }

    #[test]
    fn test_signed_negative() {
        let mut buf = BytesMut::new();
        encode_app_value(&mut buf, &PropertyValue::Signed(-129)).unwrap();
        assert_eq!(&buf[..], &[0x32, 0xFF, 0x7F]);
        let mut reader = TagReader::new(&buf);
        assert_eq!(reader.read_app_value().unwrap(), PropertyValue::Signed(-129));
    }

    #[test]
    fn test_truncated_value_is_decode_error() {
        let data = [0x44, 0x41, 0xBC];
        let mut reader = TagReader::new(&data);
        let err = reader.read_app_value().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DecodeError);
    }

    #[test]
    fn test_unknown_charset_is_unrepresentable() {
        // charset 3 (UCS-4) is not supported
        let data = [0x73, 0x03, b'a', b'b'];
        let mut reader = TagReader::new(&data);
        assert!(matches!(
            reader.read_app_value().unwrap(),
            PropertyValue::Unrepresentable(_)
        ));
    }
}
