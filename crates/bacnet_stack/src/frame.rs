//! BVLC and NPDU framing for BACnet/IP
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ BVLC (4+ bytes) │ NPDU (2+ bytes) │ APDU (var)   │
//! └──────────────────────────────────────────────────┘
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, BytesMut};

use crate::error::{StackError, StackResult};

/// BVLC type byte for BACnet/IP
pub const BVLC_TYPE: u8 = 0x81;

const NPDU_VERSION: u8 = 0x01;

/// BVLC function codes used by this stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvlcFunction {
    Result = 0x00,
    ForwardedNpdu = 0x04,
    RegisterForeignDevice = 0x05,
    DistributeBroadcastToNetwork = 0x09,
    OriginalUnicastNpdu = 0x0A,
    OriginalBroadcastNpdu = 0x0B,
}

impl BvlcFunction {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(BvlcFunction::Result),
            0x04 => Some(BvlcFunction::ForwardedNpdu),
            0x05 => Some(BvlcFunction::RegisterForeignDevice),
            0x09 => Some(BvlcFunction::DistributeBroadcastToNetwork),
            0x0A => Some(BvlcFunction::OriginalUnicastNpdu),
            0x0B => Some(BvlcFunction::OriginalBroadcastNpdu),
            _ => None,
        }
    }
}

/// Broadcast address of `ip` within the subnet `mask`
pub fn broadcast_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let ip = u32::from(ip);
    let mask = u32::from(mask);
    Ipv4Addr::from(ip | !mask)
}

/// Wrap an NPDU in a BVLC header
pub fn encode_bvlc(function: BvlcFunction, npdu: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + npdu.len());
    buf.put_u8(BVLC_TYPE);
    buf.put_u8(function as u8);
    buf.put_u16((4 + npdu.len()) as u16);
    buf.put_slice(npdu);
    buf.to_vec()
}

/// Register-Foreign-Device request with the given time-to-live (seconds)
pub fn encode_register_foreign_device(ttl: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(BVLC_TYPE);
    buf.put_u8(BvlcFunction::RegisterForeignDevice as u8);
    buf.put_u16(6);
    buf.put_u16(ttl);
    buf.to_vec()
}

/// A decoded BVLC frame
#[derive(Debug)]
pub enum Frame<'a> {
    /// NPDU payload; `origin` is the original sender for forwarded frames
    Npdu {
        function: BvlcFunction,
        origin: Option<SocketAddr>,
        npdu: &'a [u8],
    },
    /// BVLC-Result carrying a result code (BBMD registration answers)
    Result(u16),
    /// BVLC function this stack does not act on
    Ignored(u8),
}

pub fn decode_bvlc(data: &[u8]) -> StackResult<Frame<'_>> {
    if data.len() < 4 {
        return Err(StackError::decode("BVLC header shorter than 4 bytes"));
    }
    if data[0] != BVLC_TYPE {
        return Err(StackError::decode(format!("BVLC type 0x{:02X} is not BACnet/IP", data[0])));
    }
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if length < 4 || length > data.len() {
        return Err(StackError::decode(format!(
            "BVLC length {} does not match datagram of {} bytes",
            length,
            data.len()
        )));
    }
    let body = &data[4..length];

    let Some(function) = BvlcFunction::from_u8(data[1]) else {
        return Ok(Frame::Ignored(data[1]));
    };

    match function {
        BvlcFunction::OriginalUnicastNpdu
        | BvlcFunction::OriginalBroadcastNpdu
        | BvlcFunction::DistributeBroadcastToNetwork => Ok(Frame::Npdu {
            function,
            origin: None,
            npdu: body,
        }),
        BvlcFunction::ForwardedNpdu => {
            if body.len() < 6 {
                return Err(StackError::decode("Forwarded-NPDU without originating address"));
            }
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[4], body[5]]);
            Ok(Frame::Npdu {
                function,
                origin: Some(SocketAddr::V4(SocketAddrV4::new(ip, port))),
                npdu: &body[6..],
            })
        }
        BvlcFunction::Result => {
            if body.len() < 2 {
                return Err(StackError::decode("BVLC-Result without result code"));
            }
            Ok(Frame::Result(u16::from_be_bytes([body[0], body[1]])))
        }
        BvlcFunction::RegisterForeignDevice => Ok(Frame::Ignored(data[1])),
    }
}

/// Encode a local (non-routed) NPDU around `apdu`
pub fn encode_npdu(apdu: &[u8], expecting_reply: bool) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 + apdu.len());
    buf.put_u8(NPDU_VERSION);
    buf.put_u8(if expecting_reply { 0x04 } else { 0x00 });
    buf.put_slice(apdu);
    buf.to_vec()
}

/// Decoded NPDU header
#[derive(Debug)]
pub struct Npdu<'a> {
    pub network_message: bool,
    pub expecting_reply: bool,
    pub apdu: &'a [u8],
}

pub fn decode_npdu(data: &[u8]) -> StackResult<Npdu<'_>> {
    if data.len() < 2 {
        return Err(StackError::decode("NPDU shorter than 2 bytes"));
    }
    if data[0] != NPDU_VERSION {
        return Err(StackError::decode(format!("NPDU version {} not supported", data[0])));
    }
    let control = data[1];
    let network_message = control & 0x80 != 0;
    let has_destination = control & 0x20 != 0;
    let has_source = control & 0x08 != 0;
    let expecting_reply = control & 0x04 != 0;

    let mut pos = 2;
    let skip_address = |pos: &mut usize| -> StackResult<()> {
        // DNET/SNET (2) + length (1) + address bytes
        if *pos + 3 > data.len() {
            return Err(StackError::decode("truncated NPDU address"));
        }
        let len = data[*pos + 2] as usize;
        *pos += 3 + len;
        if *pos > data.len() {
            return Err(StackError::decode("truncated NPDU address"));
        }
        Ok(())
    };

    if has_destination {
        skip_address(&mut pos)?;
    }
    if has_source {
        skip_address(&mut pos)?;
    }
    if has_destination {
        // Hop count
        pos += 1;
    }
    if pos > data.len() {
        return Err(StackError::decode("truncated NPDU header"));
    }

    Ok(Npdu {
        network_message,
        expecting_reply,
        apdu: &data[pos..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_address() {
        let ip = Ipv4Addr::new(192, 168, 1, 10);
        assert_eq!(
            broadcast_address(ip, Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_address(ip, Ipv4Addr::new(255, 255, 0, 0)),
            Ipv4Addr::new(192, 168, 255, 255)
        );
    }

    #[test]
    fn test_bvlc_unicast_header() {
        let frame = encode_bvlc(BvlcFunction::OriginalUnicastNpdu, &[0x01, 0x04, 0x10, 0x08]);
        assert_eq!(frame, vec![0x81, 0x0A, 0x00, 0x08, 0x01, 0x04, 0x10, 0x08]);

        match decode_bvlc(&frame).unwrap() {
            Frame::Npdu { function, origin, npdu } => {
                assert_eq!(function, BvlcFunction::OriginalUnicastNpdu);
                assert!(origin.is_none());
                let npdu = decode_npdu(npdu).unwrap();
                assert!(npdu.expecting_reply);
                assert_eq!(npdu.apdu, &[0x10, 0x08]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_forwarded_npdu_origin() {
        let data = [
            0x81, 0x04, 0x00, 0x0E, 192, 168, 1, 20, 0xBA, 0xC0, 0x01, 0x00, 0x10, 0x00,
        ];
        match decode_bvlc(&data).unwrap() {
            Frame::Npdu { origin, npdu, .. } => {
                assert_eq!(origin, Some("192.168.1.20:47808".parse().unwrap()));
                assert_eq!(npdu, &[0x01, 0x00, 0x10, 0x00]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_routed_npdu_skips_source() {
        // Source network 5, 1-byte MAC 0x07
        let data = [0x01, 0x08, 0x00, 0x05, 0x01, 0x07, 0x10, 0x00];
        let npdu = decode_npdu(&data).unwrap();
        assert_eq!(npdu.apdu, &[0x10, 0x00]);
    }

    #[test]
    fn test_register_foreign_device() {
        assert_eq!(
            encode_register_foreign_device(300),
            vec![0x81, 0x05, 0x00, 0x06, 0x01, 0x2C]
        );
    }

    #[test]
    fn test_bad_bvlc_type() {
        assert!(decode_bvlc(&[0x82, 0x0A, 0x00, 0x04]).is_err());
    }
}
