//! BACnet Stack - BACnet/IP binding and request correlation
//!
//! This crate contains the wire subset used by the polling engine (BVLC,
//! NPDU, APDU and tag codec), the socket binding with its I/O thread, and
//! the correlator that turns requests into confirmations.

pub mod apdu;
mod binding;
mod correlator;
mod error;
pub mod frame;
pub mod tag;
mod types;
mod value;

#[cfg(test)]
mod testing;

pub use apdu::{IAm, PropertyAccessError, PropertyRef, ReadAccessSpec, SubscribeCov, WhoIs};
pub use binding::*;
pub use correlator::{CancelHandle, Correlator, DiscoveryWindow, IAmResponse, PropertyKey, ReadResults, RequestKind};
pub use error::*;
pub use types::*;
pub use value::*;
