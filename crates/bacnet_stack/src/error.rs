//! Stack error types

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

/// Coarse classification used by callers to decide how far a failure spreads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Socket or stack could not start
    BindFailure,
    /// No response within the request timeout
    Timeout,
    /// Peer answered with an Error, Reject or Abort PDU
    ProtocolError,
    /// Malformed frame or unexpected datatype
    DecodeError,
    /// The binding was shut down while the request was outstanding
    Cancelled,
    /// Sending failed at the socket layer
    Io,
    /// The request itself could not be built
    InvalidRequest,
}

/// Errors raised by the binding and the correlator
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("Failed to bind BACnet/IP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("No response from {peer} within {timeout:?}")]
    Timeout { peer: SocketAddr, timeout: Duration },

    #[error("Error PDU from {peer}: class {class}, code {code}")]
    ErrorPdu { peer: SocketAddr, class: u32, code: u32 },

    #[error("Request rejected by {peer}: reason {reason}")]
    Reject { peer: SocketAddr, reason: u8 },

    #[error("Request aborted by {peer}: reason {reason}")]
    Abort { peer: SocketAddr, reason: u8 },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Request cancelled: binding is shutting down")]
    Cancelled,

    #[error("Binding closed")]
    Closed,

    #[error("Background loop did not stop cleanly")]
    Shutdown,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl StackError {
    pub fn decode(msg: impl Into<String>) -> Self {
        StackError::Decode(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StackError::Bind { .. } => ErrorKind::BindFailure,
            StackError::Timeout { .. } => ErrorKind::Timeout,
            StackError::ErrorPdu { .. } | StackError::Reject { .. } | StackError::Abort { .. } => {
                ErrorKind::ProtocolError
            }
            StackError::Decode(_) => ErrorKind::DecodeError,
            StackError::Cancelled | StackError::Closed | StackError::Shutdown => ErrorKind::Cancelled,
            StackError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            StackError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type for stack operations
pub type StackResult<T> = Result<T, StackError>;
