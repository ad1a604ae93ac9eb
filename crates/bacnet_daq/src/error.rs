//! Error types for the polling engine

use serde::Serialize;

use bacnet_stack::StackError;
use daq_runtime::ProcessError;

/// Failure classification shared with callers of the engine
///
/// The stack kinds pass through unchanged; the write path and the
/// configuration layer add their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    BindFailure,
    Timeout,
    ProtocolError,
    DecodeError,
    Cancelled,
    Io,
    InvalidRequest,
    NotWriteable,
    VerificationFailed,
    UnknownVariable,
    Config,
    Stopped,
    Process,
}

impl From<bacnet_stack::ErrorKind> for ErrorKind {
    fn from(kind: bacnet_stack::ErrorKind) -> Self {
        match kind {
            bacnet_stack::ErrorKind::BindFailure => ErrorKind::BindFailure,
            bacnet_stack::ErrorKind::Timeout => ErrorKind::Timeout,
            bacnet_stack::ErrorKind::ProtocolError => ErrorKind::ProtocolError,
            bacnet_stack::ErrorKind::DecodeError => ErrorKind::DecodeError,
            bacnet_stack::ErrorKind::Cancelled => ErrorKind::Cancelled,
            bacnet_stack::ErrorKind::Io => ErrorKind::Io,
            bacnet_stack::ErrorKind::InvalidRequest => ErrorKind::InvalidRequest,
        }
    }
}

/// Errors raised by the engine
#[derive(Debug, thiserror::Error)]
pub enum DaqError {
    #[error(transparent)]
    Stack(#[from] StackError),

    #[error("Variable {variable_id} is not writeable")]
    NotWriteable { variable_id: u32 },

    /// The write may have reached the device; only its read-back failed
    #[error("Write to variable {variable_id} could not be verified: {reason}")]
    VerificationFailed { variable_id: u32, reason: String },

    #[error("Unknown variable: {0}")]
    UnknownVariable(u32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device group {0} is stopped")]
    Stopped(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl DaqError {
    pub fn config(msg: impl Into<String>) -> Self {
        DaqError::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Stack(e) => e.kind().into(),
            DaqError::NotWriteable { .. } => ErrorKind::NotWriteable,
            DaqError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            DaqError::UnknownVariable(_) => ErrorKind::UnknownVariable,
            DaqError::Config(_) => ErrorKind::Config,
            DaqError::Stopped(_) => ErrorKind::Stopped,
            DaqError::Process(_) => ErrorKind::Process,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(e: figment::Error) -> Self {
        DaqError::Config(e.to_string())
    }
}

/// Error as carried in a request/reply payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ErrorReply {
    pub kind: String,
    pub message: String,
}

impl From<&DaqError> for ErrorReply {
    fn from(e: &DaqError) -> Self {
        let kind = serde_json::to_value(e.kind())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", e.kind()));
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

/// Result type for engine operations
pub type DaqResult<T> = Result<T, DaqError>;
