//! Errors surfaced to bridge callers.

use std::time::Duration;

use crate::bridge::codec::CodecError;
use crate::bridge::protocol::{EnvelopeError, RequestId};
use crate::bridge::xml::XmlError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A value cannot be represented on the wire.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The host sent something that does not decode.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The host raised; `stack` is the host-side stack trace.
    #[error("remote error: {stack}")]
    Remote { stack: String },

    #[error("timed out after {elapsed:?} waiting for response {uid} to {operation}")]
    Timeout {
        uid: RequestId,
        operation: String,
        elapsed: Duration,
    },

    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Unknown member, or an accessor used against its access mode.
    #[error("attribute error: {0}")]
    Attribute(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding(message.into())
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        Self::Attribute(message.into())
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => Self::Connection(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<XmlError> for BridgeError {
    fn from(err: XmlError) -> Self {
        Self::Decoding(err.to_string())
    }
}

impl From<EnvelopeError> for BridgeError {
    fn from(err: EnvelopeError) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
