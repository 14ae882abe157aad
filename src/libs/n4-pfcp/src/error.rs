//! PFCP Error Types

use thiserror::Error;

/// Errors raised while encoding or decoding PFCP messages and IEs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PfcpError {
    #[error("Buffer too short: needed {needed} bytes, available {available}")]
    BufferTooShort { needed: usize, available: usize },

    #[error("Invalid message length {length} in header")]
    InvalidLength { length: u16 },

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Unexpected IE: expected type {expected}, found {found}")]
    UnexpectedIe { expected: u16, found: u16 },

    #[error("Invalid cause value: {0}")]
    InvalidCause(u8),

    #[error("Invalid node ID type: {0}")]
    InvalidNodeIdType(u8),

    #[error("Invalid interface value: {0}")]
    InvalidInterfaceType(u8),

    #[error("Malformed {ie} IE: {reason}")]
    MalformedIe { ie: &'static str, reason: String },

    #[error("Missing mandatory IE: {0}")]
    MissingMandatoryIe(&'static str),

    #[error("PFCP version not supported: {0}")]
    VersionNotSupported(u8),
}

impl PfcpError {
    pub(crate) fn short(needed: usize, available: usize) -> Self {
        Self::BufferTooShort { needed, available }
    }

    pub(crate) fn malformed(ie: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedIe {
            ie,
            reason: reason.into(),
        }
    }
}

/// PFCP Result type
pub type PfcpResult<T> = Result<T, PfcpError>;
