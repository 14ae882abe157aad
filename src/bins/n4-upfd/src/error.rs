//! UPF N4 errors and their PFCP cause mapping

use n4_pfcp::types::PfcpCause;
use n4_pfcp::PfcpError;
use thiserror::Error;

use crate::forwarding::ForwardingError;

/// Errors raised while handling N4 requests
#[derive(Debug, Error)]
pub enum UpfError {
    #[error("mandatory IE missing: {0}")]
    MandatoryIeMissing(&'static str),

    #[error("no established PFCP association")]
    NoEstablishedAssociation,

    #[error("session context not found for SEID {0:#x}")]
    SessionContextNotFound(u64),

    #[error("TEID pool exhausted")]
    ResourceExhausted,

    #[error("owner already holds TEID {0:#x}")]
    AlreadyAllocated(u32),

    #[error("malformed SDF filter: {0}")]
    MalformedFilter(String),

    #[error("PDI missing or carries neither F-TEID nor UE IP address")]
    MissingPdi,

    #[error("UE IP address IE carries no address")]
    MissingAddress,

    #[error("F-TEID allocation by the CP is not supported")]
    UnsupportedAllocationMode,

    #[error("UE IP address allocation is not supported in the UPF")]
    UnsupportedUeIpAllocation,

    #[error("IPv6 outer header creation is not supported")]
    UnsupportedOuterHeaderCreation,

    #[error("{kind} {id} not found in session")]
    RuleNotFound { kind: &'static str, id: u32 },

    #[error("rule creation/modification failure: {0}")]
    RuleCreationModificationFailure(#[from] ForwardingError),

    #[error("codec error: {0}")]
    Codec(#[from] PfcpError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UpfError {
    /// Cause value answered to the SMF for this error
    pub fn cause(&self) -> PfcpCause {
        match self {
            Self::MandatoryIeMissing(_) => PfcpCause::MandatoryIeMissing,
            Self::NoEstablishedAssociation => PfcpCause::NoEstablishedPfcpAssociation,
            Self::SessionContextNotFound(_) => PfcpCause::SessionContextNotFound,
            Self::ResourceExhausted | Self::AlreadyAllocated(_) => PfcpCause::NoResourcesAvailable,
            Self::MalformedFilter(_)
            | Self::MissingPdi
            | Self::MissingAddress
            | Self::UnsupportedAllocationMode
            | Self::UnsupportedUeIpAllocation
            | Self::UnsupportedOuterHeaderCreation
            | Self::RuleNotFound { .. }
            | Self::RuleCreationModificationFailure(_) => {
                PfcpCause::RuleCreationModificationFailure
            }
            Self::Codec(_) => PfcpCause::MandatoryIeIncorrect,
            Self::Internal(_) => PfcpCause::RequestRejected,
        }
    }
}

/// UPF Result type
pub type UpfResult<T> = Result<T, UpfError>;
