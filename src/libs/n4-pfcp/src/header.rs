//! PFCP Header
//!
//! Message header as specified in 3GPP TS 29.244 clause 7.2.2.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PfcpError, PfcpResult};
use crate::types::PFCP_VERSION;

/// Header length without SEID
pub const PFCP_HEADER_LEN: usize = 8;

/// Header length with SEID
pub const PFCP_HEADER_LEN_WITH_SEID: usize = 16;

/// Message types handled by the N4 core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PfcpMessageType {
    HeartbeatRequest = 1,
    HeartbeatResponse = 2,
    AssociationSetupRequest = 5,
    AssociationSetupResponse = 6,
    SessionEstablishmentRequest = 50,
    SessionEstablishmentResponse = 51,
    SessionModificationRequest = 52,
    SessionModificationResponse = 53,
    SessionDeletionRequest = 54,
    SessionDeletionResponse = 55,
    SessionReportRequest = 56,
    SessionReportResponse = 57,
}

impl TryFrom<u8> for PfcpMessageType {
    type Error = PfcpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::HeartbeatRequest,
            2 => Self::HeartbeatResponse,
            5 => Self::AssociationSetupRequest,
            6 => Self::AssociationSetupResponse,
            50 => Self::SessionEstablishmentRequest,
            51 => Self::SessionEstablishmentResponse,
            52 => Self::SessionModificationRequest,
            53 => Self::SessionModificationResponse,
            54 => Self::SessionDeletionRequest,
            55 => Self::SessionDeletionResponse,
            56 => Self::SessionReportRequest,
            57 => Self::SessionReportResponse,
            _ => return Err(PfcpError::InvalidMessageType(value)),
        })
    }
}

impl PfcpMessageType {
    /// Session related messages carry a SEID in the header
    pub fn has_seid(&self) -> bool {
        (*self as u8) >= 50
    }

    /// Response type paired with a request type
    pub fn response_type(&self) -> Option<Self> {
        match self {
            Self::HeartbeatRequest => Some(Self::HeartbeatResponse),
            Self::AssociationSetupRequest => Some(Self::AssociationSetupResponse),
            Self::SessionEstablishmentRequest => Some(Self::SessionEstablishmentResponse),
            Self::SessionModificationRequest => Some(Self::SessionModificationResponse),
            Self::SessionDeletionRequest => Some(Self::SessionDeletionResponse),
            Self::SessionReportRequest => Some(Self::SessionReportResponse),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::HeartbeatRequest => "Heartbeat Request",
            Self::HeartbeatResponse => "Heartbeat Response",
            Self::AssociationSetupRequest => "Association Setup Request",
            Self::AssociationSetupResponse => "Association Setup Response",
            Self::SessionEstablishmentRequest => "Session Establishment Request",
            Self::SessionEstablishmentResponse => "Session Establishment Response",
            Self::SessionModificationRequest => "Session Modification Request",
            Self::SessionModificationResponse => "Session Modification Response",
            Self::SessionDeletionRequest => "Session Deletion Request",
            Self::SessionDeletionResponse => "Session Deletion Response",
            Self::SessionReportRequest => "Session Report Request",
            Self::SessionReportResponse => "Session Report Response",
        }
    }
}

impl std::fmt::Display for PfcpMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// PFCP message header
///
/// ```text
///  octet 1      | Ver(3) | spare(2) | FO | MP | S |
///  octet 2      | Message Type                    |
///  octets 3-4   | Message Length                  |
///  octets 5-12  | SEID (only when S = 1)          |
///  next 3       | Sequence Number                 |
///  last         | Message Priority / spare        |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfcpHeader {
    pub version: u8,
    pub message_type: PfcpMessageType,
    /// Length of everything after the first four octets
    pub length: u16,
    pub seid: Option<u64>,
    /// 24-bit sequence number
    pub sequence_number: u32,
    pub priority: Option<u8>,
}

impl PfcpHeader {
    pub fn new(message_type: PfcpMessageType, sequence_number: u32) -> Self {
        Self {
            version: PFCP_VERSION,
            message_type,
            length: 0,
            seid: None,
            sequence_number: sequence_number & 0x00FF_FFFF,
            priority: None,
        }
    }

    pub fn new_with_seid(message_type: PfcpMessageType, seid: u64, sequence_number: u32) -> Self {
        Self {
            seid: Some(seid),
            ..Self::new(message_type, sequence_number)
        }
    }

    pub fn header_len(&self) -> usize {
        if self.seid.is_some() {
            PFCP_HEADER_LEN_WITH_SEID
        } else {
            PFCP_HEADER_LEN
        }
    }

    /// Length of the IE section announced by the length field
    pub fn body_len(&self) -> PfcpResult<usize> {
        (self.length as usize)
            .checked_sub(self.header_len() - 4)
            .ok_or(PfcpError::InvalidLength {
                length: self.length,
            })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let flags = ((self.version & 0x07) << 5)
            | ((self.priority.is_some() as u8) << 1)
            | (self.seid.is_some() as u8);
        buf.put_u8(flags);
        buf.put_u8(self.message_type as u8);
        buf.put_u16(self.length);
        if let Some(seid) = self.seid {
            buf.put_u64(seid);
        }
        buf.put_slice(&self.sequence_number.to_be_bytes()[1..]);
        buf.put_u8(self.priority.map(|p| (p & 0x0F) << 4).unwrap_or(0));
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        if buf.remaining() < 4 {
            return Err(PfcpError::short(4, buf.remaining()));
        }

        let flags = buf.get_u8();
        let version = flags >> 5;
        if version != PFCP_VERSION {
            return Err(PfcpError::VersionNotSupported(version));
        }
        let seid_present = flags & 0x01 != 0;
        let priority_present = flags & 0x02 != 0;

        let message_type = PfcpMessageType::try_from(buf.get_u8())?;
        let length = buf.get_u16();

        let rest = if seid_present { 12 } else { 4 };
        if buf.remaining() < rest {
            return Err(PfcpError::short(rest, buf.remaining()));
        }

        let seid = seid_present.then(|| buf.get_u64());

        let mut seq = [0u8; 4];
        buf.copy_to_slice(&mut seq[1..]);
        let last = buf.get_u8();

        Ok(Self {
            version,
            message_type,
            length,
            seid,
            sequence_number: u32::from_be_bytes(seq),
            priority: priority_present.then_some(last >> 4),
        })
    }
}
