//! PFCP Messages
//!
//! Request messages keep rule IEs undecoded so that a malformed rule can be
//! rejected on its own; response messages are fully typed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PfcpError, PfcpResult};
use crate::grouped::{CreatedPdr, DownlinkDataReport, GroupedIe, UsageReport};
use crate::header::{PfcpHeader, PfcpMessageType};
use crate::ie::{decode_all, find, find_value, require_value, Ie, IeType, IeValue, OffendingIe, RecoveryTimeStamp};
use crate::types::{
    FSeid, NodeId, PfcpCause, ReportType, UpFunctionFeatures, UserPlaneIpResourceInformation,
};

fn put(buf: &mut BytesMut, ie: Ie) {
    ie.encode(buf);
}

fn put_opt<T: IeValue>(buf: &mut BytesMut, value: &Option<T>) {
    if let Some(value) = value {
        value.to_ie().encode(buf);
    }
}

fn put_all(buf: &mut BytesMut, ies: &[Ie]) {
    for ie in ies {
        ie.encode(buf);
    }
}

fn collect(ies: &[Ie], ie_type: IeType) -> Vec<Ie> {
    ies.iter().filter(|ie| ie.is(ie_type)).cloned().collect()
}

// ============================================================================
// Node messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub recovery_time_stamp: u32,
}

impl HeartbeatRequest {
    pub fn new(recovery_time_stamp: u32) -> Self {
        Self { recovery_time_stamp }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put(buf, RecoveryTimeStamp(self.recovery_time_stamp).to_ie());
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            recovery_time_stamp: require_value::<RecoveryTimeStamp>(&ies)?.0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub recovery_time_stamp: u32,
}

impl HeartbeatResponse {
    pub fn new(recovery_time_stamp: u32) -> Self {
        Self { recovery_time_stamp }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put(buf, RecoveryTimeStamp(self.recovery_time_stamp).to_ie());
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            recovery_time_stamp: require_value::<RecoveryTimeStamp>(&ies)?.0,
        })
    }
}

/// Association Setup Request; the Node ID is kept raw so an unparseable
/// value can be answered with a cause instead of being dropped
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssociationSetupRequest {
    pub node_id: Option<Ie>,
    pub recovery_time_stamp: Option<u32>,
}

impl AssociationSetupRequest {
    pub fn new(node_id: &NodeId, recovery_time_stamp: u32) -> Self {
        Self {
            node_id: Some(node_id.to_ie()),
            recovery_time_stamp: Some(recovery_time_stamp),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        if let Some(node_id) = &self.node_id {
            node_id.encode(buf);
        }
        put_opt(buf, &self.recovery_time_stamp.map(RecoveryTimeStamp));
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            node_id: find(&ies, IeType::NodeId).cloned(),
            recovery_time_stamp: find_value::<RecoveryTimeStamp>(&ies)
                .ok()
                .flatten()
                .map(|ts| ts.0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationSetupResponse {
    pub node_id: NodeId,
    pub cause: PfcpCause,
    pub recovery_time_stamp: Option<u32>,
    pub up_function_features: Option<UpFunctionFeatures>,
    pub user_plane_ip_resource_information: Vec<UserPlaneIpResourceInformation>,
}

impl AssociationSetupResponse {
    pub fn new(node_id: NodeId, cause: PfcpCause) -> Self {
        Self {
            node_id,
            cause,
            recovery_time_stamp: None,
            up_function_features: None,
            user_plane_ip_resource_information: Vec::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put(buf, self.node_id.to_ie());
        put(buf, self.cause.to_ie());
        put_opt(buf, &self.recovery_time_stamp.map(RecoveryTimeStamp));
        put_opt(buf, &self.up_function_features);
        for info in &self.user_plane_ip_resource_information {
            put(buf, info.to_ie());
        }
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            node_id: require_value(&ies)?,
            cause: require_value(&ies)?,
            recovery_time_stamp: find_value::<RecoveryTimeStamp>(&ies)?.map(|ts| ts.0),
            up_function_features: find_value(&ies)?,
            user_plane_ip_resource_information: collect(
                &ies,
                IeType::UserPlaneIpResourceInformation,
            )
            .iter()
            .map(Ie::value)
            .collect::<PfcpResult<_>>()?,
        })
    }
}

// ============================================================================
// Session messages
// ============================================================================

/// Session Establishment Request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionEstablishmentRequest {
    pub node_id: Option<Ie>,
    pub cp_f_seid: Option<Ie>,
    pub create_pdr: Vec<Ie>,
    pub create_far: Vec<Ie>,
    pub create_qer: Vec<Ie>,
}

impl SessionEstablishmentRequest {
    pub fn new(node_id: &NodeId, cp_f_seid: &FSeid) -> Self {
        Self {
            node_id: Some(node_id.to_ie()),
            cp_f_seid: Some(cp_f_seid.to_ie()),
            ..Default::default()
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        for ie in self.node_id.iter().chain(self.cp_f_seid.iter()) {
            ie.encode(buf);
        }
        put_all(buf, &self.create_pdr);
        put_all(buf, &self.create_far);
        put_all(buf, &self.create_qer);
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            node_id: find(&ies, IeType::NodeId).cloned(),
            cp_f_seid: find(&ies, IeType::FSeid).cloned(),
            create_pdr: collect(&ies, IeType::CreatePdr),
            create_far: collect(&ies, IeType::CreateFar),
            create_qer: collect(&ies, IeType::CreateQer),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEstablishmentResponse {
    pub node_id: NodeId,
    pub cause: PfcpCause,
    pub offending_ie: Option<u16>,
    pub up_f_seid: Option<FSeid>,
    pub created_pdr: Vec<CreatedPdr>,
}

impl SessionEstablishmentResponse {
    pub fn new(node_id: NodeId, cause: PfcpCause) -> Self {
        Self {
            node_id,
            cause,
            offending_ie: None,
            up_f_seid: None,
            created_pdr: Vec::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put(buf, self.node_id.to_ie());
        put(buf, self.cause.to_ie());
        put_opt(buf, &self.offending_ie.map(OffendingIe));
        put_opt(buf, &self.up_f_seid);
        for pdr in &self.created_pdr {
            put(buf, pdr.to_ie());
        }
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            node_id: require_value(&ies)?,
            cause: require_value(&ies)?,
            offending_ie: find_value::<OffendingIe>(&ies)?.map(|ie| ie.0),
            up_f_seid: find_value(&ies)?,
            created_pdr: collect(&ies, IeType::CreatedPdr)
                .iter()
                .map(CreatedPdr::from_ie)
                .collect::<PfcpResult<_>>()?,
        })
    }
}

/// Session Modification Request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionModificationRequest {
    pub cp_f_seid: Option<Ie>,
    pub create_pdr: Vec<Ie>,
    pub create_far: Vec<Ie>,
    pub create_qer: Vec<Ie>,
    pub update_pdr: Vec<Ie>,
    pub update_far: Vec<Ie>,
    pub update_qer: Vec<Ie>,
    pub remove_pdr: Vec<Ie>,
    pub remove_far: Vec<Ie>,
    pub remove_qer: Vec<Ie>,
}

impl SessionModificationRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        if let Some(fseid) = &self.cp_f_seid {
            fseid.encode(buf);
        }
        for group in [
            &self.remove_pdr,
            &self.remove_far,
            &self.remove_qer,
            &self.create_pdr,
            &self.create_far,
            &self.create_qer,
            &self.update_pdr,
            &self.update_far,
            &self.update_qer,
        ] {
            put_all(buf, group);
        }
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            cp_f_seid: find(&ies, IeType::FSeid).cloned(),
            create_pdr: collect(&ies, IeType::CreatePdr),
            create_far: collect(&ies, IeType::CreateFar),
            create_qer: collect(&ies, IeType::CreateQer),
            update_pdr: collect(&ies, IeType::UpdatePdr),
            update_far: collect(&ies, IeType::UpdateFar),
            update_qer: collect(&ies, IeType::UpdateQer),
            remove_pdr: collect(&ies, IeType::RemovePdr),
            remove_far: collect(&ies, IeType::RemoveFar),
            remove_qer: collect(&ies, IeType::RemoveQer),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionModificationResponse {
    pub cause: PfcpCause,
    pub offending_ie: Option<u16>,
    pub created_pdr: Vec<CreatedPdr>,
}

impl SessionModificationResponse {
    pub fn new(cause: PfcpCause) -> Self {
        Self {
            cause,
            offending_ie: None,
            created_pdr: Vec::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put(buf, self.cause.to_ie());
        put_opt(buf, &self.offending_ie.map(OffendingIe));
        for pdr in &self.created_pdr {
            put(buf, pdr.to_ie());
        }
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            cause: require_value(&ies)?,
            offending_ie: find_value::<OffendingIe>(&ies)?.map(|ie| ie.0),
            created_pdr: collect(&ies, IeType::CreatedPdr)
                .iter()
                .map(CreatedPdr::from_ie)
                .collect::<PfcpResult<_>>()?,
        })
    }
}

/// Session Deletion Request carries no IEs; the session is named by the header SEID
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDeletionRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDeletionResponse {
    pub cause: PfcpCause,
    pub offending_ie: Option<u16>,
}

impl SessionDeletionResponse {
    pub fn new(cause: PfcpCause) -> Self {
        Self {
            cause,
            offending_ie: None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put(buf, self.cause.to_ie());
        put_opt(buf, &self.offending_ie.map(OffendingIe));
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            cause: require_value(&ies)?,
            offending_ie: find_value::<OffendingIe>(&ies)?.map(|ie| ie.0),
        })
    }
}

/// Session Report Request sent by the UP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReportRequest {
    pub report_type: ReportType,
    pub downlink_data_report: Option<DownlinkDataReport>,
    pub usage_report: Vec<UsageReport>,
}

impl SessionReportRequest {
    pub fn downlink_data(report: DownlinkDataReport) -> Self {
        Self {
            report_type: ReportType(ReportType::DLDR),
            downlink_data_report: Some(report),
            usage_report: Vec::new(),
        }
    }

    pub fn usage(report: UsageReport) -> Self {
        Self {
            report_type: ReportType(ReportType::USAR),
            downlink_data_report: None,
            usage_report: vec![report],
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put(buf, self.report_type.to_ie());
        if let Some(report) = &self.downlink_data_report {
            put(buf, report.to_ie());
        }
        for report in &self.usage_report {
            put(buf, report.to_ie());
        }
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            report_type: require_value(&ies)?,
            downlink_data_report: find(&ies, IeType::DownlinkDataReport)
                .map(DownlinkDataReport::from_ie)
                .transpose()?,
            usage_report: collect(&ies, IeType::UsageReportSrr)
                .iter()
                .map(UsageReport::from_ie)
                .collect::<PfcpResult<_>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReportResponse {
    pub cause: PfcpCause,
    pub offending_ie: Option<u16>,
}

impl SessionReportResponse {
    pub fn new(cause: PfcpCause) -> Self {
        Self {
            cause,
            offending_ie: None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put(buf, self.cause.to_ie());
        put_opt(buf, &self.offending_ie.map(OffendingIe));
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let ies = decode_all(buf.split_off(0))?;
        Ok(Self {
            cause: require_value(&ies)?,
            offending_ie: find_value::<OffendingIe>(&ies)?.map(|ie| ie.0),
        })
    }
}

// ============================================================================
// Message envelope
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PfcpMessage {
    HeartbeatRequest(HeartbeatRequest),
    HeartbeatResponse(HeartbeatResponse),
    AssociationSetupRequest(AssociationSetupRequest),
    AssociationSetupResponse(AssociationSetupResponse),
    SessionEstablishmentRequest(SessionEstablishmentRequest),
    SessionEstablishmentResponse(SessionEstablishmentResponse),
    SessionModificationRequest(SessionModificationRequest),
    SessionModificationResponse(SessionModificationResponse),
    SessionDeletionRequest(SessionDeletionRequest),
    SessionDeletionResponse(SessionDeletionResponse),
    SessionReportRequest(SessionReportRequest),
    SessionReportResponse(SessionReportResponse),
}

impl PfcpMessage {
    pub fn message_type(&self) -> PfcpMessageType {
        match self {
            Self::HeartbeatRequest(_) => PfcpMessageType::HeartbeatRequest,
            Self::HeartbeatResponse(_) => PfcpMessageType::HeartbeatResponse,
            Self::AssociationSetupRequest(_) => PfcpMessageType::AssociationSetupRequest,
            Self::AssociationSetupResponse(_) => PfcpMessageType::AssociationSetupResponse,
            Self::SessionEstablishmentRequest(_) => PfcpMessageType::SessionEstablishmentRequest,
            Self::SessionEstablishmentResponse(_) => PfcpMessageType::SessionEstablishmentResponse,
            Self::SessionModificationRequest(_) => PfcpMessageType::SessionModificationRequest,
            Self::SessionModificationResponse(_) => PfcpMessageType::SessionModificationResponse,
            Self::SessionDeletionRequest(_) => PfcpMessageType::SessionDeletionRequest,
            Self::SessionDeletionResponse(_) => PfcpMessageType::SessionDeletionResponse,
            Self::SessionReportRequest(_) => PfcpMessageType::SessionReportRequest,
            Self::SessionReportResponse(_) => PfcpMessageType::SessionReportResponse,
        }
    }

    pub fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Self::HeartbeatRequest(msg) => msg.encode(buf),
            Self::HeartbeatResponse(msg) => msg.encode(buf),
            Self::AssociationSetupRequest(msg) => msg.encode(buf),
            Self::AssociationSetupResponse(msg) => msg.encode(buf),
            Self::SessionEstablishmentRequest(msg) => msg.encode(buf),
            Self::SessionEstablishmentResponse(msg) => msg.encode(buf),
            Self::SessionModificationRequest(msg) => msg.encode(buf),
            Self::SessionModificationResponse(msg) => msg.encode(buf),
            Self::SessionDeletionRequest(_) => {}
            Self::SessionDeletionResponse(msg) => msg.encode(buf),
            Self::SessionReportRequest(msg) => msg.encode(buf),
            Self::SessionReportResponse(msg) => msg.encode(buf),
        }
    }

    pub fn decode_body(message_type: PfcpMessageType, buf: &mut Bytes) -> PfcpResult<Self> {
        use PfcpMessageType as T;
        Ok(match message_type {
            T::HeartbeatRequest => Self::HeartbeatRequest(HeartbeatRequest::decode(buf)?),
            T::HeartbeatResponse => Self::HeartbeatResponse(HeartbeatResponse::decode(buf)?),
            T::AssociationSetupRequest => {
                Self::AssociationSetupRequest(AssociationSetupRequest::decode(buf)?)
            }
            T::AssociationSetupResponse => {
                Self::AssociationSetupResponse(AssociationSetupResponse::decode(buf)?)
            }
            T::SessionEstablishmentRequest => {
                Self::SessionEstablishmentRequest(SessionEstablishmentRequest::decode(buf)?)
            }
            T::SessionEstablishmentResponse => {
                Self::SessionEstablishmentResponse(SessionEstablishmentResponse::decode(buf)?)
            }
            T::SessionModificationRequest => {
                Self::SessionModificationRequest(SessionModificationRequest::decode(buf)?)
            }
            T::SessionModificationResponse => {
                Self::SessionModificationResponse(SessionModificationResponse::decode(buf)?)
            }
            T::SessionDeletionRequest => {
                buf.advance(buf.remaining());
                Self::SessionDeletionRequest(SessionDeletionRequest)
            }
            T::SessionDeletionResponse => {
                Self::SessionDeletionResponse(SessionDeletionResponse::decode(buf)?)
            }
            T::SessionReportRequest => {
                Self::SessionReportRequest(SessionReportRequest::decode(buf)?)
            }
            T::SessionReportResponse => {
                Self::SessionReportResponse(SessionReportResponse::decode(buf)?)
            }
        })
    }
}

/// Encode a message with its header. `seid` must be set for session messages.
pub fn build_message(message: &PfcpMessage, sequence_number: u32, seid: Option<u64>) -> BytesMut {
    let message_type = message.message_type();
    let mut body = BytesMut::new();
    message.encode_body(&mut body);

    let mut header = match seid {
        Some(seid) => PfcpHeader::new_with_seid(message_type, seid, sequence_number),
        None => PfcpHeader::new(message_type, sequence_number),
    };
    header.length = (body.len() + header.header_len() - 4) as u16;

    let mut buf = BytesMut::with_capacity(header.header_len() + body.len());
    header.encode(&mut buf);
    buf.put_slice(&body);
    buf
}

/// Decode only the header and isolate the body announced by its length field
pub fn split_message(buf: &mut Bytes) -> PfcpResult<(PfcpHeader, Bytes)> {
    let header = PfcpHeader::decode(buf)?;
    let body_len = header.body_len()?;
    if buf.remaining() < body_len {
        return Err(PfcpError::short(body_len, buf.remaining()));
    }
    Ok((header, buf.split_to(body_len)))
}

/// Parse a complete PFCP message
pub fn parse_message(buf: &mut Bytes) -> PfcpResult<(PfcpHeader, PfcpMessage)> {
    let (header, mut body) = split_message(buf)?;
    let message = PfcpMessage::decode_body(header.message_type, &mut body)?;
    Ok((header, message))
}
