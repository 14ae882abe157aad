//! PFCP Types
//!
//! Typed IE values and protocol constants (TS 29.244 clause 8.2).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use crate::error::{PfcpError, PfcpResult};
use crate::ie::{ensure_len, IeType, IeValue};

/// PFCP Version
pub const PFCP_VERSION: u8 = 1;

/// PFCP UDP port
pub const PFCP_UDP_PORT: u16 = 8805;

fn ipv4_at(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

fn ipv6_at(data: &[u8], at: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[at..at + 16]);
    Ipv6Addr::from(octets)
}

// ============================================================================
// Cause
// ============================================================================

/// Cause values (clause 8.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PfcpCause {
    RequestAccepted = 1,
    RequestRejected = 64,
    SessionContextNotFound = 65,
    MandatoryIeMissing = 66,
    ConditionalIeMissing = 67,
    InvalidLength = 68,
    MandatoryIeIncorrect = 69,
    InvalidForwardingPolicy = 70,
    InvalidFTeidAllocationOption = 71,
    NoEstablishedPfcpAssociation = 72,
    RuleCreationModificationFailure = 73,
    PfcpEntityInCongestion = 74,
    NoResourcesAvailable = 75,
    ServiceNotSupported = 76,
    SystemFailure = 77,
}

impl TryFrom<u8> for PfcpCause {
    type Error = PfcpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::RequestAccepted,
            64 => Self::RequestRejected,
            65 => Self::SessionContextNotFound,
            66 => Self::MandatoryIeMissing,
            67 => Self::ConditionalIeMissing,
            68 => Self::InvalidLength,
            69 => Self::MandatoryIeIncorrect,
            70 => Self::InvalidForwardingPolicy,
            71 => Self::InvalidFTeidAllocationOption,
            72 => Self::NoEstablishedPfcpAssociation,
            73 => Self::RuleCreationModificationFailure,
            74 => Self::PfcpEntityInCongestion,
            75 => Self::NoResourcesAvailable,
            76 => Self::ServiceNotSupported,
            77 => Self::SystemFailure,
            _ => return Err(PfcpError::InvalidCause(value)),
        })
    }
}

impl PfcpCause {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestAccepted => "Request accepted",
            Self::RequestRejected => "Request rejected",
            Self::SessionContextNotFound => "Session context not found",
            Self::MandatoryIeMissing => "Mandatory IE missing",
            Self::ConditionalIeMissing => "Conditional IE missing",
            Self::InvalidLength => "Invalid length",
            Self::MandatoryIeIncorrect => "Mandatory IE incorrect",
            Self::InvalidForwardingPolicy => "Invalid forwarding policy",
            Self::InvalidFTeidAllocationOption => "Invalid F-TEID allocation option",
            Self::NoEstablishedPfcpAssociation => "No established PFCP association",
            Self::RuleCreationModificationFailure => "Rule creation/modification failure",
            Self::PfcpEntityInCongestion => "PFCP entity in congestion",
            Self::NoResourcesAvailable => "No resources available",
            Self::ServiceNotSupported => "Service not supported",
            Self::SystemFailure => "System failure",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::RequestAccepted)
    }
}

impl fmt::Display for PfcpCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), *self as u8)
    }
}

impl IeValue for PfcpCause {
    const IE_TYPE: IeType = IeType::Cause;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::Cause, data, 1)?;
        Self::try_from(data[0])
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }
}

// ============================================================================
// Node ID
// ============================================================================

/// Node ID (clause 8.2.38)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeId {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Fqdn(String),
}

impl NodeId {
    /// Interpret a configured identifier: IP literals become address node IDs,
    /// anything else is taken as an FQDN
    pub fn from_config(value: &str) -> Self {
        match value.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => Self::Ipv4(addr),
            Ok(IpAddr::V6(addr)) => Self::Ipv6(addr),
            Err(_) => Self::Fqdn(value.to_string()),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(addr) => write!(f, "{addr}"),
            Self::Ipv6(addr) => write!(f, "{addr}"),
            Self::Fqdn(name) => f.write_str(name),
        }
    }
}

impl IeValue for NodeId {
    const IE_TYPE: IeType = IeType::NodeId;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::NodeId, data, 1)?;
        match data[0] & 0x0F {
            0 => {
                ensure_len(IeType::NodeId, data, 5)?;
                Ok(Self::Ipv4(ipv4_at(data, 1)))
            }
            1 => {
                ensure_len(IeType::NodeId, data, 17)?;
                Ok(Self::Ipv6(ipv6_at(data, 1)))
            }
            2 => {
                let mut labels = Vec::new();
                let mut rest = &data[1..];
                while let Some((&len, tail)) = rest.split_first() {
                    let len = len as usize;
                    if len == 0 {
                        break;
                    }
                    if tail.len() < len {
                        return Err(PfcpError::malformed("Node ID", "truncated FQDN label"));
                    }
                    labels.push(String::from_utf8_lossy(&tail[..len]).into_owned());
                    rest = &tail[len..];
                }
                if labels.is_empty() {
                    return Err(PfcpError::malformed("Node ID", "empty FQDN"));
                }
                Ok(Self::Fqdn(labels.join(".")))
            }
            other => Err(PfcpError::InvalidNodeIdType(other)),
        }
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        match self {
            Self::Ipv4(addr) => {
                buf.put_u8(0);
                buf.put_slice(&addr.octets());
            }
            Self::Ipv6(addr) => {
                buf.put_u8(1);
                buf.put_slice(&addr.octets());
            }
            Self::Fqdn(name) => {
                buf.put_u8(2);
                for label in name.split('.').filter(|l| !l.is_empty()) {
                    buf.put_u8(label.len() as u8);
                    buf.put_slice(label.as_bytes());
                }
            }
        }
    }
}

// ============================================================================
// F-SEID
// ============================================================================

/// F-SEID (clause 8.2.37)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FSeid {
    pub seid: u64,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl FSeid {
    pub fn new(seid: u64, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> Self {
        Self { seid, ipv4, ipv6 }
    }
}

impl IeValue for FSeid {
    const IE_TYPE: IeType = IeType::FSeid;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::FSeid, data, 9)?;
        let flags = data[0];
        let seid = u64::from_be_bytes([
            data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
        ]);
        let mut at = 9;
        let ipv4 = if flags & 0x02 != 0 {
            ensure_len(IeType::FSeid, data, at + 4)?;
            at += 4;
            Some(ipv4_at(data, at - 4))
        } else {
            None
        };
        let ipv6 = if flags & 0x01 != 0 {
            ensure_len(IeType::FSeid, data, at + 16)?;
            Some(ipv6_at(data, at))
        } else {
            None
        };
        if ipv4.is_none() && ipv6.is_none() {
            return Err(PfcpError::malformed("F-SEID", "no address present"));
        }
        Ok(Self { seid, ipv4, ipv6 })
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(((self.ipv4.is_some() as u8) << 1) | self.ipv6.is_some() as u8);
        buf.put_u64(self.seid);
        if let Some(addr) = self.ipv4 {
            buf.put_slice(&addr.octets());
        }
        if let Some(addr) = self.ipv6 {
            buf.put_slice(&addr.octets());
        }
    }
}

// ============================================================================
// F-TEID
// ============================================================================

/// CHOOSE request carried by an F-TEID with CH = 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChooseTeid {
    pub ipv4: bool,
    pub ipv6: bool,
    pub choose_id: Option<u8>,
}

/// F-TEID (clause 8.2.3)
///
/// When the CP asks the UP to choose, `choose` is set and neither the TEID
/// nor the addresses are present on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FTeid {
    pub teid: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub choose: Option<ChooseTeid>,
}

impl FTeid {
    pub fn ipv4(teid: u32, addr: Ipv4Addr) -> Self {
        Self {
            teid,
            ipv4: Some(addr),
            ipv6: None,
            choose: None,
        }
    }

    pub fn choose(ipv4: bool, ipv6: bool, choose_id: Option<u8>) -> Self {
        Self {
            teid: 0,
            ipv4: None,
            ipv6: None,
            choose: Some(ChooseTeid {
                ipv4,
                ipv6,
                choose_id,
            }),
        }
    }
}

impl IeValue for FTeid {
    const IE_TYPE: IeType = IeType::FTeid;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::FTeid, data, 1)?;
        let flags = data[0];
        let v4 = flags & 0x01 != 0;
        let v6 = flags & 0x02 != 0;

        if flags & 0x04 != 0 {
            let choose_id = if flags & 0x08 != 0 {
                ensure_len(IeType::FTeid, data, 2)?;
                Some(data[1])
            } else {
                None
            };
            return Ok(Self::choose(v4, v6, choose_id));
        }

        ensure_len(IeType::FTeid, data, 5)?;
        let teid = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let mut at = 5;
        let ipv4 = if v4 {
            ensure_len(IeType::FTeid, data, at + 4)?;
            at += 4;
            Some(ipv4_at(data, at - 4))
        } else {
            None
        };
        let ipv6 = if v6 {
            ensure_len(IeType::FTeid, data, at + 16)?;
            Some(ipv6_at(data, at))
        } else {
            None
        };
        Ok(Self {
            teid,
            ipv4,
            ipv6,
            choose: None,
        })
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        if let Some(choose) = self.choose {
            let flags = 0x04
                | (choose.ipv4 as u8)
                | ((choose.ipv6 as u8) << 1)
                | ((choose.choose_id.is_some() as u8) << 3);
            buf.put_u8(flags);
            if let Some(id) = choose.choose_id {
                buf.put_u8(id);
            }
            return;
        }
        buf.put_u8((self.ipv4.is_some() as u8) | ((self.ipv6.is_some() as u8) << 1));
        buf.put_u32(self.teid);
        if let Some(addr) = self.ipv4 {
            buf.put_slice(&addr.octets());
        }
        if let Some(addr) = self.ipv6 {
            buf.put_slice(&addr.octets());
        }
    }
}

// ============================================================================
// UE IP Address
// ============================================================================

/// UE IP Address (clause 8.2.62)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UeIpAddress {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    /// S/D flag: the address is a destination address when set
    pub destination: bool,
    pub ipv6_prefix_delegation_bits: Option<u8>,
    /// CHV4: the CP asks the UP to assign an IPv4 address
    pub choose_ipv4: bool,
    /// CHV6: the CP asks the UP to assign an IPv6 address
    pub choose_ipv6: bool,
}

impl UeIpAddress {
    pub fn ipv4(addr: Ipv4Addr, destination: bool) -> Self {
        Self {
            ipv4: Some(addr),
            destination,
            ..Default::default()
        }
    }

    pub fn ipv6(addr: Ipv6Addr, destination: bool) -> Self {
        Self {
            ipv6: Some(addr),
            destination,
            ..Default::default()
        }
    }
}

impl IeValue for UeIpAddress {
    const IE_TYPE: IeType = IeType::UeIpAddress;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::UeIpAddress, data, 1)?;
        let flags = data[0];
        let choose_ipv4 = flags & 0x10 != 0;
        let choose_ipv6 = flags & 0x20 != 0;
        let mut at = 1;

        let ipv4 = if flags & 0x02 != 0 && !choose_ipv4 {
            ensure_len(IeType::UeIpAddress, data, at + 4)?;
            at += 4;
            Some(ipv4_at(data, at - 4))
        } else {
            None
        };
        let ipv6 = if flags & 0x01 != 0 && !choose_ipv6 {
            ensure_len(IeType::UeIpAddress, data, at + 16)?;
            at += 16;
            Some(ipv6_at(data, at - 16))
        } else {
            None
        };
        let ipv6_prefix_delegation_bits = if flags & 0x08 != 0 {
            ensure_len(IeType::UeIpAddress, data, at + 1)?;
            Some(data[at])
        } else {
            None
        };

        Ok(Self {
            ipv4,
            ipv6,
            destination: flags & 0x04 != 0,
            ipv6_prefix_delegation_bits,
            choose_ipv4,
            choose_ipv6,
        })
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        let flags = ((self.choose_ipv6 as u8) << 5)
            | ((self.choose_ipv4 as u8) << 4)
            | ((self.ipv6_prefix_delegation_bits.is_some() as u8) << 3)
            | ((self.destination as u8) << 2)
            | (((self.ipv4.is_some() || self.choose_ipv4) as u8) << 1)
            | ((self.ipv6.is_some() || self.choose_ipv6) as u8);
        buf.put_u8(flags);
        if let (Some(addr), false) = (self.ipv4, self.choose_ipv4) {
            buf.put_slice(&addr.octets());
        }
        if let (Some(addr), false) = (self.ipv6, self.choose_ipv6) {
            buf.put_slice(&addr.octets());
        }
        if let Some(bits) = self.ipv6_prefix_delegation_bits {
            buf.put_u8(bits);
        }
    }
}

// ============================================================================
// Interfaces
// ============================================================================

/// Interface values shared by Source Interface and Destination Interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Interface {
    #[default]
    Access = 0,
    Core = 1,
    SgiLanN6Lan = 2,
    CpFunction = 3,
    FiveGVnInternal = 4,
}

impl TryFrom<u8> for Interface {
    type Error = PfcpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value & 0x0F {
            0 => Self::Access,
            1 => Self::Core,
            2 => Self::SgiLanN6Lan,
            3 => Self::CpFunction,
            4 => Self::FiveGVnInternal,
            other => return Err(PfcpError::InvalidInterfaceType(other)),
        })
    }
}

/// Source Interface (clause 8.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceInterface(pub Interface);

impl IeValue for SourceInterface {
    const IE_TYPE: IeType = IeType::SourceInterface;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::SourceInterface, data, 1)?;
        Interface::try_from(data[0]).map(Self)
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(self.0 as u8);
    }
}

/// Destination Interface (clause 8.2.24)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DestinationInterface(pub Interface);

impl IeValue for DestinationInterface {
    const IE_TYPE: IeType = IeType::DestinationInterface;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::DestinationInterface, data, 1)?;
        Interface::try_from(data[0]).map(Self)
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(self.0 as u8);
    }
}

/// Network Instance (clause 8.2.4), kept as the raw encoded octets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkInstance(pub Vec<u8>);

impl IeValue for NetworkInstance {
    const IE_TYPE: IeType = IeType::NetworkInstance;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        Ok(Self(data.to_vec()))
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }
}

// ============================================================================
// SDF Filter
// ============================================================================

/// SDF Filter (clause 8.2.5)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdfFilter {
    pub flow_description: Option<String>,
    pub tos_traffic_class: Option<u16>,
    pub security_parameter_index: Option<u32>,
    /// 20-bit IPv6 flow label
    pub flow_label: Option<u32>,
    pub sdf_filter_id: Option<u32>,
}

impl SdfFilter {
    pub fn with_flow_description(description: impl Into<String>) -> Self {
        Self {
            flow_description: Some(description.into()),
            ..Default::default()
        }
    }
}

impl IeValue for SdfFilter {
    const IE_TYPE: IeType = IeType::SdfFilter;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::SdfFilter, data, 2)?;
        let flags = data[0];
        let mut at = 2;
        let mut filter = Self::default();

        if flags & 0x01 != 0 {
            ensure_len(IeType::SdfFilter, data, at + 2)?;
            let len = u16::from_be_bytes([data[at], data[at + 1]]) as usize;
            at += 2;
            ensure_len(IeType::SdfFilter, data, at + len)?;
            filter.flow_description =
                Some(String::from_utf8_lossy(&data[at..at + len]).into_owned());
            at += len;
        }
        if flags & 0x02 != 0 {
            ensure_len(IeType::SdfFilter, data, at + 2)?;
            filter.tos_traffic_class = Some(u16::from_be_bytes([data[at], data[at + 1]]));
            at += 2;
        }
        if flags & 0x04 != 0 {
            ensure_len(IeType::SdfFilter, data, at + 4)?;
            filter.security_parameter_index = Some(u32::from_be_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
            ]));
            at += 4;
        }
        if flags & 0x08 != 0 {
            ensure_len(IeType::SdfFilter, data, at + 3)?;
            filter.flow_label =
                Some(u32::from_be_bytes([0, data[at], data[at + 1], data[at + 2]]) & 0x000F_FFFF);
            at += 3;
        }
        if flags & 0x10 != 0 {
            ensure_len(IeType::SdfFilter, data, at + 4)?;
            filter.sdf_filter_id = Some(u32::from_be_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
            ]));
        }
        Ok(filter)
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        let flags = (self.flow_description.is_some() as u8)
            | ((self.tos_traffic_class.is_some() as u8) << 1)
            | ((self.security_parameter_index.is_some() as u8) << 2)
            | ((self.flow_label.is_some() as u8) << 3)
            | ((self.sdf_filter_id.is_some() as u8) << 4);
        buf.put_u8(flags);
        buf.put_u8(0);
        if let Some(description) = &self.flow_description {
            buf.put_u16(description.len() as u16);
            buf.put_slice(description.as_bytes());
        }
        if let Some(ttc) = self.tos_traffic_class {
            buf.put_u16(ttc);
        }
        if let Some(spi) = self.security_parameter_index {
            buf.put_u32(spi);
        }
        if let Some(label) = self.flow_label {
            buf.put_slice(&label.to_be_bytes()[1..]);
        }
        if let Some(id) = self.sdf_filter_id {
            buf.put_u32(id);
        }
    }
}

// ============================================================================
// FAR related
// ============================================================================

/// Apply Action (clause 8.2.26), first octet only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyAction(pub u8);

impl ApplyAction {
    pub const DROP: u8 = 0x01;
    pub const FORW: u8 = 0x02;
    pub const BUFF: u8 = 0x04;
    pub const NOCP: u8 = 0x08;
    pub const DUPL: u8 = 0x10;

    pub fn forward() -> Self {
        Self(Self::FORW)
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

impl IeValue for ApplyAction {
    const IE_TYPE: IeType = IeType::ApplyAction;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::ApplyAction, data, 1)?;
        Ok(Self(data[0]))
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(self.0);
    }
}

/// Outer Header Removal (clause 8.2.64)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OuterHeaderRemoval {
    /// 0 = GTP-U/UDP/IPv4, 1 = GTP-U/UDP/IPv6, 6 = GTP-U/UDP/IP
    pub description: u8,
    pub gtpu_extension_header_deletion: Option<u8>,
}

impl IeValue for OuterHeaderRemoval {
    const IE_TYPE: IeType = IeType::OuterHeaderRemoval;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::OuterHeaderRemoval, data, 1)?;
        Ok(Self {
            description: data[0],
            gtpu_extension_header_deletion: data.get(1).copied(),
        })
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(self.description);
        if let Some(deletion) = self.gtpu_extension_header_deletion {
            buf.put_u8(deletion);
        }
    }
}

/// Outer Header Creation (clause 8.2.56)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OuterHeaderCreation {
    pub description: u16,
    pub teid: Option<u32>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: Option<u16>,
}

impl OuterHeaderCreation {
    pub const GTPU_UDP_IPV4: u16 = 0x0100;
    pub const GTPU_UDP_IPV6: u16 = 0x0200;
    pub const UDP_IPV4: u16 = 0x0400;
    pub const UDP_IPV6: u16 = 0x0800;

    pub fn gtpu_ipv4(teid: u32, addr: Ipv4Addr) -> Self {
        Self {
            description: Self::GTPU_UDP_IPV4,
            teid: Some(teid),
            ipv4: Some(addr),
            ..Default::default()
        }
    }

    pub fn has_ipv4(&self) -> bool {
        self.description & (Self::GTPU_UDP_IPV4 | Self::UDP_IPV4) != 0
    }

    pub fn has_ipv6(&self) -> bool {
        self.description & (Self::GTPU_UDP_IPV6 | Self::UDP_IPV6) != 0
    }

    fn has_teid(&self) -> bool {
        self.description & (Self::GTPU_UDP_IPV4 | Self::GTPU_UDP_IPV6) != 0
    }

    fn has_port(&self) -> bool {
        self.description & (Self::UDP_IPV4 | Self::UDP_IPV6) != 0
    }
}

impl IeValue for OuterHeaderCreation {
    const IE_TYPE: IeType = IeType::OuterHeaderCreation;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::OuterHeaderCreation, data, 2)?;
        let mut ohc = Self {
            description: u16::from_be_bytes([data[0], data[1]]),
            ..Default::default()
        };
        let mut at = 2;
        if ohc.has_teid() {
            ensure_len(IeType::OuterHeaderCreation, data, at + 4)?;
            ohc.teid = Some(u32::from_be_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
            ]));
            at += 4;
        }
        if ohc.has_ipv4() {
            ensure_len(IeType::OuterHeaderCreation, data, at + 4)?;
            ohc.ipv4 = Some(ipv4_at(data, at));
            at += 4;
        }
        if ohc.has_ipv6() {
            ensure_len(IeType::OuterHeaderCreation, data, at + 16)?;
            ohc.ipv6 = Some(ipv6_at(data, at));
            at += 16;
        }
        if ohc.has_port() {
            ensure_len(IeType::OuterHeaderCreation, data, at + 2)?;
            ohc.port = Some(u16::from_be_bytes([data[at], data[at + 1]]));
        }
        Ok(ohc)
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u16(self.description);
        if self.has_teid() {
            buf.put_u32(self.teid.unwrap_or_default());
        }
        if self.has_ipv4() {
            buf.put_slice(&self.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED).octets());
        }
        if self.has_ipv6() {
            buf.put_slice(&self.ipv6.unwrap_or(Ipv6Addr::UNSPECIFIED).octets());
        }
        if self.has_port() {
            buf.put_u16(self.port.unwrap_or_default());
        }
    }
}

// ============================================================================
// QER related
// ============================================================================

/// Gate Status (clause 8.2.7): 0 = open, 1 = closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateStatus {
    pub uplink: u8,
    pub downlink: u8,
}

impl GateStatus {
    pub const OPEN: u8 = 0;
    pub const CLOSED: u8 = 1;
}

impl IeValue for GateStatus {
    const IE_TYPE: IeType = IeType::GateStatus;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::GateStatus, data, 1)?;
        Ok(Self {
            uplink: (data[0] >> 2) & 0x03,
            downlink: data[0] & 0x03,
        })
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(((self.uplink & 0x03) << 2) | (self.downlink & 0x03));
    }
}

/// MBR (clause 8.2.8), kilobits per second, 40 bits per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mbr {
    pub uplink: u64,
    pub downlink: u64,
}

impl IeValue for Mbr {
    const IE_TYPE: IeType = IeType::Mbr;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::Mbr, data, 10)?;
        let read40 = |d: &[u8]| d.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        Ok(Self {
            uplink: read40(&data[0..5]),
            downlink: read40(&data[5..10]),
        })
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.uplink.to_be_bytes()[3..]);
        buf.put_slice(&self.downlink.to_be_bytes()[3..]);
    }
}

/// QFI (clause 8.2.89)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qfi(pub u8);

impl IeValue for Qfi {
    const IE_TYPE: IeType = IeType::Qfi;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::Qfi, data, 1)?;
        Ok(Self(data[0] & 0x3F))
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(self.0 & 0x3F);
    }
}

// ============================================================================
// Node level
// ============================================================================

/// UP Function Features (clause 8.2.25), octets 5 and 6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpFunctionFeatures(pub u16);

impl UpFunctionFeatures {
    pub const BUCP: u16 = 0x0100;
    pub const DDND: u16 = 0x0200;
    pub const DLBD: u16 = 0x0400;
    pub const TRST: u16 = 0x0800;
    pub const FTUP: u16 = 0x1000;
    pub const PFDM: u16 = 0x2000;
    pub const HEEU: u16 = 0x4000;
    pub const TREU: u16 = 0x8000;
    pub const EMPU: u16 = 0x0001;
    pub const PDIU: u16 = 0x0002;
    pub const UDBC: u16 = 0x0004;
    pub const QUOAC: u16 = 0x0008;

    pub fn supports(&self, feature: u16) -> bool {
        self.0 & feature == feature
    }
}

impl IeValue for UpFunctionFeatures {
    const IE_TYPE: IeType = IeType::UpFunctionFeatures;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::UpFunctionFeatures, data, 2)?;
        Ok(Self(u16::from_be_bytes([data[0], data[1]])))
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u16(self.0);
    }
}

/// User Plane IP Resource Information (clause 8.2.82)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserPlaneIpResourceInformation {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    /// (TEID range indication bits, TEID range)
    pub teid_range: Option<(u8, u8)>,
    pub network_instance: Option<Vec<u8>>,
    pub source_interface: Option<Interface>,
}

impl UserPlaneIpResourceInformation {
    pub fn ipv4(addr: Ipv4Addr) -> Self {
        Self {
            ipv4: Some(addr),
            ..Default::default()
        }
    }
}

impl IeValue for UserPlaneIpResourceInformation {
    const IE_TYPE: IeType = IeType::UserPlaneIpResourceInformation;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        const IE: IeType = IeType::UserPlaneIpResourceInformation;
        ensure_len(IE, data, 1)?;
        let flags = data[0];
        let teidri = (flags >> 2) & 0x07;
        let mut info = Self::default();
        let mut at = 1;

        if teidri != 0 {
            ensure_len(IE, data, at + 1)?;
            info.teid_range = Some((teidri, data[at]));
            at += 1;
        }
        if flags & 0x01 != 0 {
            ensure_len(IE, data, at + 4)?;
            info.ipv4 = Some(ipv4_at(data, at));
            at += 4;
        }
        if flags & 0x02 != 0 {
            ensure_len(IE, data, at + 16)?;
            info.ipv6 = Some(ipv6_at(data, at));
            at += 16;
        }
        let has_source_interface = flags & 0x40 != 0;
        if flags & 0x20 != 0 {
            let end = if has_source_interface {
                data.len().saturating_sub(1)
            } else {
                data.len()
            };
            if end < at {
                return Err(PfcpError::malformed(IE.name(), "truncated network instance"));
            }
            info.network_instance = Some(data[at..end].to_vec());
            at = end;
        }
        if has_source_interface {
            ensure_len(IE, data, at + 1)?;
            info.source_interface = Some(Interface::try_from(data[at])?);
        }
        Ok(info)
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        let teidri = self.teid_range.map(|(bits, _)| bits & 0x07).unwrap_or(0);
        let flags = (self.ipv4.is_some() as u8)
            | ((self.ipv6.is_some() as u8) << 1)
            | (teidri << 2)
            | ((self.network_instance.is_some() as u8) << 5)
            | ((self.source_interface.is_some() as u8) << 6);
        buf.put_u8(flags);
        if let Some((_, range)) = self.teid_range.filter(|_| teidri != 0) {
            buf.put_u8(range);
        }
        if let Some(addr) = self.ipv4 {
            buf.put_slice(&addr.octets());
        }
        if let Some(addr) = self.ipv6 {
            buf.put_slice(&addr.octets());
        }
        if let Some(instance) = &self.network_instance {
            buf.put_slice(instance);
        }
        if let Some(interface) = self.source_interface {
            buf.put_u8(interface as u8);
        }
    }
}

// ============================================================================
// Reporting
// ============================================================================

/// Report Type (clause 8.2.21)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportType(pub u8);

impl ReportType {
    pub const DLDR: u8 = 0x01;
    pub const USAR: u8 = 0x02;
    pub const ERIR: u8 = 0x04;
    pub const UPIR: u8 = 0x08;

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

impl IeValue for ReportType {
    const IE_TYPE: IeType = IeType::ReportType;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::ReportType, data, 1)?;
        Ok(Self(data[0]))
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(self.0);
    }
}

/// Usage Report Trigger (clause 8.2.41), three octets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageReportTrigger(pub [u8; 3]);

impl UsageReportTrigger {
    /// PERIO: periodic reporting
    pub fn periodic() -> Self {
        Self([0x01, 0, 0])
    }

    pub fn is_periodic(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl IeValue for UsageReportTrigger {
    const IE_TYPE: IeType = IeType::UsageReportTrigger;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::UsageReportTrigger, data, 2)?;
        Ok(Self([data[0], data[1], data.get(2).copied().unwrap_or(0)]))
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }
}

/// Volume Measurement (clause 8.2.40), octets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeMeasurement {
    pub total: Option<u64>,
    pub uplink: Option<u64>,
    pub downlink: Option<u64>,
}

impl VolumeMeasurement {
    pub fn new(uplink: u64, downlink: u64) -> Self {
        Self {
            total: Some(uplink.saturating_add(downlink)),
            uplink: Some(uplink),
            downlink: Some(downlink),
        }
    }
}

impl IeValue for VolumeMeasurement {
    const IE_TYPE: IeType = IeType::VolumeMeasurement;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        ensure_len(IeType::VolumeMeasurement, data, 1)?;
        let flags = data[0];
        let mut at = 1;
        let mut next = |present: bool| -> PfcpResult<Option<u64>> {
            if !present {
                return Ok(None);
            }
            ensure_len(IeType::VolumeMeasurement, data, at + 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[at..at + 8]);
            at += 8;
            Ok(Some(u64::from_be_bytes(raw)))
        };
        Ok(Self {
            total: next(flags & 0x01 != 0)?,
            uplink: next(flags & 0x02 != 0)?,
            downlink: next(flags & 0x04 != 0)?,
        })
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        let flags = (self.total.is_some() as u8)
            | ((self.uplink.is_some() as u8) << 1)
            | ((self.downlink.is_some() as u8) << 2);
        buf.put_u8(flags);
        for volume in [self.total, self.uplink, self.downlink].into_iter().flatten() {
            buf.put_u64(volume);
        }
    }
}

/// Downlink Data Service Information (clause 8.2.27)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownlinkDataServiceInformation {
    pub paging_policy_indication: Option<u8>,
    pub qfi: Option<u8>,
}

impl IeValue for DownlinkDataServiceInformation {
    const IE_TYPE: IeType = IeType::DownlinkDataServiceInformation;

    fn decode_value(data: &[u8]) -> PfcpResult<Self> {
        const IE: IeType = IeType::DownlinkDataServiceInformation;
        ensure_len(IE, data, 1)?;
        let flags = data[0];
        let mut at = 1;
        let mut info = Self::default();
        if flags & 0x01 != 0 {
            ensure_len(IE, data, at + 1)?;
            info.paging_policy_indication = Some(data[at] & 0x3F);
            at += 1;
        }
        if flags & 0x02 != 0 {
            ensure_len(IE, data, at + 1)?;
            info.qfi = Some(data[at] & 0x3F);
        }
        Ok(info)
    }

    fn encode_value(&self, buf: &mut BytesMut) {
        buf.put_u8(
            (self.paging_policy_indication.is_some() as u8) | ((self.qfi.is_some() as u8) << 1),
        );
        if let Some(ppi) = self.paging_policy_indication {
            buf.put_u8(ppi & 0x3F);
        }
        if let Some(qfi) = self.qfi {
            buf.put_u8(qfi & 0x3F);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ie::Ie;

    fn reencode<T: IeValue>(value: &T) -> T {
        let ie: Ie = value.to_ie();
        ie.value::<T>().unwrap()
    }

    #[test]
    fn test_node_id_variants() {
        assert_eq!(NodeId::from_config("10.0.0.1"), NodeId::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(NodeId::from_config("::1"), NodeId::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(
            NodeId::from_config("upf.example.org"),
            NodeId::Fqdn("upf.example.org".into())
        );

        let fqdn = NodeId::Fqdn("smf.5gc.mnc001.mcc001".into());
        let ie = fqdn.to_ie();
        assert_eq!(ie.payload[0], 2);
        assert_eq!(ie.payload[1], 3);
        assert_eq!(reencode(&fqdn), fqdn);
    }

    #[test]
    fn test_node_id_invalid() {
        let ie = Ie::new(IeType::NodeId, vec![0u8, 10, 0]);
        assert!(matches!(ie.value::<NodeId>(), Err(PfcpError::MalformedIe { .. })));
        let ie = Ie::new(IeType::NodeId, vec![5u8]);
        assert_eq!(ie.value::<NodeId>(), Err(PfcpError::InvalidNodeIdType(5)));
        let ie = Ie::new(IeType::NodeId, Vec::<u8>::new());
        assert!(ie.value::<NodeId>().is_err());
    }

    #[test]
    fn test_fseid_requires_address() {
        let fseid = FSeid::new(0xABCD, Some(Ipv4Addr::new(192, 168, 0, 1)), None);
        let ie = fseid.to_ie();
        assert_eq!(ie.payload.len(), 13);
        assert_eq!(ie.payload[0], 0x02);
        assert_eq!(reencode(&fseid), fseid);

        let bare = Ie::new(IeType::FSeid, vec![0u8; 9]);
        assert!(bare.value::<FSeid>().is_err());
    }

    #[test]
    fn test_fteid_choose_has_no_teid_on_wire() {
        let choose = FTeid::choose(true, false, Some(5));
        let ie = choose.to_ie();
        assert_eq!(&ie.payload[..], &[0x0D, 5]);
        assert_eq!(reencode(&choose), choose);

        let explicit = FTeid::ipv4(0x1234, Ipv4Addr::new(10, 1, 1, 1));
        let ie = explicit.to_ie();
        assert_eq!(&ie.payload[..], &[0x01, 0, 0, 0x12, 0x34, 10, 1, 1, 1]);
        assert_eq!(reencode(&explicit), explicit);
    }

    #[test]
    fn test_ue_ip_address_flags() {
        let ue = UeIpAddress::ipv4(Ipv4Addr::new(10, 45, 0, 2), true);
        let ie = ue.to_ie();
        assert_eq!(&ie.payload[..], &[0x06, 10, 45, 0, 2]);
        assert_eq!(reencode(&ue), ue);

        let choose = Ie::new(IeType::UeIpAddress, vec![0x12u8]);
        let decoded = choose.value::<UeIpAddress>().unwrap();
        assert!(decoded.choose_ipv4);
        assert_eq!(decoded.ipv4, None);
    }

    #[test]
    fn test_sdf_filter_flow_description() {
        let filter = SdfFilter::with_flow_description("permit out ip from any to assigned");
        let ie = filter.to_ie();
        assert_eq!(ie.payload[0], 0x01);
        assert_eq!(u16::from_be_bytes([ie.payload[2], ie.payload[3]]), 34);
        assert_eq!(reencode(&filter), filter);
    }

    #[test]
    fn test_outer_header_creation_gtpu() {
        let ohc = OuterHeaderCreation::gtpu_ipv4(0xCAFE, Ipv4Addr::new(172, 16, 0, 9));
        let ie = ohc.to_ie();
        assert_eq!(ie.payload.len(), 10);
        let decoded = reencode(&ohc);
        assert!(decoded.has_ipv4());
        assert!(!decoded.has_ipv6());
        assert_eq!(decoded.teid, Some(0xCAFE));
        assert_eq!(decoded.port, None);
    }

    #[test]
    fn test_mbr_forty_bit_fields() {
        let mbr = Mbr {
            uplink: 0xFF_FFFF_FFFF,
            downlink: 100_000,
        };
        let ie = mbr.to_ie();
        assert_eq!(ie.payload.len(), 10);
        assert_eq!(reencode(&mbr), mbr);
    }

    #[test]
    fn test_gate_status_bits() {
        let gate = GateStatus {
            uplink: GateStatus::CLOSED,
            downlink: GateStatus::OPEN,
        };
        assert_eq!(&gate.to_ie().payload[..], &[0x04]);
        assert_eq!(reencode(&gate), gate);
    }

    #[test]
    fn test_user_plane_ip_resource_information() {
        let info = UserPlaneIpResourceInformation {
            ipv4: Some(Ipv4Addr::new(192, 0, 2, 10)),
            network_instance: Some(b"internet".to_vec()),
            source_interface: Some(Interface::Access),
            ..Default::default()
        };
        assert_eq!(reencode(&info), info);
    }

    #[test]
    fn test_volume_measurement_totals() {
        let volume = VolumeMeasurement::new(1000, 2500);
        assert_eq!(volume.total, Some(3500));
        let ie = volume.to_ie();
        assert_eq!(ie.payload[0], 0x07);
        assert_eq!(ie.payload.len(), 25);
        assert_eq!(reencode(&volume), volume);
    }

    #[test]
    fn test_cause_values() {
        assert_eq!(PfcpCause::try_from(73).unwrap(), PfcpCause::RuleCreationModificationFailure);
        assert!(PfcpCause::RequestAccepted.is_success());
        assert!(!PfcpCause::NoResourcesAvailable.is_success());
        assert_eq!(PfcpCause::try_from(2), Err(PfcpError::InvalidCause(2)));
    }
}
