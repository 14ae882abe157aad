//! PFCP Information Elements
//!
//! Generic TLV handling. An [`Ie`] keeps its payload as received; grouped IEs
//! are decoded into children on demand and typed values are read through
//! [`IeValue`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PfcpError, PfcpResult};

/// IE type values (TS 29.244 clause 8.1.2) used by the N4 core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum IeType {
    CreatePdr = 1,
    Pdi = 2,
    CreateFar = 3,
    ForwardingParameters = 4,
    CreateQer = 7,
    CreatedPdr = 8,
    UpdatePdr = 9,
    UpdateFar = 10,
    UpdateForwardingParameters = 11,
    UpdateQer = 14,
    RemovePdr = 15,
    RemoveFar = 16,
    RemoveQer = 18,
    Cause = 19,
    SourceInterface = 20,
    FTeid = 21,
    NetworkInstance = 22,
    SdfFilter = 23,
    GateStatus = 25,
    Mbr = 26,
    Precedence = 29,
    TransportLevelMarking = 30,
    ReportType = 39,
    OffendingIe = 40,
    DestinationInterface = 42,
    UpFunctionFeatures = 43,
    ApplyAction = 44,
    DownlinkDataServiceInformation = 45,
    PdrId = 56,
    FSeid = 57,
    NodeId = 60,
    UsageReportTrigger = 63,
    VolumeMeasurement = 66,
    UsageReportSrr = 80,
    UrrId = 81,
    DownlinkDataReport = 83,
    OuterHeaderCreation = 84,
    UeIpAddress = 93,
    OuterHeaderRemoval = 95,
    RecoveryTimeStamp = 96,
    UrSeqn = 104,
    FarId = 108,
    QerId = 109,
    UserPlaneIpResourceInformation = 116,
    Qfi = 124,
}

impl IeType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreatePdr => "Create PDR",
            Self::Pdi => "PDI",
            Self::CreateFar => "Create FAR",
            Self::ForwardingParameters => "Forwarding Parameters",
            Self::CreateQer => "Create QER",
            Self::CreatedPdr => "Created PDR",
            Self::UpdatePdr => "Update PDR",
            Self::UpdateFar => "Update FAR",
            Self::UpdateForwardingParameters => "Update Forwarding Parameters",
            Self::UpdateQer => "Update QER",
            Self::RemovePdr => "Remove PDR",
            Self::RemoveFar => "Remove FAR",
            Self::RemoveQer => "Remove QER",
            Self::Cause => "Cause",
            Self::SourceInterface => "Source Interface",
            Self::FTeid => "F-TEID",
            Self::NetworkInstance => "Network Instance",
            Self::SdfFilter => "SDF Filter",
            Self::GateStatus => "Gate Status",
            Self::Mbr => "MBR",
            Self::Precedence => "Precedence",
            Self::TransportLevelMarking => "Transport Level Marking",
            Self::ReportType => "Report Type",
            Self::OffendingIe => "Offending IE",
            Self::DestinationInterface => "Destination Interface",
            Self::UpFunctionFeatures => "UP Function Features",
            Self::ApplyAction => "Apply Action",
            Self::DownlinkDataServiceInformation => "Downlink Data Service Information",
            Self::PdrId => "PDR ID",
            Self::FSeid => "F-SEID",
            Self::NodeId => "Node ID",
            Self::UsageReportTrigger => "Usage Report Trigger",
            Self::VolumeMeasurement => "Volume Measurement",
            Self::UsageReportSrr => "Usage Report",
            Self::UrrId => "URR ID",
            Self::DownlinkDataReport => "Downlink Data Report",
            Self::OuterHeaderCreation => "Outer Header Creation",
            Self::UeIpAddress => "UE IP Address",
            Self::OuterHeaderRemoval => "Outer Header Removal",
            Self::RecoveryTimeStamp => "Recovery Time Stamp",
            Self::UrSeqn => "UR-SEQN",
            Self::FarId => "FAR ID",
            Self::QerId => "QER ID",
            Self::UserPlaneIpResourceInformation => "User Plane IP Resource Information",
            Self::Qfi => "QFI",
        }
    }
}

/// Type and length octets preceding every IE payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IeHeader {
    pub ie_type: u16,
    pub length: u16,
}

impl IeHeader {
    pub const LEN: usize = 4;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.ie_type);
        buf.put_u16(self.length);
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        if buf.remaining() < Self::LEN {
            return Err(PfcpError::short(Self::LEN, buf.remaining()));
        }
        Ok(Self {
            ie_type: buf.get_u16(),
            length: buf.get_u16(),
        })
    }
}

/// One information element with its undecoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ie {
    pub ie_type: u16,
    pub payload: Bytes,
}

impl Ie {
    pub fn new(ie_type: IeType, payload: impl Into<Bytes>) -> Self {
        Self {
            ie_type: ie_type as u16,
            payload: payload.into(),
        }
    }

    /// Build a grouped IE from its children
    pub fn grouped(ie_type: IeType, children: &[Ie]) -> Self {
        let mut buf = BytesMut::new();
        for child in children {
            child.encode(&mut buf);
        }
        Self::new(ie_type, buf.freeze())
    }

    pub fn is(&self, ie_type: IeType) -> bool {
        self.ie_type == ie_type as u16
    }

    pub fn encoded_len(&self) -> usize {
        IeHeader::LEN + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        IeHeader {
            ie_type: self.ie_type,
            length: self.payload.len() as u16,
        }
        .encode(buf);
        buf.put_slice(&self.payload);
    }

    pub fn decode(buf: &mut Bytes) -> PfcpResult<Self> {
        let header = IeHeader::decode(buf)?;
        let len = header.length as usize;
        if buf.remaining() < len {
            return Err(PfcpError::short(len, buf.remaining()));
        }
        Ok(Self {
            ie_type: header.ie_type,
            payload: buf.split_to(len),
        })
    }

    /// Decode the payload of a grouped IE
    pub fn children(&self) -> PfcpResult<Vec<Ie>> {
        decode_all(self.payload.clone())
    }

    /// Decode the payload as a typed value, checking the IE type first
    pub fn value<T: IeValue>(&self) -> PfcpResult<T> {
        if self.ie_type != T::IE_TYPE as u16 {
            return Err(PfcpError::UnexpectedIe {
                expected: T::IE_TYPE as u16,
                found: self.ie_type,
            });
        }
        T::decode_value(&self.payload)
    }
}

/// Decode a flat sequence of IEs until the buffer is exhausted
pub fn decode_all(mut buf: Bytes) -> PfcpResult<Vec<Ie>> {
    let mut ies = Vec::new();
    while buf.has_remaining() {
        ies.push(Ie::decode(&mut buf)?);
    }
    Ok(ies)
}

pub fn find(ies: &[Ie], ie_type: IeType) -> Option<&Ie> {
    ies.iter().find(|ie| ie.is(ie_type))
}

pub fn find_all(ies: &[Ie], ie_type: IeType) -> impl Iterator<Item = &Ie> {
    ies.iter().filter(move |ie| ie.is(ie_type))
}

/// Decode the first IE carrying `T`, if any
pub fn find_value<T: IeValue>(ies: &[Ie]) -> PfcpResult<Option<T>> {
    find(ies, T::IE_TYPE).map(Ie::value::<T>).transpose()
}

/// Decode a mandatory IE carrying `T`
pub fn require_value<T: IeValue>(ies: &[Ie]) -> PfcpResult<T> {
    find_value(ies)?.ok_or(PfcpError::MissingMandatoryIe(T::IE_TYPE.name()))
}

/// A typed IE payload
pub trait IeValue: Sized {
    const IE_TYPE: IeType;

    fn decode_value(data: &[u8]) -> PfcpResult<Self>;

    fn encode_value(&self, buf: &mut BytesMut);

    fn to_ie(&self) -> Ie {
        let mut buf = BytesMut::new();
        self.encode_value(&mut buf);
        Ie::new(Self::IE_TYPE, buf.freeze())
    }
}

/// Reject a payload shorter than `needed`
pub(crate) fn ensure_len(ie: IeType, data: &[u8], needed: usize) -> PfcpResult<()> {
    if data.len() < needed {
        return Err(PfcpError::malformed(
            ie.name(),
            format!("needs {needed} octets, got {}", data.len()),
        ));
    }
    Ok(())
}

/// Fixed width big-endian integer IEs
macro_rules! integer_ie {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $ie:ident, $width:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub $ty);

        impl IeValue for $name {
            const IE_TYPE: IeType = IeType::$ie;

            fn decode_value(data: &[u8]) -> PfcpResult<Self> {
                ensure_len(IeType::$ie, data, $width)?;
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&data[..std::mem::size_of::<$ty>()]);
                Ok(Self(<$ty>::from_be_bytes(raw)))
            }

            fn encode_value(&self, buf: &mut BytesMut) {
                buf.put_slice(&self.0.to_be_bytes());
            }
        }
    };
}

integer_ie!(PdrId, u16, PdrId, 2);
integer_ie!(FarId, u32, FarId, 4);
integer_ie!(QerId, u32, QerId, 4);
integer_ie!(UrrId, u32, UrrId, 4);
integer_ie!(Precedence, u32, Precedence, 4);
integer_ie!(
    /// Seconds since 1900-01-01 (NTP epoch)
    RecoveryTimeStamp,
    u32,
    RecoveryTimeStamp,
    4
);
integer_ie!(TransportLevelMarking, u16, TransportLevelMarking, 2);
integer_ie!(UrSeqn, u32, UrSeqn, 4);
integer_ie!(OffendingIe, u16, OffendingIe, 2);
