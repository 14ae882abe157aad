//! N4 PFCP Protocol Library
//!
//! PFCP (Packet Forwarding Control Protocol) message building and parsing as
//! specified in 3GPP TS 29.244, restricted to what a UPF needs on N4: node
//! heartbeat and association, session establishment, modification, deletion
//! and session reports.
//!
//! # Example
//!
//! ```rust
//! use n4_pfcp::message::{build_message, parse_message, HeartbeatRequest, PfcpMessage};
//!
//! let msg = PfcpMessage::HeartbeatRequest(HeartbeatRequest::new(3_900_000_000));
//! let mut bytes = build_message(&msg, 1, None).freeze();
//! let (_, decoded) = parse_message(&mut bytes).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod error;
pub mod grouped;
pub mod header;
pub mod ie;
pub mod message;
pub mod types;


pub use error::{PfcpError, PfcpResult};
pub use header::{PfcpHeader, PfcpMessageType, PFCP_HEADER_LEN, PFCP_HEADER_LEN_WITH_SEID};
pub use types::PFCP_UDP_PORT;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{PfcpError, PfcpResult};
    pub use crate::grouped::{
        CreateFar, CreatePdr, CreateQer, CreatedPdr, DownlinkDataReport, ForwardingParameters,
        GroupedIe, Pdi, PdrFields, QerFields, RemoveFar, RemovePdr, RemoveQer, UpdateFar,
        UpdatePdr, UpdateQer, UsageReport,
    };
    pub use crate::header::{PfcpHeader, PfcpMessageType};
    pub use crate::ie::{FarId, Ie, IeType, IeValue, PdrId, Precedence, QerId, UrrId};
    pub use crate::message::{
        build_message, parse_message, AssociationSetupRequest, AssociationSetupResponse,
        HeartbeatRequest, HeartbeatResponse, PfcpMessage, SessionDeletionRequest,
        SessionDeletionResponse, SessionEstablishmentRequest, SessionEstablishmentResponse,
        SessionModificationRequest, SessionModificationResponse, SessionReportRequest,
        SessionReportResponse,
    };
    pub use crate::types::{
        ApplyAction, FSeid, FTeid, GateStatus, Interface, Mbr, NodeId, OuterHeaderCreation,
        PfcpCause, Qfi, ReportType, SdfFilter, UeIpAddress, UpFunctionFeatures,
        UserPlaneIpResourceInformation, VolumeMeasurement,
    };
}
