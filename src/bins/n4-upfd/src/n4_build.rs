//! UPF N4 (PFCP) Message Building
//!
//! Response and report messages sent by the UPF, and the conversion of FAR
//! and QER IEs into forwarding-plane descriptors.

use std::net::Ipv4Addr;

use n4_pfcp::grouped::{
    CreatedPdr, DownlinkDataReport, ForwardingParameters, QerFields, UsageReport,
};
use n4_pfcp::message::{
    AssociationSetupResponse, HeartbeatRequest, HeartbeatResponse, SessionDeletionResponse,
    SessionEstablishmentResponse, SessionModificationResponse, SessionReportRequest,
};
use n4_pfcp::types::{
    ApplyAction, DownlinkDataServiceInformation, FTeid, PfcpCause, UpFunctionFeatures,
    UsageReportTrigger, UserPlaneIpResourceInformation, VolumeMeasurement,
};

use crate::connection::PfcpConnection;
use crate::error::{UpfError, UpfResult};
use crate::forwarding::{FarInfo, QerInfo};
use crate::session::SPdrInfo;

// ============================================================================
// Node messages
// ============================================================================

/// Build Heartbeat Request
pub fn build_heartbeat_request(conn: &PfcpConnection) -> HeartbeatRequest {
    HeartbeatRequest::new(conn.recovery_time_stamp())
}

/// Build Heartbeat Response
pub fn build_heartbeat_response(conn: &PfcpConnection) -> HeartbeatResponse {
    HeartbeatResponse::new(conn.recovery_time_stamp())
}

/// Build Association Setup Response
///
/// An accepted setup announces F-TEID allocation by the UP and the N3
/// address the SMF should hand to the RAN.
pub fn build_association_setup_response(
    conn: &PfcpConnection,
    cause: PfcpCause,
) -> AssociationSetupResponse {
    let mut rsp = AssociationSetupResponse::new(conn.node_id(), cause);
    rsp.recovery_time_stamp = Some(conn.recovery_time_stamp());
    if cause.is_success() {
        rsp.up_function_features = Some(UpFunctionFeatures(UpFunctionFeatures::FTUP));
        rsp.user_plane_ip_resource_information =
            vec![UserPlaneIpResourceInformation::ipv4(conn.advertised_n3_address())];
    }
    rsp
}

// ============================================================================
// Session messages
// ============================================================================

/// Created PDR IEs for every uplink PDR created in this request
pub fn build_created_pdrs(created: &[SPdrInfo], n3_address: Ipv4Addr) -> Vec<CreatedPdr> {
    created
        .iter()
        .filter_map(|spdr| {
            spdr.target.teid().map(|teid| CreatedPdr {
                pdr_id: spdr.pdr_id,
                f_teid: Some(FTeid::ipv4(teid, n3_address)),
                ue_ip_address: None,
            })
        })
        .collect()
}

/// Build Session Establishment Response
pub fn build_session_establishment_response(
    conn: &PfcpConnection,
    local_seid: u64,
    created: &[SPdrInfo],
) -> SessionEstablishmentResponse {
    let mut rsp = SessionEstablishmentResponse::new(conn.node_id(), PfcpCause::RequestAccepted);
    rsp.up_f_seid = Some(conn.up_f_seid(local_seid));
    rsp.created_pdr = build_created_pdrs(created, conn.advertised_n3_address());
    rsp
}

/// Build a rejecting Session Establishment Response
pub fn build_session_establishment_reject(
    conn: &PfcpConnection,
    cause: PfcpCause,
) -> SessionEstablishmentResponse {
    SessionEstablishmentResponse::new(conn.node_id(), cause)
}

/// Build Session Modification Response
pub fn build_session_modification_response(
    conn: &PfcpConnection,
    created: &[SPdrInfo],
) -> SessionModificationResponse {
    let mut rsp = SessionModificationResponse::new(PfcpCause::RequestAccepted);
    rsp.created_pdr = build_created_pdrs(created, conn.advertised_n3_address());
    rsp
}

/// Build Session Deletion Response
pub fn build_session_deletion_response(cause: PfcpCause) -> SessionDeletionResponse {
    SessionDeletionResponse::new(cause)
}

// ============================================================================
// Session reports
// ============================================================================

/// Build Session Report Request for downlink data
pub fn build_downlink_data_report(pdr_id: u16, qfi: Option<u8>) -> SessionReportRequest {
    SessionReportRequest::downlink_data(DownlinkDataReport {
        pdr_id,
        service_information: qfi.map(|qfi| DownlinkDataServiceInformation {
            paging_policy_indication: None,
            qfi: Some(qfi),
        }),
    })
}

/// Build periodic Session Report Request for usage
pub fn build_usage_report(
    urr_id: u32,
    ur_seqn: u32,
    uplink_volume: u64,
    downlink_volume: u64,
) -> SessionReportRequest {
    SessionReportRequest::usage(UsageReport {
        urr_id,
        ur_seqn,
        trigger: UsageReportTrigger::periodic(),
        volume_measurement: Some(VolumeMeasurement::new(uplink_volume, downlink_volume)),
    })
}

// ============================================================================
// Rule conversion
// ============================================================================

/// Merge Create FAR / Update FAR contents into `far`
///
/// The local IP is always the N3 address. Outer header creation towards an
/// IPv6 peer is rejected.
pub fn compose_far_info(
    mut far: FarInfo,
    apply_action: Option<ApplyAction>,
    forwarding: Option<&ForwardingParameters>,
    local_ip: Ipv4Addr,
) -> UpfResult<FarInfo> {
    far.local_ip = local_ip;
    if let Some(action) = apply_action {
        far.action = action.0;
    }

    if let Some(params) = forwarding {
        match &params.outer_header_creation {
            Some(ohc) => {
                if ohc.has_ipv6() {
                    log::warn!("IPv6 outer header creation is not supported");
                    return Err(UpfError::UnsupportedOuterHeaderCreation);
                }
                far.outer_header_creation = (ohc.description >> 8) as u8;
                far.teid = ohc.teid.unwrap_or(0);
                if ohc.has_ipv4() {
                    far.remote_ip = ohc.ipv4;
                }
            }
            None => log::debug!("No outer header creation in forwarding parameters"),
        }
        if let Some(tlm) = params.transport_level_marking {
            far.transport_level_marking = tlm.0;
        }
    }
    Ok(far)
}

/// Merge Create QER / Update QER contents into `qer`; MBR goes from kbit/s
/// to bit/s
pub fn compose_qer_info(mut qer: QerInfo, fields: &QerFields) -> QerInfo {
    if let Some(gate) = fields.gate_status {
        qer.gate_status_ul = gate.uplink;
        qer.gate_status_dl = gate.downlink;
    }
    if let Some(mbr) = fields.mbr {
        qer.max_bitrate_ul = mbr.uplink.saturating_mul(1000);
        qer.max_bitrate_dl = mbr.downlink.saturating_mul(1000);
    }
    if let Some(qfi) = fields.qfi {
        qer.qfi = qfi.0;
    }
    qer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpfConfig;
    use crate::forwarding::{InMemoryForwardingPlane, PdrInfo};
    use crate::session::{PdrTarget, TeidAllocation};
    use crate::teid::TeidAllocator;
    use n4_pfcp::ie::TransportLevelMarking;
    use n4_pfcp::types::{GateStatus, Mbr, OuterHeaderCreation, Qfi};
    use std::sync::Arc;

    fn conn() -> PfcpConnection {
        let mut config = UpfConfig::default();
        config.n3.advertised_address = Some(Ipv4Addr::new(203, 0, 113, 1));
        PfcpConnection::new(
            &config,
            Arc::new(TeidAllocator::new(16).unwrap()),
            Arc::new(InMemoryForwardingPlane::new()),
        )
    }

    #[test]
    fn test_association_setup_response() {
        let conn = conn();
        let rsp = build_association_setup_response(&conn, PfcpCause::RequestAccepted);
        assert_eq!(rsp.cause, PfcpCause::RequestAccepted);
        assert!(rsp
            .up_function_features
            .is_some_and(|f| f.supports(UpFunctionFeatures::FTUP)));
        assert_eq!(rsp.user_plane_ip_resource_information.len(), 1);
        assert_eq!(
            rsp.user_plane_ip_resource_information[0].ipv4,
            Some(Ipv4Addr::new(203, 0, 113, 1))
        );

        let rsp = build_association_setup_response(&conn, PfcpCause::MandatoryIeMissing);
        assert!(rsp.up_function_features.is_none());
        assert!(rsp.user_plane_ip_resource_information.is_empty());
    }

    #[test]
    fn test_created_pdrs_use_advertised_address() {
        let conn = conn();
        let created = vec![
            SPdrInfo {
                pdr_id: 1,
                pdr_info: PdrInfo::default(),
                target: PdrTarget::Uplink {
                    teid: 5,
                    allocation: TeidAllocation::Owned,
                },
            },
            SPdrInfo {
                pdr_id: 2,
                pdr_info: PdrInfo::default(),
                target: PdrTarget::DownlinkV4(Ipv4Addr::new(10, 45, 0, 2)),
            },
        ];
        let rsp = build_session_establishment_response(&conn, 7, &created);
        assert_eq!(rsp.up_f_seid.map(|f| f.seid), Some(7));
        assert_eq!(rsp.created_pdr.len(), 1);
        assert_eq!(rsp.created_pdr[0].pdr_id, 1);
        assert_eq!(
            rsp.created_pdr[0].f_teid,
            Some(FTeid::ipv4(5, Ipv4Addr::new(203, 0, 113, 1)))
        );
    }

    #[test]
    fn test_compose_far_info() {
        let local = Ipv4Addr::new(192, 168, 1, 10);
        let params = ForwardingParameters {
            outer_header_creation: Some(OuterHeaderCreation::gtpu_ipv4(
                0x100,
                Ipv4Addr::new(192, 168, 1, 20),
            )),
            transport_level_marking: Some(TransportLevelMarking(0x2E00)),
            ..Default::default()
        };
        let far = compose_far_info(
            FarInfo::new(Ipv4Addr::UNSPECIFIED),
            Some(ApplyAction::forward()),
            Some(&params),
            local,
        )
        .unwrap();
        assert_eq!(far.action, ApplyAction::FORW);
        assert_eq!(far.outer_header_creation, 1);
        assert_eq!(far.teid, 0x100);
        assert_eq!(far.remote_ip, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(far.local_ip, local);
        assert_eq!(far.transport_level_marking, 0x2E00);

        // An update without forwarding parameters keeps the tunnel
        let updated = compose_far_info(far, Some(ApplyAction(ApplyAction::DROP)), None, local)
            .unwrap();
        assert_eq!(updated.action, ApplyAction::DROP);
        assert_eq!(updated.teid, 0x100);
    }

    #[test]
    fn test_compose_far_rejects_ipv6_tunnel() {
        let params = ForwardingParameters {
            outer_header_creation: Some(OuterHeaderCreation {
                description: OuterHeaderCreation::GTPU_UDP_IPV6,
                teid: Some(1),
                ipv6: Some("2001:db8::1".parse().unwrap()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            compose_far_info(
                FarInfo::new(Ipv4Addr::LOCALHOST),
                None,
                Some(&params),
                Ipv4Addr::LOCALHOST
            ),
            Err(UpfError::UnsupportedOuterHeaderCreation)
        ));
    }

    #[test]
    fn test_compose_qer_info() {
        let fields = QerFields {
            qer_id: 1,
            gate_status: Some(GateStatus {
                uplink: GateStatus::OPEN,
                downlink: GateStatus::CLOSED,
            }),
            mbr: Some(Mbr {
                uplink: 100_000,
                downlink: 200_000,
            }),
            qfi: Some(Qfi(9)),
        };
        let qer = compose_qer_info(QerInfo::default(), &fields);
        assert_eq!(qer.gate_status_dl, GateStatus::CLOSED);
        assert_eq!(qer.max_bitrate_ul, 100_000_000);
        assert_eq!(qer.max_bitrate_dl, 200_000_000);
        assert_eq!(qer.qfi, 9);

        // Absent fields keep earlier values
        let update = QerFields {
            qer_id: 1,
            qfi: Some(Qfi(5)),
            ..Default::default()
        };
        let qer = compose_qer_info(qer, &update);
        assert_eq!(qer.qfi, 5);
        assert_eq!(qer.max_bitrate_dl, 200_000_000);
    }

    #[test]
    fn test_report_builders() {
        let req = build_downlink_data_report(3, Some(9));
        let report = req.downlink_data_report.unwrap();
        assert_eq!(report.pdr_id, 3);
        assert_eq!(report.service_information.and_then(|s| s.qfi), Some(9));

        let req = build_usage_report(4, 2, 100, 50);
        assert_eq!(req.usage_report[0].ur_seqn, 2);
        assert!(req.usage_report[0].trigger.is_periodic());
        assert_eq!(
            req.usage_report[0].volume_measurement.and_then(|v| v.total),
            Some(150)
        );
    }
}
