//! Grouped IEs
//!
//! Rule and report IEs that carry other IEs. Optional children stay optional
//! here even where TS 29.244 marks them mandatory; the session layer decides
//! what a missing child means.

use crate::error::{PfcpError, PfcpResult};
use crate::ie::{
    find, find_value, require_value, FarId, Ie, IeType, IeValue, PdrId, Precedence, QerId,
    TransportLevelMarking, UrSeqn, UrrId,
};
use crate::types::{
    ApplyAction, DestinationInterface, DownlinkDataServiceInformation, FTeid, GateStatus, Mbr,
    NetworkInstance, OuterHeaderCreation, OuterHeaderRemoval, Qfi, SdfFilter, SourceInterface,
    UeIpAddress, UsageReportTrigger, VolumeMeasurement,
};

/// A grouped IE decoded from and encoded to its children
pub trait GroupedIe: Sized {
    const IE_TYPE: IeType;

    fn from_children(children: &[Ie]) -> PfcpResult<Self>;

    fn children(&self) -> Vec<Ie>;

    fn from_ie(ie: &Ie) -> PfcpResult<Self> {
        if !ie.is(Self::IE_TYPE) {
            return Err(PfcpError::UnexpectedIe {
                expected: Self::IE_TYPE as u16,
                found: ie.ie_type,
            });
        }
        Self::from_children(&ie.children()?)
    }

    fn to_ie(&self) -> Ie {
        Ie::grouped(Self::IE_TYPE, &self.children())
    }
}

/// Decode the first grouped IE of type `T`, if any
pub fn find_group<T: GroupedIe>(ies: &[Ie]) -> PfcpResult<Option<T>> {
    find(ies, T::IE_TYPE).map(T::from_ie).transpose()
}

fn push<T: IeValue>(out: &mut Vec<Ie>, value: &Option<T>) {
    if let Some(value) = value {
        out.push(value.to_ie());
    }
}

// ============================================================================
// PDR
// ============================================================================

/// Packet Detection Information
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pdi {
    pub source_interface: Option<SourceInterface>,
    pub f_teid: Option<FTeid>,
    pub network_instance: Option<NetworkInstance>,
    pub ue_ip_address: Option<UeIpAddress>,
    pub sdf_filter: Option<SdfFilter>,
}

impl GroupedIe for Pdi {
    const IE_TYPE: IeType = IeType::Pdi;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            source_interface: find_value(children)?,
            f_teid: find_value(children)?,
            network_instance: find_value(children)?,
            ue_ip_address: find_value(children)?,
            sdf_filter: find_value(children)?,
        })
    }

    fn children(&self) -> Vec<Ie> {
        let mut out = Vec::new();
        push(&mut out, &self.source_interface);
        push(&mut out, &self.f_teid);
        push(&mut out, &self.network_instance);
        push(&mut out, &self.ue_ip_address);
        push(&mut out, &self.sdf_filter);
        out
    }
}

/// Fields shared by Create PDR and Update PDR
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PdrFields {
    pub pdr_id: u16,
    pub precedence: Option<Precedence>,
    pub pdi: Option<Pdi>,
    pub outer_header_removal: Option<OuterHeaderRemoval>,
    pub far_id: Option<FarId>,
    pub urr_id: Option<UrrId>,
    pub qer_id: Option<QerId>,
}

impl PdrFields {
    fn decode(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            pdr_id: require_value::<PdrId>(children)?.0,
            precedence: find_value(children)?,
            pdi: find_group(children)?,
            outer_header_removal: find_value(children)?,
            far_id: find_value(children)?,
            urr_id: find_value(children)?,
            qer_id: find_value(children)?,
        })
    }

    fn encode(&self) -> Vec<Ie> {
        let mut out = vec![PdrId(self.pdr_id).to_ie()];
        push(&mut out, &self.precedence);
        if let Some(pdi) = &self.pdi {
            out.push(pdi.to_ie());
        }
        push(&mut out, &self.outer_header_removal);
        push(&mut out, &self.far_id);
        push(&mut out, &self.urr_id);
        push(&mut out, &self.qer_id);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreatePdr(pub PdrFields);

impl GroupedIe for CreatePdr {
    const IE_TYPE: IeType = IeType::CreatePdr;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        PdrFields::decode(children).map(Self)
    }

    fn children(&self) -> Vec<Ie> {
        self.0.encode()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdatePdr(pub PdrFields);

impl GroupedIe for UpdatePdr {
    const IE_TYPE: IeType = IeType::UpdatePdr;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        PdrFields::decode(children).map(Self)
    }

    fn children(&self) -> Vec<Ie> {
        self.0.encode()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovePdr {
    pub pdr_id: u16,
}

impl GroupedIe for RemovePdr {
    const IE_TYPE: IeType = IeType::RemovePdr;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            pdr_id: require_value::<PdrId>(children)?.0,
        })
    }

    fn children(&self) -> Vec<Ie> {
        vec![PdrId(self.pdr_id).to_ie()]
    }
}

/// Created PDR reported back to the CP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPdr {
    pub pdr_id: u16,
    pub f_teid: Option<FTeid>,
    pub ue_ip_address: Option<UeIpAddress>,
}

impl GroupedIe for CreatedPdr {
    const IE_TYPE: IeType = IeType::CreatedPdr;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            pdr_id: require_value::<PdrId>(children)?.0,
            f_teid: find_value(children)?,
            ue_ip_address: find_value(children)?,
        })
    }

    fn children(&self) -> Vec<Ie> {
        let mut out = vec![PdrId(self.pdr_id).to_ie()];
        push(&mut out, &self.f_teid);
        push(&mut out, &self.ue_ip_address);
        out
    }
}

// ============================================================================
// FAR
// ============================================================================

/// Forwarding Parameters, also used for Update Forwarding Parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForwardingParameters {
    pub destination_interface: Option<DestinationInterface>,
    pub network_instance: Option<NetworkInstance>,
    pub outer_header_creation: Option<OuterHeaderCreation>,
    pub transport_level_marking: Option<TransportLevelMarking>,
}

impl GroupedIe for ForwardingParameters {
    const IE_TYPE: IeType = IeType::ForwardingParameters;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            destination_interface: find_value(children)?,
            network_instance: find_value(children)?,
            outer_header_creation: find_value(children)?,
            transport_level_marking: find_value(children)?,
        })
    }

    fn children(&self) -> Vec<Ie> {
        let mut out = Vec::new();
        push(&mut out, &self.destination_interface);
        push(&mut out, &self.network_instance);
        push(&mut out, &self.outer_header_creation);
        push(&mut out, &self.transport_level_marking);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateFar {
    pub far_id: u32,
    pub apply_action: Option<ApplyAction>,
    pub forwarding_parameters: Option<ForwardingParameters>,
}

impl GroupedIe for CreateFar {
    const IE_TYPE: IeType = IeType::CreateFar;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            far_id: require_value::<FarId>(children)?.0,
            apply_action: find_value(children)?,
            forwarding_parameters: find_group(children)?,
        })
    }

    fn children(&self) -> Vec<Ie> {
        let mut out = vec![FarId(self.far_id).to_ie()];
        push(&mut out, &self.apply_action);
        if let Some(params) = &self.forwarding_parameters {
            out.push(params.to_ie());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateFar {
    pub far_id: u32,
    pub apply_action: Option<ApplyAction>,
    pub update_forwarding_parameters: Option<ForwardingParameters>,
}

impl GroupedIe for UpdateFar {
    const IE_TYPE: IeType = IeType::UpdateFar;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        let update_forwarding_parameters = find(children, IeType::UpdateForwardingParameters)
            .map(|ie| ForwardingParameters::from_children(&ie.children()?))
            .transpose()?;
        Ok(Self {
            far_id: require_value::<FarId>(children)?.0,
            apply_action: find_value(children)?,
            update_forwarding_parameters,
        })
    }

    fn children(&self) -> Vec<Ie> {
        let mut out = vec![FarId(self.far_id).to_ie()];
        push(&mut out, &self.apply_action);
        if let Some(params) = &self.update_forwarding_parameters {
            out.push(Ie::grouped(IeType::UpdateForwardingParameters, &params.children()));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveFar {
    pub far_id: u32,
}

impl GroupedIe for RemoveFar {
    const IE_TYPE: IeType = IeType::RemoveFar;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            far_id: require_value::<FarId>(children)?.0,
        })
    }

    fn children(&self) -> Vec<Ie> {
        vec![FarId(self.far_id).to_ie()]
    }
}

// ============================================================================
// QER
// ============================================================================

/// Fields shared by Create QER and Update QER
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QerFields {
    pub qer_id: u32,
    pub gate_status: Option<GateStatus>,
    pub mbr: Option<Mbr>,
    pub qfi: Option<Qfi>,
}

impl QerFields {
    fn decode(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            qer_id: require_value::<QerId>(children)?.0,
            gate_status: find_value(children)?,
            mbr: find_value(children)?,
            qfi: find_value(children)?,
        })
    }

    fn encode(&self) -> Vec<Ie> {
        let mut out = vec![QerId(self.qer_id).to_ie()];
        push(&mut out, &self.gate_status);
        push(&mut out, &self.mbr);
        push(&mut out, &self.qfi);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateQer(pub QerFields);

impl GroupedIe for CreateQer {
    const IE_TYPE: IeType = IeType::CreateQer;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        QerFields::decode(children).map(Self)
    }

    fn children(&self) -> Vec<Ie> {
        self.0.encode()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateQer(pub QerFields);

impl GroupedIe for UpdateQer {
    const IE_TYPE: IeType = IeType::UpdateQer;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        QerFields::decode(children).map(Self)
    }

    fn children(&self) -> Vec<Ie> {
        self.0.encode()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveQer {
    pub qer_id: u32,
}

impl GroupedIe for RemoveQer {
    const IE_TYPE: IeType = IeType::RemoveQer;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            qer_id: require_value::<QerId>(children)?.0,
        })
    }

    fn children(&self) -> Vec<Ie> {
        vec![QerId(self.qer_id).to_ie()]
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Usage Report carried in a Session Report Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageReport {
    pub urr_id: u32,
    pub ur_seqn: u32,
    pub trigger: UsageReportTrigger,
    pub volume_measurement: Option<VolumeMeasurement>,
}

impl GroupedIe for UsageReport {
    const IE_TYPE: IeType = IeType::UsageReportSrr;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            urr_id: require_value::<UrrId>(children)?.0,
            ur_seqn: require_value::<UrSeqn>(children)?.0,
            trigger: require_value(children)?,
            volume_measurement: find_value(children)?,
        })
    }

    fn children(&self) -> Vec<Ie> {
        let mut out = vec![
            UrrId(self.urr_id).to_ie(),
            UrSeqn(self.ur_seqn).to_ie(),
            self.trigger.to_ie(),
        ];
        push(&mut out, &self.volume_measurement);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownlinkDataReport {
    pub pdr_id: u16,
    pub service_information: Option<DownlinkDataServiceInformation>,
}

impl GroupedIe for DownlinkDataReport {
    const IE_TYPE: IeType = IeType::DownlinkDataReport;

    fn from_children(children: &[Ie]) -> PfcpResult<Self> {
        Ok(Self {
            pdr_id: require_value::<PdrId>(children)?.0,
            service_information: find_value(children)?,
        })
    }

    fn children(&self) -> Vec<Ie> {
        let mut out = vec![PdrId(self.pdr_id).to_ie()];
        push(&mut out, &self.service_information);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Interface;
    use std::net::Ipv4Addr;

    fn uplink_pdr() -> CreatePdr {
        CreatePdr(PdrFields {
            pdr_id: 1,
            precedence: Some(Precedence(255)),
            pdi: Some(Pdi {
                source_interface: Some(SourceInterface(Interface::Access)),
                f_teid: Some(FTeid::choose(true, false, Some(1))),
                sdf_filter: Some(SdfFilter::with_flow_description(
                    "permit out ip from any to assigned",
                )),
                ..Default::default()
            }),
            outer_header_removal: Some(OuterHeaderRemoval::default()),
            far_id: Some(FarId(1)),
            qer_id: Some(QerId(1)),
            ..Default::default()
        })
    }

    #[test]
    fn test_create_pdr_children() {
        let pdr = uplink_pdr();
        let ie = pdr.to_ie();
        assert!(ie.is(IeType::CreatePdr));
        let decoded = CreatePdr::from_ie(&ie).unwrap();
        assert_eq!(decoded, pdr);
        let pdi = decoded.0.pdi.unwrap();
        assert_eq!(pdi.f_teid.unwrap().choose.unwrap().choose_id, Some(1));
    }

    #[test]
    fn test_create_pdr_without_pdi() {
        let ie = Ie::grouped(IeType::CreatePdr, &[PdrId(4).to_ie(), FarId(2).to_ie()]);
        let decoded = CreatePdr::from_ie(&ie).unwrap();
        assert_eq!(decoded.0.pdr_id, 4);
        assert!(decoded.0.pdi.is_none());
    }

    #[test]
    fn test_create_pdr_requires_id() {
        let ie = Ie::grouped(IeType::CreatePdr, &[FarId(2).to_ie()]);
        assert_eq!(
            CreatePdr::from_ie(&ie),
            Err(PfcpError::MissingMandatoryIe("PDR ID"))
        );
    }

    #[test]
    fn test_update_far_uses_update_forwarding_parameters() {
        let far = UpdateFar {
            far_id: 9,
            apply_action: Some(ApplyAction::forward()),
            update_forwarding_parameters: Some(ForwardingParameters {
                outer_header_creation: Some(OuterHeaderCreation::gtpu_ipv4(
                    77,
                    Ipv4Addr::new(10, 0, 0, 5),
                )),
                ..Default::default()
            }),
        };
        let ie = far.to_ie();
        let children = ie.children().unwrap();
        assert!(find(&children, IeType::UpdateForwardingParameters).is_some());
        assert!(find(&children, IeType::ForwardingParameters).is_none());
        assert_eq!(UpdateFar::from_ie(&ie).unwrap(), far);
    }

    #[test]
    fn test_wrong_group_type() {
        let ie = RemoveFar { far_id: 1 }.to_ie();
        assert!(matches!(
            RemovePdr::from_ie(&ie),
            Err(PfcpError::UnexpectedIe { .. })
        ));
    }

    #[test]
    fn test_usage_report_children() {
        let report = UsageReport {
            urr_id: 3,
            ur_seqn: 12,
            trigger: UsageReportTrigger::periodic(),
            volume_measurement: Some(VolumeMeasurement::new(10, 20)),
        };
        let decoded = UsageReport::from_ie(&report.to_ie()).unwrap();
        assert_eq!(decoded, report);
        assert!(decoded.trigger.is_periodic());
    }
}
