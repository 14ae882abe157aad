//! PDR Creation Context
//!
//! Per-request helper that turns Create PDR and Update PDR IEs into
//! [`SPdrInfo`], allocates and releases uplink TEIDs, and mirrors PDRs in the
//! forwarding plane. One context lives for the duration of one PFCP request,
//! so CHOOSE ID sharing and uplink deletion dedup are scoped to that request.

use std::collections::{HashMap, HashSet};

use n4_pfcp::grouped::{Pdi, PdrFields};

use crate::error::{UpfError, UpfResult};
use crate::forwarding::{ForwardingPlane, PdrInfo};
use crate::sdf::{parse_sdf_filter, SdfFilter};
use crate::session::{PdrTarget, SPdrInfo, Session, TeidAllocation};
use crate::teid::{TeidAllocator, TeidOwner};

pub struct PdrCreationContext<'a> {
    local_seid: u64,
    teids: &'a TeidAllocator,
    forwarding: &'a dyn ForwardingPlane,
    /// CHOOSE ID -> TEID chosen earlier in this request
    chosen: HashMap<u8, u32>,
    /// Uplink entries already removed in this request
    deleted_teids: HashSet<u32>,
}

impl<'a> PdrCreationContext<'a> {
    pub fn new(
        local_seid: u64,
        teids: &'a TeidAllocator,
        forwarding: &'a dyn ForwardingPlane,
    ) -> Self {
        Self {
            local_seid,
            teids,
            forwarding,
            chosen: HashMap::new(),
            deleted_teids: HashSet::new(),
        }
    }

    // ========================================================================
    // Extraction
    // ========================================================================

    /// Build the PDR state for a Create PDR
    ///
    /// FAR and QER IDs resolve against the rules already present in `session`;
    /// an ID the session does not know leaves the handle unset.
    pub fn extract(&mut self, session: &Session, fields: &PdrFields) -> UpfResult<SPdrInfo> {
        let mut pdr_info = PdrInfo {
            local_seid: self.local_seid,
            pdr_id: fields.pdr_id,
            ..Default::default()
        };
        read_rule_refs(session, fields, &mut pdr_info);

        let pdi = fields.pdi.as_ref().ok_or(UpfError::MissingPdi)?;
        // Parse before allocating so a bad filter never holds a TEID
        pdr_info.sdf_filter = sdf_from_pdi(pdi)?;
        let target = self.resolve_target(fields.pdr_id, pdi, None)?;

        Ok(SPdrInfo {
            pdr_id: fields.pdr_id,
            pdr_info,
            target,
        })
    }

    /// Re-extract an existing PDR from an Update PDR
    ///
    /// Fields present in the update overwrite. Without a PDI the target and
    /// SDF filter are kept; an uplink PDR asked to CHOOSE again keeps its TEID.
    pub fn update(
        &mut self,
        session: &Session,
        existing: &SPdrInfo,
        fields: &PdrFields,
    ) -> UpfResult<SPdrInfo> {
        let mut updated = existing.clone();
        read_rule_refs(session, fields, &mut updated.pdr_info);

        if let Some(pdi) = &fields.pdi {
            updated.pdr_info.sdf_filter = sdf_from_pdi(pdi)?;
            updated.target = self.resolve_target(existing.pdr_id, pdi, Some(existing.target))?;
        }
        Ok(updated)
    }

    fn resolve_target(
        &mut self,
        pdr_id: u16,
        pdi: &Pdi,
        current: Option<PdrTarget>,
    ) -> UpfResult<PdrTarget> {
        if let Some(f_teid) = &pdi.f_teid {
            let choose = f_teid.choose.ok_or(UpfError::UnsupportedAllocationMode)?;
            if let Some(current @ PdrTarget::Uplink { teid, .. }) = current {
                if let Some(chid) = choose.choose_id {
                    self.chosen.entry(chid).or_insert(teid);
                }
                return Ok(current);
            }
            return self.choose_teid(pdr_id, choose.choose_id);
        }

        if let Some(ue_ip) = &pdi.ue_ip_address {
            if ue_ip.choose_ipv4 {
                return Err(UpfError::UnsupportedUeIpAllocation);
            }
            if let Some(addr) = ue_ip.ipv4 {
                return Ok(PdrTarget::DownlinkV4(addr));
            }
            if let Some(addr) = ue_ip.ipv6 {
                return Ok(PdrTarget::DownlinkV6(addr));
            }
            return Err(UpfError::MissingAddress);
        }

        Err(UpfError::MissingPdi)
    }

    fn choose_teid(&mut self, pdr_id: u16, choose_id: Option<u8>) -> UpfResult<PdrTarget> {
        if let Some(chid) = choose_id {
            if let Some(&teid) = self.chosen.get(&chid) {
                log::debug!("PDR {pdr_id} shares TEID {teid:#x} through CHOOSE ID {chid}");
                return Ok(PdrTarget::Uplink {
                    teid,
                    allocation: TeidAllocation::SharedByChooseId(chid),
                });
            }
        }

        let teid = self
            .teids
            .allocate(TeidOwner::new(self.local_seid, pdr_id))?;
        if let Some(chid) = choose_id {
            self.chosen.insert(chid, teid);
        }
        Ok(PdrTarget::Uplink {
            teid,
            allocation: TeidAllocation::Owned,
        })
    }

    // ========================================================================
    // Forwarding plane
    // ========================================================================

    /// Install a new PDR
    pub fn apply(&self, spdr: &SPdrInfo) -> UpfResult<()> {
        let pdr = &spdr.pdr_info;
        match spdr.target {
            PdrTarget::Uplink { teid, .. } => self.forwarding.put_pdr_uplink(teid, pdr)?,
            PdrTarget::DownlinkV4(addr) => self.forwarding.put_pdr_downlink_v4(addr, pdr)?,
            PdrTarget::DownlinkV6(addr) => self.forwarding.put_pdr_downlink_v6(addr, pdr)?,
        }
        Ok(())
    }

    /// Reprogram a PDR after [`update`](Self::update)
    ///
    /// `session` still holds `old`. A PDR that moved to another target has its
    /// previous entry removed before the new one is installed; if installing
    /// fails after that, the PDR is dropped from `session`.
    pub fn apply_update(
        &mut self,
        session: &mut Session,
        old: &SPdrInfo,
        new: &SPdrInfo,
    ) -> UpfResult<()> {
        if old.target != new.target {
            self.delete(session, old)?;
            if let Err(e) = self.apply(new) {
                session.remove_pdr(old.pdr_id);
                return Err(e);
            }
            return Ok(());
        }

        let pdr = &new.pdr_info;
        match new.target {
            PdrTarget::Uplink { teid, .. } => self.forwarding.update_pdr_uplink(teid, pdr)?,
            PdrTarget::DownlinkV4(addr) => self.forwarding.update_pdr_downlink_v4(addr, pdr)?,
            PdrTarget::DownlinkV6(addr) => self.forwarding.update_pdr_downlink_v6(addr, pdr)?,
        }
        Ok(())
    }

    /// Remove a PDR from the forwarding plane and release its TEID
    ///
    /// An uplink entry stays while another PDR of `session` matches on the
    /// same TEID, and that PDR inherits the allocation if `spdr` held it.
    /// The entry is removed at most once per request.
    pub fn delete(&mut self, session: &mut Session, spdr: &SPdrInfo) -> UpfResult<()> {
        match spdr.target {
            PdrTarget::DownlinkV4(addr) => self.forwarding.delete_pdr_downlink_v4(addr)?,
            PdrTarget::DownlinkV6(addr) => self.forwarding.delete_pdr_downlink_v6(addr)?,
            PdrTarget::Uplink { teid, allocation } => {
                if let Some(heir) = session.teid_sharer(teid, spdr.pdr_id) {
                    log::debug!("TEID {teid:#x} still used in SEID {:#x}", self.local_seid);
                    return self.hand_over_teid(session, teid, spdr.pdr_id, heir);
                }
                if self.deleted_teids.insert(teid) {
                    self.forwarding.delete_pdr_uplink(teid)?;
                }
                self.release_teid(teid, spdr.pdr_id, allocation)?;
            }
        }
        Ok(())
    }

    fn hand_over_teid(
        &self,
        session: &mut Session,
        teid: u32,
        pdr_id: u16,
        heir: u16,
    ) -> UpfResult<()> {
        let from = TeidOwner::new(self.local_seid, pdr_id);
        if self.teids.owner_of(teid)? != Some(from) {
            return Ok(());
        }
        self.teids
            .transfer(from, TeidOwner::new(self.local_seid, heir))?;
        session.take_teid_ownership(heir);
        Ok(())
    }

    /// Give back the TEID of a PDR that was extracted but never stored
    pub fn discard(&mut self, session: &Session, spdr: &SPdrInfo) -> UpfResult<()> {
        if let PdrTarget::Uplink {
            teid,
            allocation: TeidAllocation::Owned,
        } = spdr.target
        {
            if !session.teid_in_use_by_others(teid, spdr.pdr_id) {
                self.teids
                    .release(TeidOwner::new(self.local_seid, spdr.pdr_id))?;
                self.chosen.retain(|_, chosen| *chosen != teid);
            }
        }
        Ok(())
    }

    fn release_teid(&self, teid: u32, pdr_id: u16, allocation: TeidAllocation) -> UpfResult<()> {
        let owner = match allocation {
            TeidAllocation::Owned => TeidOwner::new(self.local_seid, pdr_id),
            // The owning PDR is gone; the allocation still sits under its key
            TeidAllocation::SharedByChooseId(_) => match self.teids.owner_of(teid)? {
                Some(owner) if owner.local_seid == self.local_seid => owner,
                _ => return Ok(()),
            },
        };
        self.teids.release(owner)?;
        Ok(())
    }
}

fn read_rule_refs(session: &Session, fields: &PdrFields, pdr_info: &mut PdrInfo) {
    if let Some(removal) = fields.outer_header_removal {
        pdr_info.outer_header_removal = Some(removal.description);
    }
    if let Some(far_id) = fields.far_id {
        pdr_info.far_handle = session.far_handle(far_id.0);
        if pdr_info.far_handle.is_none() {
            log::debug!("PDR {} references unknown FAR {}", fields.pdr_id, far_id.0);
        }
    }
    if let Some(qer_id) = fields.qer_id {
        pdr_info.qer_handle = session.qer_handle(qer_id.0);
    }
    if let Some(urr_id) = fields.urr_id {
        pdr_info.urr_id = Some(urr_id.0);
    }
}

fn sdf_from_pdi(pdi: &Pdi) -> UpfResult<Option<SdfFilter>> {
    let Some(filter) = &pdi.sdf_filter else {
        return Ok(None);
    };
    match filter.flow_description.as_deref() {
        None | Some("") => {
            log::warn!("SDF filter carries no flow description, ignoring");
            Ok(None)
        }
        Some(description) => parse_sdf_filter(description).map(Some).map_err(|e| {
            log::error!("SDF filter '{description}': {e}");
            e
        }),
    }
}
