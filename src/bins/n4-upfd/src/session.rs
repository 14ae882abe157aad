//! PFCP session state
//!
//! Rule tables of one PFCP session and their mirror handles in the forwarding
//! plane. Addresses are owned values copied out of the decoded request.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{UpfError, UpfResult};
use crate::forwarding::{FarInfo, PdrInfo, QerInfo};

/// How a PDR came to hold its uplink TEID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeidAllocation {
    /// Held under this PDR's key, allocated or inherited from a removed
    /// sharer; released when the last PDR using it goes away
    Owned,
    /// Reused from an earlier PDR of the same request with this CHOOSE ID
    SharedByChooseId(u8),
}

/// What a PDR matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdrTarget {
    Uplink { teid: u32, allocation: TeidAllocation },
    DownlinkV4(Ipv4Addr),
    DownlinkV6(Ipv6Addr),
}

impl PdrTarget {
    pub fn teid(&self) -> Option<u32> {
        match self {
            Self::Uplink { teid, .. } => Some(*teid),
            _ => None,
        }
    }

    pub fn is_uplink(&self) -> bool {
        matches!(self, Self::Uplink { .. })
    }
}

/// Resolved state of one PDR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SPdrInfo {
    pub pdr_id: u16,
    pub pdr_info: PdrInfo,
    pub target: PdrTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarEntry {
    pub global_id: u32,
    pub info: FarInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QerEntry {
    pub global_id: u32,
    pub info: QerInfo,
}

/// One PFCP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub local_seid: u64,
    pub remote_seid: u64,
    pub pdrs: HashMap<u16, SPdrInfo>,
    pub fars: HashMap<u32, FarEntry>,
    pub qers: HashMap<u32, QerEntry>,
}

impl Session {
    pub fn new(local_seid: u64, remote_seid: u64) -> Self {
        Self {
            local_seid,
            remote_seid,
            pdrs: HashMap::new(),
            fars: HashMap::new(),
            qers: HashMap::new(),
        }
    }

    // PDR

    pub fn put_pdr(&mut self, spdr: SPdrInfo) {
        self.pdrs.insert(spdr.pdr_id, spdr);
    }

    pub fn pdr(&self, pdr_id: u16) -> UpfResult<&SPdrInfo> {
        self.pdrs.get(&pdr_id).ok_or(UpfError::RuleNotFound {
            kind: "PDR",
            id: u32::from(pdr_id),
        })
    }

    pub fn remove_pdr(&mut self, pdr_id: u16) -> Option<SPdrInfo> {
        self.pdrs.remove(&pdr_id)
    }

    /// A PDR other than `pdr_id` matches on `teid`
    pub fn teid_in_use_by_others(&self, teid: u32, pdr_id: u16) -> bool {
        self.teid_sharer(teid, pdr_id).is_some()
    }

    /// Lowest PDR ID other than `pdr_id` matching on `teid`
    pub fn teid_sharer(&self, teid: u32, pdr_id: u16) -> Option<u16> {
        self.pdrs
            .values()
            .filter(|pdr| pdr.pdr_id != pdr_id && pdr.target.teid() == Some(teid))
            .map(|pdr| pdr.pdr_id)
            .min()
    }

    /// Record that `pdr_id` now holds the allocation of its uplink TEID
    pub fn take_teid_ownership(&mut self, pdr_id: u16) {
        if let Some(SPdrInfo {
            target: PdrTarget::Uplink { allocation, .. },
            ..
        }) = self.pdrs.get_mut(&pdr_id)
        {
            *allocation = TeidAllocation::Owned;
        }
    }

    // FAR

    pub fn new_far(&mut self, far_id: u32, global_id: u32, info: FarInfo) {
        self.fars.insert(far_id, FarEntry { global_id, info });
    }

    pub fn far(&self, far_id: u32) -> UpfResult<&FarEntry> {
        self.fars
            .get(&far_id)
            .ok_or(UpfError::RuleNotFound { kind: "FAR", id: far_id })
    }

    pub fn update_far(&mut self, far_id: u32, info: FarInfo) -> UpfResult<FarEntry> {
        let entry = self
            .fars
            .get_mut(&far_id)
            .ok_or(UpfError::RuleNotFound { kind: "FAR", id: far_id })?;
        entry.info = info;
        Ok(*entry)
    }

    pub fn remove_far(&mut self, far_id: u32) -> UpfResult<FarEntry> {
        self.fars
            .remove(&far_id)
            .ok_or(UpfError::RuleNotFound { kind: "FAR", id: far_id })
    }

    pub fn far_handle(&self, far_id: u32) -> Option<u32> {
        self.fars.get(&far_id).map(|far| far.global_id)
    }

    // QER

    pub fn new_qer(&mut self, qer_id: u32, global_id: u32, info: QerInfo) {
        self.qers.insert(qer_id, QerEntry { global_id, info });
    }

    pub fn qer(&self, qer_id: u32) -> UpfResult<&QerEntry> {
        self.qers
            .get(&qer_id)
            .ok_or(UpfError::RuleNotFound { kind: "QER", id: qer_id })
    }

    pub fn update_qer(&mut self, qer_id: u32, info: QerInfo) -> UpfResult<QerEntry> {
        let entry = self
            .qers
            .get_mut(&qer_id)
            .ok_or(UpfError::RuleNotFound { kind: "QER", id: qer_id })?;
        entry.info = info;
        Ok(*entry)
    }

    pub fn remove_qer(&mut self, qer_id: u32) -> UpfResult<QerEntry> {
        self.qers
            .remove(&qer_id)
            .ok_or(UpfError::RuleNotFound { kind: "QER", id: qer_id })
    }

    pub fn qer_handle(&self, qer_id: u32) -> Option<u32> {
        self.qers.get(&qer_id).map(|qer| qer.global_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uplink(pdr_id: u16, teid: u32) -> SPdrInfo {
        SPdrInfo {
            pdr_id,
            pdr_info: PdrInfo::default(),
            target: PdrTarget::Uplink {
                teid,
                allocation: TeidAllocation::Owned,
            },
        }
    }

    #[test]
    fn test_rule_tables() {
        let mut sess = Session::new(1, 0x100);
        sess.new_far(1, 11, FarInfo::new(Ipv4Addr::LOCALHOST));
        sess.new_qer(2, 22, QerInfo::default());

        assert_eq!(sess.far_handle(1), Some(11));
        assert_eq!(sess.qer_handle(2), Some(22));
        assert_eq!(sess.far_handle(9), None);

        let mut info = FarInfo::new(Ipv4Addr::LOCALHOST);
        info.teid = 5;
        assert_eq!(sess.update_far(1, info).unwrap().info.teid, 5);
        assert!(matches!(
            sess.update_far(3, info),
            Err(UpfError::RuleNotFound { kind: "FAR", id: 3 })
        ));
        assert_eq!(sess.remove_qer(2).unwrap().global_id, 22);
        assert!(sess.remove_qer(2).is_err());
    }

    #[test]
    fn test_teid_in_use() {
        let mut sess = Session::new(1, 1);
        sess.put_pdr(uplink(1, 7));
        sess.put_pdr(uplink(2, 7));
        assert!(sess.teid_in_use_by_others(7, 1));
        assert!(sess.teid_in_use_by_others(7, 2));

        sess.remove_pdr(1);
        assert!(!sess.teid_in_use_by_others(7, 2));
        assert!(sess.teid_in_use_by_others(7, 1));
        sess.remove_pdr(2);
        assert!(!sess.teid_in_use_by_others(7, 1));
        assert!(sess.pdr(2).is_err());
    }

    #[test]
    fn test_teid_sharer_takes_ownership() {
        let mut sess = Session::new(1, 1);
        sess.put_pdr(uplink(1, 7));
        for pdr_id in [5, 3] {
            let mut shared = uplink(pdr_id, 7);
            shared.target = PdrTarget::Uplink {
                teid: 7,
                allocation: TeidAllocation::SharedByChooseId(2),
            };
            sess.put_pdr(shared);
        }
        assert_eq!(sess.teid_sharer(7, 1), Some(3));
        assert_eq!(sess.teid_sharer(8, 1), None);

        sess.take_teid_ownership(3);
        assert!(matches!(
            sess.pdr(3).unwrap().target,
            PdrTarget::Uplink { allocation: TeidAllocation::Owned, .. }
        ));
        assert!(matches!(
            sess.pdr(5).unwrap().target,
            PdrTarget::Uplink { allocation: TeidAllocation::SharedByChooseId(2), .. }
        ));
    }

    #[test]
    fn test_target_accessors() {
        let up = uplink(1, 9).target;
        assert_eq!(up.teid(), Some(9));
        assert!(up.is_uplink());
        let down = PdrTarget::DownlinkV4(Ipv4Addr::new(10, 45, 0, 2));
        assert_eq!(down.teid(), None);
        assert!(!down.is_uplink());
    }
}
