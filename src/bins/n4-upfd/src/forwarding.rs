//! Forwarding-plane programming interface
//!
//! The packet processing datapath is reached only through [`ForwardingPlane`].
//! [`InMemoryForwardingPlane`] keeps the tables in process memory; it backs
//! control-plane-only deployments and tests.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::sdf::SdfFilter;

/// Errors reported by the forwarding plane
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardingError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("rejected by forwarding plane: {0}")]
    Rejected(String),
}

pub type ForwardingResult<T> = Result<T, ForwardingError>;

// ============================================================================
// Rule descriptors
// ============================================================================

/// PDR as programmed into the datapath
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PdrInfo {
    pub local_seid: u64,
    pub pdr_id: u16,
    pub outer_header_removal: Option<u8>,
    /// Global FAR handle, `None` when the PDR names no FAR or an unknown one
    pub far_handle: Option<u32>,
    pub qer_handle: Option<u32>,
    pub urr_id: Option<u32>,
    pub sdf_filter: Option<SdfFilter>,
}

/// FAR as programmed into the datapath
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarInfo {
    pub action: u8,
    /// Outer header creation description, upper octet
    pub outer_header_creation: u8,
    pub teid: u32,
    pub remote_ip: Option<Ipv4Addr>,
    pub local_ip: Ipv4Addr,
    pub transport_level_marking: u16,
}

impl FarInfo {
    pub fn new(local_ip: Ipv4Addr) -> Self {
        Self {
            action: 0,
            outer_header_creation: 0,
            teid: 0,
            remote_ip: None,
            local_ip,
            transport_level_marking: 0,
        }
    }
}

/// QER as programmed into the datapath
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QerInfo {
    pub gate_status_ul: u8,
    pub gate_status_dl: u8,
    pub qfi: u8,
    /// bit/s
    pub max_bitrate_ul: u64,
    pub max_bitrate_dl: u64,
}

/// Downlink packet that found its session without a downlink tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownlinkDataEvent {
    pub local_seid: u64,
    pub pdr_id: u16,
    pub qfi: Option<u8>,
}

// ============================================================================
// Interface
// ============================================================================

pub trait ForwardingPlane: Send + Sync {
    fn put_pdr_uplink(&self, teid: u32, pdr: &PdrInfo) -> ForwardingResult<()>;
    fn update_pdr_uplink(&self, teid: u32, pdr: &PdrInfo) -> ForwardingResult<()>;
    fn delete_pdr_uplink(&self, teid: u32) -> ForwardingResult<()>;

    fn put_pdr_downlink_v4(&self, ue_addr: Ipv4Addr, pdr: &PdrInfo) -> ForwardingResult<()>;
    fn update_pdr_downlink_v4(&self, ue_addr: Ipv4Addr, pdr: &PdrInfo) -> ForwardingResult<()>;
    fn delete_pdr_downlink_v4(&self, ue_addr: Ipv4Addr) -> ForwardingResult<()>;

    fn put_pdr_downlink_v6(&self, ue_addr: Ipv6Addr, pdr: &PdrInfo) -> ForwardingResult<()>;
    fn update_pdr_downlink_v6(&self, ue_addr: Ipv6Addr, pdr: &PdrInfo) -> ForwardingResult<()>;
    fn delete_pdr_downlink_v6(&self, ue_addr: Ipv6Addr) -> ForwardingResult<()>;

    /// Install a FAR and return its global handle
    fn new_far(&self, far: &FarInfo) -> ForwardingResult<u32>;
    fn update_far(&self, handle: u32, far: &FarInfo) -> ForwardingResult<()>;
    fn delete_far(&self, handle: u32) -> ForwardingResult<()>;

    /// Install a QER and return its global handle
    fn new_qer(&self, qer: &QerInfo) -> ForwardingResult<u32>;
    fn update_qer(&self, handle: u32, qer: &QerInfo) -> ForwardingResult<()>;
    fn delete_qer(&self, handle: u32) -> ForwardingResult<()>;

    /// Volume counted for a URR since the last call, as (uplink, downlink)
    /// octets. Datapaths without usage counters report nothing.
    fn take_usage(&self, _local_seid: u64, _urr_id: u32) -> ForwardingResult<Option<(u64, u64)>> {
        Ok(None)
    }

    /// Downlink data notifications raised since the last call
    fn take_downlink_events(&self) -> ForwardingResult<Vec<DownlinkDataEvent>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Operations that can be made to fail on [`InMemoryForwardingPlane`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardingOp {
    PutPdr,
    UpdatePdr,
    DeletePdr,
    NewFar,
    UpdateFar,
    DeleteFar,
    NewQer,
    UpdateQer,
    DeleteQer,
}

#[derive(Debug, Default)]
struct Tables {
    uplink: HashMap<u32, PdrInfo>,
    downlink_v4: HashMap<Ipv4Addr, PdrInfo>,
    downlink_v6: HashMap<Ipv6Addr, PdrInfo>,
    fars: HashMap<u32, FarInfo>,
    qers: HashMap<u32, QerInfo>,
    next_far_handle: u32,
    next_qer_handle: u32,
    /// (local SEID, URR ID) -> (uplink, downlink) octets
    usage: HashMap<(u64, u32), (u64, u64)>,
    downlink_events: Vec<DownlinkDataEvent>,
    rejected: HashSet<ForwardingOp>,
}

impl Tables {
    fn check(&self, op: ForwardingOp) -> ForwardingResult<()> {
        if self.rejected.contains(&op) {
            return Err(ForwardingError::Rejected(format!("{op:?}")));
        }
        Ok(())
    }
}

fn update_existing<K, V>(map: &mut HashMap<K, V>, key: K, value: V, what: String) -> ForwardingResult<()>
where
    K: std::hash::Hash + Eq,
{
    match map.get_mut(&key) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(ForwardingError::NotFound(what)),
    }
}

fn remove_existing<K, V>(map: &mut HashMap<K, V>, key: &K, what: String) -> ForwardingResult<()>
where
    K: std::hash::Hash + Eq,
{
    map.remove(key)
        .map(|_| ())
        .ok_or(ForwardingError::NotFound(what))
}

/// Forwarding tables kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryForwardingPlane {
    tables: Mutex<Tables>,
}

impl InMemoryForwardingPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> ForwardingResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| ForwardingError::Rejected("forwarding tables lock poisoned".into()))
    }

    /// Make every subsequent `op` fail with [`ForwardingError::Rejected`]
    pub fn reject(&self, op: ForwardingOp) {
        if let Ok(mut tables) = self.tables() {
            tables.rejected.insert(op);
        }
    }

    pub fn accept(&self, op: ForwardingOp) {
        if let Ok(mut tables) = self.tables() {
            tables.rejected.remove(&op);
        }
    }

    pub fn uplink_pdr(&self, teid: u32) -> Option<PdrInfo> {
        self.tables().ok()?.uplink.get(&teid).cloned()
    }

    pub fn downlink_pdr_v4(&self, ue_addr: Ipv4Addr) -> Option<PdrInfo> {
        self.tables().ok()?.downlink_v4.get(&ue_addr).cloned()
    }

    pub fn downlink_pdr_v6(&self, ue_addr: Ipv6Addr) -> Option<PdrInfo> {
        self.tables().ok()?.downlink_v6.get(&ue_addr).cloned()
    }

    pub fn far(&self, handle: u32) -> Option<FarInfo> {
        self.tables().ok()?.fars.get(&handle).copied()
    }

    pub fn qer(&self, handle: u32) -> Option<QerInfo> {
        self.tables().ok()?.qers.get(&handle).copied()
    }

    /// Account traffic against a URR
    pub fn add_usage(&self, local_seid: u64, urr_id: u32, uplink: u64, downlink: u64) {
        if let Ok(mut tables) = self.tables() {
            let counters = tables.usage.entry((local_seid, urr_id)).or_insert((0, 0));
            counters.0 = counters.0.saturating_add(uplink);
            counters.1 = counters.1.saturating_add(downlink);
        }
    }

    /// Raise a downlink data notification
    pub fn buffer_downlink(&self, event: DownlinkDataEvent) {
        if let Ok(mut tables) = self.tables() {
            tables.downlink_events.push(event);
        }
    }

    /// (PDRs, FARs, QERs) currently installed
    pub fn counts(&self) -> (usize, usize, usize) {
        match self.tables() {
            Ok(t) => (
                t.uplink.len() + t.downlink_v4.len() + t.downlink_v6.len(),
                t.fars.len(),
                t.qers.len(),
            ),
            Err(_) => (0, 0, 0),
        }
    }
}

impl ForwardingPlane for InMemoryForwardingPlane {
    fn put_pdr_uplink(&self, teid: u32, pdr: &PdrInfo) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::PutPdr)?;
        log::debug!("Put PDR {} uplink TEID {teid:#x}", pdr.pdr_id);
        t.uplink.insert(teid, pdr.clone());
        Ok(())
    }

    fn update_pdr_uplink(&self, teid: u32, pdr: &PdrInfo) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::UpdatePdr)?;
        update_existing(&mut t.uplink, teid, pdr.clone(), format!("uplink PDR TEID {teid:#x}"))
    }

    fn delete_pdr_uplink(&self, teid: u32) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::DeletePdr)?;
        log::debug!("Delete PDR uplink TEID {teid:#x}");
        remove_existing(&mut t.uplink, &teid, format!("uplink PDR TEID {teid:#x}"))
    }

    fn put_pdr_downlink_v4(&self, ue_addr: Ipv4Addr, pdr: &PdrInfo) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::PutPdr)?;
        log::debug!("Put PDR {} downlink {ue_addr}", pdr.pdr_id);
        t.downlink_v4.insert(ue_addr, pdr.clone());
        Ok(())
    }

    fn update_pdr_downlink_v4(&self, ue_addr: Ipv4Addr, pdr: &PdrInfo) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::UpdatePdr)?;
        update_existing(&mut t.downlink_v4, ue_addr, pdr.clone(), format!("downlink PDR {ue_addr}"))
    }

    fn delete_pdr_downlink_v4(&self, ue_addr: Ipv4Addr) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::DeletePdr)?;
        log::debug!("Delete PDR downlink {ue_addr}");
        remove_existing(&mut t.downlink_v4, &ue_addr, format!("downlink PDR {ue_addr}"))
    }

    fn put_pdr_downlink_v6(&self, ue_addr: Ipv6Addr, pdr: &PdrInfo) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::PutPdr)?;
        log::debug!("Put PDR {} downlink {ue_addr}", pdr.pdr_id);
        t.downlink_v6.insert(ue_addr, pdr.clone());
        Ok(())
    }

    fn update_pdr_downlink_v6(&self, ue_addr: Ipv6Addr, pdr: &PdrInfo) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::UpdatePdr)?;
        update_existing(&mut t.downlink_v6, ue_addr, pdr.clone(), format!("downlink PDR {ue_addr}"))
    }

    fn delete_pdr_downlink_v6(&self, ue_addr: Ipv6Addr) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::DeletePdr)?;
        remove_existing(&mut t.downlink_v6, &ue_addr, format!("downlink PDR {ue_addr}"))
    }

    fn new_far(&self, far: &FarInfo) -> ForwardingResult<u32> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::NewFar)?;
        t.next_far_handle += 1;
        let handle = t.next_far_handle;
        t.fars.insert(handle, *far);
        Ok(handle)
    }

    fn update_far(&self, handle: u32, far: &FarInfo) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::UpdateFar)?;
        update_existing(&mut t.fars, handle, *far, format!("FAR handle {handle}"))
    }

    fn delete_far(&self, handle: u32) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::DeleteFar)?;
        remove_existing(&mut t.fars, &handle, format!("FAR handle {handle}"))
    }

    fn new_qer(&self, qer: &QerInfo) -> ForwardingResult<u32> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::NewQer)?;
        t.next_qer_handle += 1;
        let handle = t.next_qer_handle;
        t.qers.insert(handle, *qer);
        Ok(handle)
    }

    fn update_qer(&self, handle: u32, qer: &QerInfo) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::UpdateQer)?;
        update_existing(&mut t.qers, handle, *qer, format!("QER handle {handle}"))
    }

    fn delete_qer(&self, handle: u32) -> ForwardingResult<()> {
        let mut t = self.tables()?;
        t.check(ForwardingOp::DeleteQer)?;
        remove_existing(&mut t.qers, &handle, format!("QER handle {handle}"))
    }

    fn take_usage(&self, local_seid: u64, urr_id: u32) -> ForwardingResult<Option<(u64, u64)>> {
        Ok(self.tables()?.usage.remove(&(local_seid, urr_id)))
    }

    fn take_downlink_events(&self) -> ForwardingResult<Vec<DownlinkDataEvent>> {
        let mut tables = self.tables()?;
        Ok(std::mem::take(&mut tables.downlink_events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_far_handles_are_distinct() {
        let fp = InMemoryForwardingPlane::new();
        let far = FarInfo::new(Ipv4Addr::new(192, 0, 2, 1));
        let a = fp.new_far(&far).unwrap();
        let b = fp.new_far(&far).unwrap();
        assert_ne!(a, b);
        assert_eq!(fp.counts(), (0, 2, 0));

        fp.delete_far(a).unwrap();
        assert!(fp.far(a).is_none());
        assert!(matches!(fp.delete_far(a), Err(ForwardingError::NotFound(_))));
    }

    #[test]
    fn test_update_requires_existing_entry() {
        let fp = InMemoryForwardingPlane::new();
        let pdr = PdrInfo {
            pdr_id: 1,
            ..Default::default()
        };
        assert!(fp.update_pdr_uplink(7, &pdr).is_err());
        fp.put_pdr_uplink(7, &pdr).unwrap();
        fp.update_pdr_uplink(7, &pdr).unwrap();
        assert_eq!(fp.uplink_pdr(7), Some(pdr));
    }

    #[test]
    fn test_rejection_injection() {
        let fp = InMemoryForwardingPlane::new();
        fp.reject(ForwardingOp::NewQer);
        assert!(matches!(
            fp.new_qer(&QerInfo::default()),
            Err(ForwardingError::Rejected(_))
        ));
        fp.accept(ForwardingOp::NewQer);
        assert!(fp.new_qer(&QerInfo::default()).is_ok());
    }

    #[test]
    fn test_downlink_tables() {
        let fp = InMemoryForwardingPlane::new();
        let v4 = Ipv4Addr::new(10, 45, 0, 2);
        let v6: Ipv6Addr = "2001:db8::2".parse().unwrap();
        fp.put_pdr_downlink_v4(v4, &PdrInfo::default()).unwrap();
        fp.put_pdr_downlink_v6(v6, &PdrInfo::default()).unwrap();
        assert_eq!(fp.counts().0, 2);
        fp.delete_pdr_downlink_v4(v4).unwrap();
        fp.delete_pdr_downlink_v6(v6).unwrap();
        assert!(fp.downlink_pdr_v4(v4).is_none());
        assert_eq!(fp.counts(), (0, 0, 0));
    }

    #[test]
    fn test_usage_counters_reset_on_take() {
        let fp = InMemoryForwardingPlane::new();
        assert_eq!(fp.take_usage(1, 1).unwrap(), None);
        fp.add_usage(1, 1, 100, 200);
        fp.add_usage(1, 1, 1, 2);
        assert_eq!(fp.take_usage(1, 1).unwrap(), Some((101, 202)));
        assert_eq!(fp.take_usage(1, 1).unwrap(), None);
    }

    #[test]
    fn test_downlink_events_drained() {
        let fp = InMemoryForwardingPlane::new();
        assert!(fp.take_downlink_events().unwrap().is_empty());
        let event = DownlinkDataEvent {
            local_seid: 3,
            pdr_id: 2,
            qfi: Some(9),
        };
        fp.buffer_downlink(event);
        assert_eq!(fp.take_downlink_events().unwrap(), vec![event]);
        assert!(fp.take_downlink_events().unwrap().is_empty());
    }
}
