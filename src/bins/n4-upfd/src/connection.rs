//! PFCP Connection Context
//!
//! Node-level state shared by the handlers, the server loop and the periodic
//! tasks. Each resource sits behind its own lock; the connection itself is
//! shared as `Arc<PfcpConnection>`.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use n4_pfcp::types::{FSeid, NodeId};

use crate::association::NodeAssociation;
use crate::config::UpfConfig;
use crate::error::{UpfError, UpfResult};
use crate::forwarding::ForwardingPlane;
use crate::teid::TeidAllocator;

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Current time as a PFCP Recovery Time Stamp
pub fn recovery_time_stamp_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() + NTP_UNIX_OFFSET) as u32)
        .unwrap_or(0)
}

// ============================================================================
// Peer liveness
// ============================================================================

/// Liveness of the associated SMF
#[derive(Debug, Clone, Default)]
pub struct PeerState {
    pub addr: Option<SocketAddr>,
    /// Heartbeat requests sent since the peer was last heard from
    pub missed: u32,
    pub responsive: bool,
    pub last_seen: Option<Instant>,
}

/// Outcome of sending one heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    /// No peer to probe
    Idle,
    Probe { addr: SocketAddr, missed: u32 },
    /// The peer just crossed the missed-heartbeat limit
    Lost { addr: SocketAddr, missed: u32 },
}

// ============================================================================
// Connection
// ============================================================================

pub struct PfcpConnection {
    node_id: String,
    node_addr: IpAddr,
    n3_address: Ipv4Addr,
    advertised_n3_address: Ipv4Addr,
    recovery_time_stamp: u32,
    association: Mutex<Option<NodeAssociation>>,
    teids: Arc<TeidAllocator>,
    forwarding: Arc<dyn ForwardingPlane>,
    peer: Mutex<PeerState>,
    /// (local SEID, PDR ID) with an outstanding downlink data report
    reported_downlink: Mutex<HashSet<(u64, u16)>>,
    /// UR-SEQN per (local SEID, URR ID)
    ur_seqn: Mutex<HashMap<(u64, u32), u32>>,
    next_sequence: AtomicU32,
}

impl PfcpConnection {
    pub fn new(
        config: &UpfConfig,
        teids: Arc<TeidAllocator>,
        forwarding: Arc<dyn ForwardingPlane>,
    ) -> Self {
        Self {
            node_id: config.node_id(),
            node_addr: config.pfcp.address,
            n3_address: config.n3.address,
            advertised_n3_address: config.advertised_n3_address(),
            recovery_time_stamp: recovery_time_stamp_now(),
            association: Mutex::new(None),
            teids,
            forwarding,
            peer: Mutex::new(PeerState::default()),
            reported_downlink: Mutex::new(HashSet::new()),
            ur_seqn: Mutex::new(HashMap::new()),
            next_sequence: AtomicU32::new(1),
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_config(&self.node_id)
    }

    /// Local N3 address written into FARs
    pub fn n3_address(&self) -> Ipv4Addr {
        self.n3_address
    }

    /// N3 address announced to the SMF
    pub fn advertised_n3_address(&self) -> Ipv4Addr {
        self.advertised_n3_address
    }

    pub fn recovery_time_stamp(&self) -> u32 {
        self.recovery_time_stamp
    }

    /// UP F-SEID for a local SEID
    pub fn up_f_seid(&self, local_seid: u64) -> FSeid {
        match self.node_addr {
            IpAddr::V4(addr) => FSeid::new(local_seid, Some(addr), None),
            IpAddr::V6(addr) => FSeid::new(local_seid, None, Some(addr)),
        }
    }

    pub fn teids(&self) -> &TeidAllocator {
        &self.teids
    }

    pub fn forwarding(&self) -> &dyn ForwardingPlane {
        self.forwarding.as_ref()
    }

    pub fn association(&self) -> UpfResult<MutexGuard<'_, Option<NodeAssociation>>> {
        self.association
            .lock()
            .map_err(|_| UpfError::Internal("association lock poisoned".into()))
    }

    /// Sequence number for a request originated by the UP
    pub fn next_sequence(&self) -> u32 {
        // 24-bit field, 0 is skipped
        let seq = self.next_sequence.fetch_add(1, Ordering::SeqCst) & 0x00FF_FFFF;
        if seq == 0 {
            self.next_sequence.fetch_add(1, Ordering::SeqCst) & 0x00FF_FFFF
        } else {
            seq
        }
    }

    // ========================================================================
    // Peer liveness
    // ========================================================================

    fn peer(&self) -> UpfResult<MutexGuard<'_, PeerState>> {
        self.peer
            .lock()
            .map_err(|_| UpfError::Internal("peer state lock poisoned".into()))
    }

    /// Start tracking a newly associated peer
    pub fn set_peer(&self, addr: SocketAddr) -> UpfResult<()> {
        *self.peer()? = PeerState {
            addr: Some(addr),
            missed: 0,
            responsive: true,
            last_seen: Some(Instant::now()),
        };
        Ok(())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer().ok().and_then(|peer| peer.addr)
    }

    pub fn peer_state(&self) -> UpfResult<PeerState> {
        Ok(self.peer()?.clone())
    }

    /// Any heartbeat message from `addr` proves the associated peer alive
    pub fn peer_alive(&self, addr: SocketAddr) -> UpfResult<()> {
        let mut peer = self.peer()?;
        if peer.addr != Some(addr) {
            return Ok(());
        }
        if !peer.responsive {
            log::info!("PFCP peer {addr} is responsive again");
        }
        peer.missed = 0;
        peer.responsive = true;
        peer.last_seen = Some(Instant::now());
        Ok(())
    }

    /// Account for one heartbeat request about to be sent
    pub fn heartbeat_tick(&self, max_missed: u32) -> UpfResult<HeartbeatTick> {
        let mut peer = self.peer()?;
        let Some(addr) = peer.addr else {
            return Ok(HeartbeatTick::Idle);
        };
        let missed = peer.missed;
        peer.missed = missed.saturating_add(1);
        if peer.responsive && missed > max_missed {
            peer.responsive = false;
            return Ok(HeartbeatTick::Lost { addr, missed });
        }
        Ok(HeartbeatTick::Probe { addr, missed })
    }

    // ========================================================================
    // Report bookkeeping
    // ========================================================================

    /// Record a downlink data report; false if one is already outstanding
    pub fn mark_downlink_reported(&self, local_seid: u64, pdr_id: u16) -> UpfResult<bool> {
        let mut reported = self
            .reported_downlink
            .lock()
            .map_err(|_| UpfError::Internal("report lock poisoned".into()))?;
        Ok(reported.insert((local_seid, pdr_id)))
    }

    pub fn clear_downlink_reported(&self, local_seid: u64, pdr_id: u16) -> UpfResult<()> {
        let mut reported = self
            .reported_downlink
            .lock()
            .map_err(|_| UpfError::Internal("report lock poisoned".into()))?;
        reported.remove(&(local_seid, pdr_id));
        Ok(())
    }

    /// Forget report state of a deleted session
    pub fn clear_session_reports(&self, local_seid: u64) -> UpfResult<()> {
        self.reported_downlink
            .lock()
            .map_err(|_| UpfError::Internal("report lock poisoned".into()))?
            .retain(|(seid, _)| *seid != local_seid);
        self.ur_seqn
            .lock()
            .map_err(|_| UpfError::Internal("report lock poisoned".into()))?
            .retain(|(seid, _), _| *seid != local_seid);
        Ok(())
    }

    /// Next UR-SEQN of a URR, starting at 0
    pub fn next_ur_seqn(&self, local_seid: u64, urr_id: u32) -> UpfResult<u32> {
        let mut seqns = self
            .ur_seqn
            .lock()
            .map_err(|_| UpfError::Internal("report lock poisoned".into()))?;
        let entry = seqns.entry((local_seid, urr_id)).or_insert(0);
        let seqn = *entry;
        *entry = entry.wrapping_add(1);
        Ok(seqn)
    }
}
