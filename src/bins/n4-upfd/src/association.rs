//! PFCP node association with the SMF

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::session::Session;

/// Association with one peer and the sessions established under it
#[derive(Debug, Clone)]
pub struct NodeAssociation {
    pub node_id: String,
    pub peer_addr: SocketAddr,
    pub recovery_time_stamp: Option<u32>,
    next_seid: u64,
    pub sessions: HashMap<u64, Session>,
}

impl NodeAssociation {
    pub fn new(node_id: impl Into<String>, peer_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            peer_addr,
            recovery_time_stamp: None,
            next_seid: 1,
            sessions: HashMap::new(),
        }
    }

    /// Issue a local SEID not held by any live session
    pub fn new_local_seid(&mut self) -> u64 {
        loop {
            let seid = self.next_seid;
            self.next_seid = self.next_seid.wrapping_add(1).max(1);
            if !self.sessions.contains_key(&seid) {
                return seid;
            }
        }
    }

    pub fn session(&self, local_seid: u64) -> Option<&Session> {
        self.sessions.get(&local_seid)
    }

    pub fn session_mut(&mut self, local_seid: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&local_seid)
    }

    pub fn insert_session(&mut self, session: Session) {
        self.sessions.insert(session.local_seid, session);
    }

    pub fn remove_session(&mut self, local_seid: u64) -> Option<Session> {
        self.sessions.remove(&local_seid)
    }
}
