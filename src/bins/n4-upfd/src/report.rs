//! Session Reports towards the SMF
//!
//! Downlink data notifications and periodic usage reports, sent as PFCP
//! Session Report Requests to the associated peer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use n4_pfcp::message::{build_message, PfcpMessage, SessionReportRequest};
use tokio::net::UdpSocket;

use crate::connection::PfcpConnection;
use crate::error::{UpfError, UpfResult};
use crate::n4_build::{build_downlink_data_report, build_usage_report};

/// Sends encoded Session Report Requests
pub trait ReportDispatcher: Send + Sync {
    fn dispatch(&self, peer: SocketAddr, datagram: &[u8]) -> io::Result<()>;
}

/// Sends reports from the PFCP server socket
pub struct UdpReportDispatcher {
    socket: Arc<UdpSocket>,
}

impl UdpReportDispatcher {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl ReportDispatcher for UdpReportDispatcher {
    fn dispatch(&self, peer: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let sent = self.socket.try_send_to(datagram, peer)?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {sent} of {} bytes", datagram.len()),
            ));
        }
        Ok(())
    }
}

pub struct SessionReporter {
    conn: Arc<PfcpConnection>,
    dispatcher: Arc<dyn ReportDispatcher>,
}

impl SessionReporter {
    pub fn new(conn: Arc<PfcpConnection>, dispatcher: Arc<dyn ReportDispatcher>) -> Self {
        Self { conn, dispatcher }
    }

    /// Notify the SMF of buffered downlink data for a PDR
    ///
    /// Returns false when a report for the PDR is already outstanding.
    pub fn report_downlink_data(
        &self,
        local_seid: u64,
        pdr_id: u16,
        qfi: Option<u8>,
    ) -> UpfResult<bool> {
        let (peer, remote_seid) = self.destination(local_seid)?;
        if !self.conn.mark_downlink_reported(local_seid, pdr_id)? {
            log::debug!("Downlink data of session {local_seid:#x} PDR {pdr_id} already reported");
            return Ok(false);
        }
        log::info!("Downlink data report for session {local_seid:#x} PDR {pdr_id}");
        self.send(peer, remote_seid, build_downlink_data_report(pdr_id, qfi));
        Ok(true)
    }

    /// Report the downlink data notifications raised by the forwarding
    /// plane; returns the number of reports sent
    pub fn report_buffered_downlink(&self) -> UpfResult<usize> {
        let events = self.conn.forwarding().take_downlink_events()?;
        let mut sent = 0;
        for event in events {
            match self.report_downlink_data(event.local_seid, event.pdr_id, event.qfi) {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(UpfError::SessionContextNotFound(seid)) => {
                    log::debug!("Downlink data for released session {seid:#x}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Send a periodic usage report for a URR
    pub fn report_usage(
        &self,
        local_seid: u64,
        urr_id: u32,
        uplink_volume: u64,
        downlink_volume: u64,
    ) -> UpfResult<()> {
        let (peer, remote_seid) = self.destination(local_seid)?;
        let seqn = self.conn.next_ur_seqn(local_seid, urr_id)?;
        log::debug!(
            "Usage report for session {local_seid:#x} URR {urr_id}: UL {uplink_volume} DL {downlink_volume}"
        );
        self.send(
            peer,
            remote_seid,
            build_usage_report(urr_id, seqn, uplink_volume, downlink_volume),
        );
        Ok(())
    }

    /// Report the volume counted since the last period for every URR
    /// referenced by a PDR; returns the number of reports sent
    pub fn report_periodic_usage(&self) -> UpfResult<usize> {
        let mut urrs: Vec<(u64, u32)> = {
            let guard = self.conn.association()?;
            let Some(assoc) = guard.as_ref() else {
                return Ok(0);
            };
            assoc
                .sessions
                .values()
                .flat_map(|sess| {
                    sess.pdrs
                        .values()
                        .filter_map(move |pdr| pdr.pdr_info.urr_id.map(|urr| (sess.local_seid, urr)))
                })
                .collect()
        };
        urrs.sort_unstable();
        urrs.dedup();

        let mut sent = 0;
        for (local_seid, urr_id) in urrs {
            let usage = match self.conn.forwarding().take_usage(local_seid, urr_id) {
                Ok(usage) => usage,
                Err(e) => {
                    log::warn!("Usage of session {local_seid:#x} URR {urr_id}: {e}");
                    continue;
                }
            };
            if let Some((uplink, downlink)) = usage {
                self.report_usage(local_seid, urr_id, uplink, downlink)?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Peer address and remote SEID of a session
    fn destination(&self, local_seid: u64) -> UpfResult<(SocketAddr, u64)> {
        let guard = self.conn.association()?;
        let assoc = guard.as_ref().ok_or(UpfError::NoEstablishedAssociation)?;
        let session = assoc
            .session(local_seid)
            .ok_or(UpfError::SessionContextNotFound(local_seid))?;
        Ok((assoc.peer_addr, session.remote_seid))
    }

    fn send(&self, peer: SocketAddr, remote_seid: u64, req: SessionReportRequest) {
        let msg = PfcpMessage::SessionReportRequest(req);
        let datagram = build_message(&msg, self.conn.next_sequence(), Some(remote_seid));
        if let Err(e) = self.dispatcher.dispatch(peer, &datagram) {
            log::warn!("Failed to send Session Report Request to {peer}: {e}");
        }
    }
}
