//! UPF PFCP Path
//!
//! UDP server for N4, request dispatch, and the periodic heartbeat and usage
//! report tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use n4_pfcp::header::{PfcpHeader, PfcpMessageType};
use n4_pfcp::message::{
    build_message, split_message, PfcpMessage, SessionDeletionResponse,
    SessionModificationResponse,
};
use n4_pfcp::types::PfcpCause;
use tokio::net::UdpSocket;

use crate::connection::{HeartbeatTick, PfcpConnection};
use crate::error::UpfResult;
use crate::n4_build::{
    build_association_setup_response, build_heartbeat_request, build_session_establishment_reject,
};
use crate::n4_handler::{
    handle_association_setup_request, handle_heartbeat_request, handle_heartbeat_response,
    handle_session_deletion_request, handle_session_establishment_request,
    handle_session_modification_request, handle_session_report_response,
};
use crate::report::SessionReporter;

/// Largest datagram read from the socket
const MAX_DATAGRAM_LEN: usize = 65_535;

/// Receive timeout used to poll the shutdown flag
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often downlink data notifications are collected
pub const DOWNLINK_EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Dispatch
// ============================================================================

/// Handle one datagram to completion; returns the encoded response, if any
pub fn dispatch(conn: &PfcpConnection, data: &[u8], peer: SocketAddr) -> Option<BytesMut> {
    let mut buf = Bytes::copy_from_slice(data);
    let (header, mut body) = match split_message(&mut buf) {
        Ok(parts) => parts,
        Err(e) => {
            log::warn!("Dropping PFCP datagram from {peer}: {e}");
            return None;
        }
    };
    log::debug!(
        "PFCP {} from {peer}, seq={}, seid={:?}",
        header.message_type.name(),
        header.sequence_number,
        header.seid
    );

    let message = match PfcpMessage::decode_body(header.message_type, &mut body) {
        Ok(message) => message,
        Err(e) => {
            log::info!("Malformed {} from {peer}: {e}", header.message_type.name());
            return malformed_response(conn, &header);
        }
    };

    let seq = header.sequence_number;
    let local_seid = header.seid.unwrap_or(0);
    let (response, seid) = match message {
        PfcpMessage::HeartbeatRequest(req) => (
            PfcpMessage::HeartbeatResponse(handle_heartbeat_request(conn, &req, peer)),
            None,
        ),
        PfcpMessage::HeartbeatResponse(_) => {
            handle_heartbeat_response(conn, peer);
            return None;
        }
        PfcpMessage::AssociationSetupRequest(req) => (
            PfcpMessage::AssociationSetupResponse(handle_association_setup_request(
                conn, &req, peer,
            )),
            None,
        ),
        PfcpMessage::SessionEstablishmentRequest(req) => {
            let reply = handle_session_establishment_request(conn, &req, peer);
            (
                PfcpMessage::SessionEstablishmentResponse(reply.message),
                Some(reply.seid),
            )
        }
        PfcpMessage::SessionModificationRequest(req) => {
            let reply = handle_session_modification_request(conn, local_seid, &req, peer);
            (
                PfcpMessage::SessionModificationResponse(reply.message),
                Some(reply.seid),
            )
        }
        PfcpMessage::SessionDeletionRequest(_) => {
            let reply = handle_session_deletion_request(conn, local_seid, peer);
            (
                PfcpMessage::SessionDeletionResponse(reply.message),
                Some(reply.seid),
            )
        }
        PfcpMessage::SessionReportResponse(rsp) => {
            handle_session_report_response(&rsp, peer);
            return None;
        }
        other => {
            log::warn!(
                "Unhandled PFCP message {} from {peer}",
                other.message_type().name()
            );
            return None;
        }
    };

    Some(build_message(&response, seq, seid))
}

/// Answer a request whose body failed to decode
fn malformed_response(conn: &PfcpConnection, header: &PfcpHeader) -> Option<BytesMut> {
    let cause = PfcpCause::MandatoryIeMissing;
    let (response, seid) = match header.message_type {
        PfcpMessageType::AssociationSetupRequest => (
            PfcpMessage::AssociationSetupResponse(build_association_setup_response(conn, cause)),
            None,
        ),
        PfcpMessageType::SessionEstablishmentRequest => (
            PfcpMessage::SessionEstablishmentResponse(build_session_establishment_reject(
                conn, cause,
            )),
            Some(0),
        ),
        PfcpMessageType::SessionModificationRequest => (
            PfcpMessage::SessionModificationResponse(SessionModificationResponse::new(cause)),
            Some(0),
        ),
        PfcpMessageType::SessionDeletionRequest => (
            PfcpMessage::SessionDeletionResponse(SessionDeletionResponse::new(cause)),
            Some(0),
        ),
        // Heartbeat Response has no cause, responses get no answer
        _ => return None,
    };
    Some(build_message(&response, header.sequence_number, seid))
}

// ============================================================================
// Server
// ============================================================================

pub struct PfcpServer {
    socket: Arc<UdpSocket>,
    conn: Arc<PfcpConnection>,
    shutdown: Arc<AtomicBool>,
}

impl PfcpServer {
    /// Create a new PFCP server
    pub async fn new(
        local_addr: SocketAddr,
        conn: Arc<PfcpConnection>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, io::Error> {
        let socket = UdpSocket::bind(local_addr).await?;
        log::info!("PFCP server bound to {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            conn,
            shutdown,
        })
    }

    /// Socket shared with the heartbeat task and the report dispatcher
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the PFCP server main loop
    pub async fn run(&self) -> Result<(), io::Error> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        log::info!("PFCP server starting main loop");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                log::info!("PFCP server shutting down");
                break;
            }

            // Use timeout to check shutdown periodically
            let recv_result =
                tokio::time::timeout(RECV_POLL_INTERVAL, self.socket.recv_from(&mut buf)).await;

            match recv_result {
                Ok(Ok((len, src_addr))) => {
                    log::debug!("PFCP received {len} bytes from {src_addr}");
                    if let Some(response) = dispatch(&self.conn, &buf[..len], src_addr) {
                        if let Err(e) = self.socket.send_to(&response, src_addr).await {
                            log::error!("PFCP send to {src_addr} failed: {e}");
                        }
                    }
                }
                Ok(Err(e)) => {
                    log::error!("PFCP socket error: {e}");
                }
                Err(_) => {
                    // Timeout - continue loop
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Periodic tasks
// ============================================================================

/// Account for one heartbeat interval; returns the request to send, if any
pub fn heartbeat_step(
    conn: &PfcpConnection,
    max_missed: u32,
) -> UpfResult<Option<(SocketAddr, BytesMut)>> {
    let addr = match conn.heartbeat_tick(max_missed)? {
        HeartbeatTick::Idle => return Ok(None),
        HeartbeatTick::Probe { addr, missed } => {
            if missed > 0 {
                log::debug!("PFCP peer {addr}: {missed} heartbeats unanswered");
            }
            addr
        }
        HeartbeatTick::Lost { addr, missed } => {
            log::warn!("PFCP peer {addr} missed {missed} heartbeats, marking unresponsive");
            addr
        }
    };
    let request = PfcpMessage::HeartbeatRequest(build_heartbeat_request(conn));
    Ok(Some((addr, build_message(&request, conn.next_sequence(), None))))
}

/// Send a Heartbeat Request to the associated peer every `interval`
pub async fn run_heartbeat(
    conn: Arc<PfcpConnection>,
    socket: Arc<UdpSocket>,
    interval: Duration,
    max_missed: u32,
    shutdown: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match heartbeat_step(&conn, max_missed) {
            Ok(Some((addr, request))) => {
                if let Err(e) = socket.send_to(&request, addr).await {
                    log::warn!("Heartbeat to {addr} failed: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => log::error!("Heartbeat: {e}"),
        }
    }
    log::debug!("Heartbeat task finished");
}

/// Send usage reports every `interval`
pub async fn run_usage_reports(
    reporter: Arc<SessionReporter>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match reporter.report_periodic_usage() {
            Ok(0) => {}
            Ok(sent) => log::debug!("Sent {sent} usage reports"),
            Err(e) => log::error!("Usage reports: {e}"),
        }
    }
    log::debug!("Usage report task finished");
}

/// Forward downlink data notifications from the forwarding plane every
/// `interval`
pub async fn run_downlink_reports(
    reporter: Arc<SessionReporter>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match reporter.report_buffered_downlink() {
            Ok(0) => {}
            Ok(sent) => log::debug!("Sent {sent} downlink data reports"),
            Err(e) => log::error!("Downlink data reports: {e}"),
        }
    }
    log::debug!("Downlink data report task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpfConfig;
    use crate::association::NodeAssociation;
    use crate::forwarding::{DownlinkDataEvent, InMemoryForwardingPlane};
    use crate::report::UdpReportDispatcher;
    use crate::session::Session;
    use crate::teid::TeidAllocator;
    use bytes::BufMut;
    use n4_pfcp::message::{
        parse_message, AssociationSetupRequest, HeartbeatRequest, SessionReportResponse,
    };
    use n4_pfcp::types::NodeId;
    use std::net::Ipv4Addr;

    fn conn() -> Arc<PfcpConnection> {
        Arc::new(PfcpConnection::new(
            &UpfConfig::default(),
            Arc::new(TeidAllocator::new(16).unwrap()),
            Arc::new(InMemoryForwardingPlane::new()),
        ))
    }

    fn smf() -> SocketAddr {
        "10.0.0.1:8805".parse().unwrap()
    }

    fn decode(datagram: BytesMut) -> (PfcpHeader, PfcpMessage) {
        parse_message(&mut datagram.freeze()).unwrap()
    }

    fn associate(conn: &PfcpConnection) {
        let req = PfcpMessage::AssociationSetupRequest(AssociationSetupRequest::new(
            &NodeId::Ipv4(Ipv4Addr::new(10, 0, 0, 1)),
            3_900_000_000,
        ));
        dispatch(conn, &build_message(&req, 1, None), smf()).unwrap();
    }

    #[test]
    fn test_heartbeat_request_answered() {
        let conn = conn();
        let req = PfcpMessage::HeartbeatRequest(HeartbeatRequest::new(3_900_000_000));
        let rsp = dispatch(&conn, &build_message(&req, 42, None), smf()).unwrap();

        let (header, msg) = decode(rsp);
        assert_eq!(header.sequence_number, 42);
        assert_eq!(header.seid, None);
        match msg {
            PfcpMessage::HeartbeatResponse(rsp) => {
                assert_eq!(rsp.recovery_time_stamp, conn.recovery_time_stamp())
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_garbage_dropped() {
        let conn = conn();
        assert!(dispatch(&conn, &[0xFF, 0x00], smf()).is_none());
        assert!(dispatch(&conn, &[], smf()).is_none());
    }

    #[test]
    fn test_malformed_body_answered() {
        let conn = conn();
        // Node ID IE announcing 10 octets, carrying 1
        let body = [0x00, 0x3C, 0x00, 0x0A, 0x00];
        let mut header = PfcpHeader::new(PfcpMessageType::AssociationSetupRequest, 7);
        header.length = (body.len() + header.header_len() - 4) as u16;
        let mut datagram = BytesMut::new();
        header.encode(&mut datagram);
        datagram.put_slice(&body);

        let rsp = dispatch(&conn, &datagram, smf()).unwrap();
        let (header, msg) = decode(rsp);
        assert_eq!(header.sequence_number, 7);
        match msg {
            PfcpMessage::AssociationSetupResponse(rsp) => {
                assert_eq!(rsp.cause, PfcpCause::MandatoryIeMissing)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(conn.association().unwrap().is_none());
    }

    #[test]
    fn test_session_request_on_unknown_seid() {
        let conn = conn();
        associate(&conn);
        let req = PfcpMessage::SessionDeletionRequest(Default::default());
        let rsp = dispatch(&conn, &build_message(&req, 9, Some(77)), smf()).unwrap();
        let (header, msg) = decode(rsp);
        assert_eq!(header.seid, Some(0));
        match msg {
            PfcpMessage::SessionDeletionResponse(rsp) => {
                assert_eq!(rsp.cause, PfcpCause::SessionContextNotFound)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_report_response_not_answered() {
        let conn = conn();
        let rsp = PfcpMessage::SessionReportResponse(SessionReportResponse::new(
            PfcpCause::RequestAccepted,
        ));
        assert!(dispatch(&conn, &build_message(&rsp, 3, Some(1)), smf()).is_none());
    }

    #[test]
    fn test_heartbeat_step() {
        let conn = conn();
        assert!(heartbeat_step(&conn, 1).unwrap().is_none());

        associate(&conn);
        let (addr, request) = heartbeat_step(&conn, 1).unwrap().unwrap();
        assert_eq!(addr, smf());
        let (_, msg) = decode(request);
        assert!(matches!(msg, PfcpMessage::HeartbeatRequest(_)));

        heartbeat_step(&conn, 1).unwrap();
        heartbeat_step(&conn, 1).unwrap();
        assert!(!conn.peer_state().unwrap().responsive);

        // The answer brings the peer back
        let rsp = PfcpMessage::HeartbeatResponse(n4_pfcp::message::HeartbeatResponse::new(1));
        assert!(dispatch(&conn, &build_message(&rsp, 5, None), smf()).is_none());
        assert!(conn.peer_state().unwrap().responsive);
    }

    #[tokio::test]
    async fn test_server_answers_over_udp() {
        let conn = conn();
        let shutdown = Arc::new(AtomicBool::new(false));
        let server = PfcpServer::new("127.0.0.1:0".parse().unwrap(), conn, shutdown.clone())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move { server.run().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let req = PfcpMessage::HeartbeatRequest(HeartbeatRequest::new(3_900_000_000));
        client
            .send_to(&build_message(&req, 11, None), server_addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (header, msg) = parse_message(&mut Bytes::copy_from_slice(&buf[..len])).unwrap();
        assert_eq!(header.sequence_number, 11);
        assert!(matches!(msg, PfcpMessage::HeartbeatResponse(_)));

        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_downlink_events_reach_the_peer() {
        let fp = Arc::new(InMemoryForwardingPlane::new());
        let conn = Arc::new(PfcpConnection::new(
            &UpfConfig::default(),
            Arc::new(TeidAllocator::new(16).unwrap()),
            fp.clone(),
        ));
        let smf = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut assoc = NodeAssociation::new("10.0.0.1", smf.local_addr().unwrap());
        assoc.insert_session(Session::new(1, 0xABC));
        *conn.association().unwrap() = Some(assoc);

        let upf = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let reporter = Arc::new(SessionReporter::new(
            conn,
            Arc::new(UdpReportDispatcher::new(upf)),
        ));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_downlink_reports(
            reporter,
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        fp.buffer_downlink(DownlinkDataEvent {
            local_seid: 1,
            pdr_id: 2,
            qfi: None,
        });
        let mut buf = vec![0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), smf.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (header, msg) = parse_message(&mut Bytes::copy_from_slice(&buf[..len])).unwrap();
        assert_eq!(header.seid, Some(0xABC));
        assert!(matches!(msg, PfcpMessage::SessionReportRequest(_)));

        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap();
    }
}
