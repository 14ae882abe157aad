//! UPF N4 (PFCP) Message Handling
//!
//! Node and session request handlers. Every handler answers with a
//! well-formed response; failures are turned into a cause through
//! [`UpfError::cause`].

use std::net::SocketAddr;

use n4_pfcp::grouped::{
    CreateFar, CreatePdr, CreateQer, GroupedIe, RemoveFar, RemovePdr, RemoveQer, UpdateFar,
    UpdatePdr, UpdateQer,
};
use n4_pfcp::ie::{Ie, IeValue};
use n4_pfcp::message::{
    AssociationSetupRequest, AssociationSetupResponse, HeartbeatRequest, HeartbeatResponse,
    SessionDeletionResponse, SessionEstablishmentRequest, SessionEstablishmentResponse,
    SessionModificationRequest, SessionModificationResponse, SessionReportResponse,
};
use n4_pfcp::types::{FSeid, NodeId, PfcpCause};

use crate::association::NodeAssociation;
use crate::connection::PfcpConnection;
use crate::error::{UpfError, UpfResult};
use crate::forwarding::{FarInfo, QerInfo};
use crate::n4_build::{
    build_association_setup_response, build_heartbeat_response,
    build_session_deletion_response, build_session_establishment_reject,
    build_session_establishment_response, build_session_modification_response, compose_far_info,
    compose_qer_info,
};
use crate::pdr_context::PdrCreationContext;
use crate::session::{SPdrInfo, Session};

/// Session response and the SEID for its header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReply<T> {
    /// Remote SEID of the session, 0 when the session is unknown
    pub seid: u64,
    pub message: T,
}

impl<T> SessionReply<T> {
    fn new(seid: u64, message: T) -> Self {
        Self { seid, message }
    }
}

/// Decode a mandatory IE; absent and undecodable are both reported missing
fn mandatory<T: IeValue>(ie: Option<&Ie>, name: &'static str) -> UpfResult<T> {
    let ie = ie.ok_or(UpfError::MandatoryIeMissing(name))?;
    ie.value::<T>().map_err(|e| {
        log::debug!("Cannot decode {name}: {e}");
        UpfError::MandatoryIeMissing(name)
    })
}

fn log_rejection(message: &str, peer: SocketAddr, err: &UpfError) {
    match err {
        UpfError::Internal(_) => log::error!("{message} from {peer} rejected: {err}"),
        _ => log::info!("{message} from {peer} rejected: {err} ({})", err.cause().name()),
    }
}

// ============================================================================
// Node messages
// ============================================================================

/// Handle Heartbeat Request
pub fn handle_heartbeat_request(
    conn: &PfcpConnection,
    req: &HeartbeatRequest,
    peer: SocketAddr,
) -> HeartbeatResponse {
    log::debug!("Heartbeat Request from {peer}");
    if let Err(e) = conn.peer_alive(peer) {
        log::error!("Heartbeat from {peer}: {e}");
    }

    if let Ok(mut guard) = conn.association() {
        if let Some(assoc) = guard.as_mut().filter(|a| a.peer_addr == peer) {
            match assoc.recovery_time_stamp {
                Some(ts) if ts != req.recovery_time_stamp => {
                    log::warn!(
                        "PFCP peer {} restarted (recovery time stamp {ts} -> {})",
                        assoc.node_id,
                        req.recovery_time_stamp
                    );
                    assoc.recovery_time_stamp = Some(req.recovery_time_stamp);
                }
                None => assoc.recovery_time_stamp = Some(req.recovery_time_stamp),
                _ => {}
            }
        }
    }

    build_heartbeat_response(conn)
}

/// Handle Heartbeat Response
pub fn handle_heartbeat_response(conn: &PfcpConnection, peer: SocketAddr) {
    log::debug!("Heartbeat Response from {peer}");
    if let Err(e) = conn.peer_alive(peer) {
        log::error!("Heartbeat from {peer}: {e}");
    }
}

/// Handle Association Setup Request
///
/// A new setup replaces any existing association. Sessions of the replaced
/// association are torn down.
pub fn handle_association_setup_request(
    conn: &PfcpConnection,
    req: &AssociationSetupRequest,
    peer: SocketAddr,
) -> AssociationSetupResponse {
    match setup_association(conn, req, peer) {
        Ok(()) => build_association_setup_response(conn, PfcpCause::RequestAccepted),
        Err(e) => {
            log_rejection("Association Setup Request", peer, &e);
            build_association_setup_response(conn, e.cause())
        }
    }
}

fn setup_association(
    conn: &PfcpConnection,
    req: &AssociationSetupRequest,
    peer: SocketAddr,
) -> UpfResult<()> {
    let node_id: NodeId = mandatory(req.node_id.as_ref(), "Node ID")?;

    let mut guard = conn.association()?;
    if let Some(mut old) = guard.take() {
        log::warn!(
            "Replacing PFCP association with {} ({} sessions)",
            old.node_id,
            old.sessions.len()
        );
        release_association(conn, &mut old);
    }

    let mut assoc = NodeAssociation::new(node_id.to_string(), peer);
    assoc.recovery_time_stamp = req.recovery_time_stamp;
    log::info!("PFCP association established with {node_id} ({peer})");
    *guard = Some(assoc);
    drop(guard);

    conn.set_peer(peer)
}

fn release_association(conn: &PfcpConnection, assoc: &mut NodeAssociation) {
    for (local_seid, mut session) in assoc.sessions.drain() {
        if let Err(e) = delete_session_rules(conn, &mut session) {
            log::warn!("Stale session {local_seid:#x}: {e}");
        }
        if let Err(e) = conn.teids().release_session(local_seid) {
            log::error!("Releasing TEIDs of session {local_seid:#x}: {e}");
        }
        if let Err(e) = conn.clear_session_reports(local_seid) {
            log::error!("Clearing reports of session {local_seid:#x}: {e}");
        }
    }
}

// ============================================================================
// Session Establishment
// ============================================================================

/// Handle Session Establishment Request
pub fn handle_session_establishment_request(
    conn: &PfcpConnection,
    req: &SessionEstablishmentRequest,
    peer: SocketAddr,
) -> SessionReply<SessionEstablishmentResponse> {
    let cp_f_seid = match establish_preconditions(req) {
        Ok(f_seid) => f_seid,
        Err(e) => {
            log_rejection("Session Establishment Request", peer, &e);
            return SessionReply::new(0, build_session_establishment_reject(conn, e.cause()));
        }
    };

    match establish_session(conn, req, cp_f_seid.seid) {
        Ok((local_seid, created)) => SessionReply::new(
            cp_f_seid.seid,
            build_session_establishment_response(conn, local_seid, &created),
        ),
        Err(e) => {
            log_rejection("Session Establishment Request", peer, &e);
            let seid = match e {
                UpfError::NoEstablishedAssociation => 0,
                _ => cp_f_seid.seid,
            };
            SessionReply::new(seid, build_session_establishment_reject(conn, e.cause()))
        }
    }
}

fn establish_preconditions(req: &SessionEstablishmentRequest) -> UpfResult<FSeid> {
    let node_id: NodeId = mandatory(req.node_id.as_ref(), "Node ID")?;
    let cp_f_seid: FSeid = mandatory(req.cp_f_seid.as_ref(), "CP F-SEID")?;
    log::debug!("Session Establishment from {node_id}, CP SEID {:#x}", cp_f_seid.seid);
    Ok(cp_f_seid)
}

fn establish_session(
    conn: &PfcpConnection,
    req: &SessionEstablishmentRequest,
    remote_seid: u64,
) -> UpfResult<(u64, Vec<SPdrInfo>)> {
    let mut guard = conn.association()?;
    let assoc = guard.as_mut().ok_or(UpfError::NoEstablishedAssociation)?;

    let local_seid = assoc.new_local_seid();
    let mut session = Session::new(local_seid, remote_seid);

    match apply_establishment_rules(conn, &mut session, req) {
        Ok(created) => {
            log::info!(
                "Session {local_seid:#x} established ({} PDRs, {} FARs, {} QERs)",
                session.pdrs.len(),
                session.fars.len(),
                session.qers.len()
            );
            assoc.insert_session(session);
            Ok((local_seid, created))
        }
        Err(e) => {
            // Only FAR/QER failures get here, before any PDR holds a TEID
            if let Err(release) = conn.teids().release_session(local_seid) {
                log::error!("Releasing TEIDs of session {local_seid:#x}: {release}");
            }
            Err(e)
        }
    }
}

fn apply_establishment_rules(
    conn: &PfcpConnection,
    session: &mut Session,
    req: &SessionEstablishmentRequest,
) -> UpfResult<Vec<SPdrInfo>> {
    for ie in &req.create_far {
        create_far(conn, session, ie)?;
    }
    for ie in &req.create_qer {
        create_qer(conn, session, ie)?;
    }

    // A PDR that cannot be created is skipped; the session carries the rest
    let mut ctx = PdrCreationContext::new(session.local_seid, conn.teids(), conn.forwarding());
    let mut created = Vec::new();
    for ie in &req.create_pdr {
        match create_pdr(&mut ctx, session, ie) {
            Ok(spdr) => created.push(spdr),
            Err(e) => log::error!(
                "Session {:#x}: skipping Create PDR: {e}",
                session.local_seid
            ),
        }
    }
    Ok(created)
}

// ============================================================================
// Session Modification
// ============================================================================

/// Handle Session Modification Request
pub fn handle_session_modification_request(
    conn: &PfcpConnection,
    local_seid: u64,
    req: &SessionModificationRequest,
    peer: SocketAddr,
) -> SessionReply<SessionModificationResponse> {
    let reject = |seid: u64, e: UpfError| {
        log_rejection("Session Modification Request", peer, &e);
        SessionReply::new(seid, SessionModificationResponse::new(e.cause()))
    };

    let mut guard = match conn.association() {
        Ok(guard) => guard,
        Err(e) => return reject(0, e),
    };
    let Some(assoc) = guard.as_mut() else {
        return reject(0, UpfError::NoEstablishedAssociation);
    };
    let Some(session) = assoc.session_mut(local_seid) else {
        return reject(0, UpfError::SessionContextNotFound(local_seid));
    };

    match modify_session(conn, session, req) {
        Ok(created) => {
            log::debug!("Session {local_seid:#x} modified");
            SessionReply::new(
                session.remote_seid,
                build_session_modification_response(conn, &created),
            )
        }
        // Rules applied before the failure stay in place
        Err(e) => reject(session.remote_seid, e),
    }
}

fn modify_session(
    conn: &PfcpConnection,
    session: &mut Session,
    req: &SessionModificationRequest,
) -> UpfResult<Vec<SPdrInfo>> {
    if let Some(ie) = &req.cp_f_seid {
        let cp_f_seid: FSeid = ie.value()?;
        if cp_f_seid.seid != session.remote_seid {
            log::info!(
                "Session {:#x}: remote SEID {:#x} -> {:#x}",
                session.local_seid,
                session.remote_seid,
                cp_f_seid.seid
            );
            session.remote_seid = cp_f_seid.seid;
        }
    }

    for ie in &req.create_far {
        create_far(conn, session, ie)?;
    }
    for ie in &req.update_far {
        update_far(conn, session, ie)?;
    }
    for ie in &req.remove_far {
        remove_far(conn, session, ie)?;
    }

    for ie in &req.create_qer {
        create_qer(conn, session, ie)?;
    }
    for ie in &req.update_qer {
        update_qer(conn, session, ie)?;
    }
    for ie in &req.remove_qer {
        remove_qer(conn, session, ie)?;
    }

    let mut ctx = PdrCreationContext::new(session.local_seid, conn.teids(), conn.forwarding());
    let mut created = Vec::new();
    for ie in &req.create_pdr {
        created.push(create_pdr(&mut ctx, session, ie)?);
    }
    for ie in &req.update_pdr {
        if let Some(moved) = update_pdr(conn, &mut ctx, session, ie)? {
            created.push(moved);
        }
    }
    for ie in &req.remove_pdr {
        remove_pdr(conn, &mut ctx, session, ie)?;
    }
    Ok(created)
}

// ============================================================================
// Session Deletion
// ============================================================================

/// Handle Session Deletion Request
pub fn handle_session_deletion_request(
    conn: &PfcpConnection,
    local_seid: u64,
    peer: SocketAddr,
) -> SessionReply<SessionDeletionResponse> {
    let reject = |seid: u64, e: UpfError| {
        log_rejection("Session Deletion Request", peer, &e);
        SessionReply::new(seid, build_session_deletion_response(e.cause()))
    };

    let mut guard = match conn.association() {
        Ok(guard) => guard,
        Err(e) => return reject(0, e),
    };
    let Some(assoc) = guard.as_mut() else {
        return reject(0, UpfError::NoEstablishedAssociation);
    };
    let Some(session) = assoc.session_mut(local_seid) else {
        return reject(0, UpfError::SessionContextNotFound(local_seid));
    };

    let remote_seid = session.remote_seid;
    // A failed deletion leaves the reduced session registered for a retry
    if let Err(e) = delete_session_rules(conn, session) {
        return reject(remote_seid, e);
    }
    assoc.remove_session(local_seid);
    drop(guard);

    if let Err(e) = conn.teids().release_session(local_seid) {
        log::error!("Releasing TEIDs of session {local_seid:#x}: {e}");
    }
    if let Err(e) = conn.clear_session_reports(local_seid) {
        log::error!("Clearing reports of session {local_seid:#x}: {e}");
    }
    log::info!("Session {local_seid:#x} deleted");

    SessionReply::new(
        remote_seid,
        build_session_deletion_response(PfcpCause::RequestAccepted),
    )
}

/// Remove every rule of `session` from the forwarding plane: PDRs first,
/// then FARs, then QERs
fn delete_session_rules(conn: &PfcpConnection, session: &mut Session) -> UpfResult<()> {
    let mut ctx = PdrCreationContext::new(session.local_seid, conn.teids(), conn.forwarding());
    let mut pdr_ids: Vec<u16> = session.pdrs.keys().copied().collect();
    pdr_ids.sort_unstable();
    for pdr_id in pdr_ids {
        if let Some(spdr) = session.remove_pdr(pdr_id) {
            if let Err(e) = ctx.delete(session, &spdr) {
                session.put_pdr(spdr);
                return Err(e);
            }
        }
    }

    let mut far_ids: Vec<u32> = session.fars.keys().copied().collect();
    far_ids.sort_unstable();
    for far_id in far_ids {
        conn.forwarding().delete_far(session.far(far_id)?.global_id)?;
        session.remove_far(far_id)?;
    }

    let mut qer_ids: Vec<u32> = session.qers.keys().copied().collect();
    qer_ids.sort_unstable();
    for qer_id in qer_ids {
        conn.forwarding().delete_qer(session.qer(qer_id)?.global_id)?;
        session.remove_qer(qer_id)?;
    }
    Ok(())
}

// ============================================================================
// Session Report
// ============================================================================

/// Handle Session Report Response
pub fn handle_session_report_response(rsp: &SessionReportResponse, peer: SocketAddr) {
    if rsp.cause.is_success() {
        log::debug!("Session Report accepted by {peer}");
    } else {
        log::warn!("Session Report rejected by {peer}: {}", rsp.cause.name());
    }
}

// ============================================================================
// Rules
// ============================================================================

fn create_far(conn: &PfcpConnection, session: &mut Session, ie: &Ie) -> UpfResult<()> {
    let far = CreateFar::from_ie(ie)?;
    let info = compose_far_info(
        FarInfo::new(conn.n3_address()),
        far.apply_action,
        far.forwarding_parameters.as_ref(),
        conn.n3_address(),
    )?;
    let global_id = conn.forwarding().new_far(&info).map_err(|e| {
        log::error!("Forwarding plane rejected FAR {}: {e}", far.far_id);
        e
    })?;
    log::debug!("FAR {} created as {global_id}", far.far_id);
    session.new_far(far.far_id, global_id, info);
    Ok(())
}

fn update_far(conn: &PfcpConnection, session: &mut Session, ie: &Ie) -> UpfResult<()> {
    let far = UpdateFar::from_ie(ie)?;
    let entry = *session.far(far.far_id)?;
    let info = compose_far_info(
        entry.info,
        far.apply_action,
        far.update_forwarding_parameters.as_ref(),
        conn.n3_address(),
    )?;
    conn.forwarding().update_far(entry.global_id, &info)?;
    session.update_far(far.far_id, info)?;
    Ok(())
}

fn remove_far(conn: &PfcpConnection, session: &mut Session, ie: &Ie) -> UpfResult<()> {
    let far = RemoveFar::from_ie(ie)?;
    let global_id = session.far(far.far_id)?.global_id;
    conn.forwarding().delete_far(global_id)?;
    session.remove_far(far.far_id)?;
    Ok(())
}

fn create_qer(conn: &PfcpConnection, session: &mut Session, ie: &Ie) -> UpfResult<()> {
    let CreateQer(fields) = CreateQer::from_ie(ie)?;
    let info = compose_qer_info(QerInfo::default(), &fields);
    let global_id = conn.forwarding().new_qer(&info).map_err(|e| {
        log::error!("Forwarding plane rejected QER {}: {e}", fields.qer_id);
        e
    })?;
    session.new_qer(fields.qer_id, global_id, info);
    Ok(())
}

fn update_qer(conn: &PfcpConnection, session: &mut Session, ie: &Ie) -> UpfResult<()> {
    let UpdateQer(fields) = UpdateQer::from_ie(ie)?;
    let entry = *session.qer(fields.qer_id)?;
    let info = compose_qer_info(entry.info, &fields);
    conn.forwarding().update_qer(entry.global_id, &info)?;
    session.update_qer(fields.qer_id, info)?;
    Ok(())
}

fn remove_qer(conn: &PfcpConnection, session: &mut Session, ie: &Ie) -> UpfResult<()> {
    let qer = RemoveQer::from_ie(ie)?;
    let global_id = session.qer(qer.qer_id)?.global_id;
    conn.forwarding().delete_qer(global_id)?;
    session.remove_qer(qer.qer_id)?;
    Ok(())
}

fn create_pdr(
    ctx: &mut PdrCreationContext<'_>,
    session: &mut Session,
    ie: &Ie,
) -> UpfResult<SPdrInfo> {
    let CreatePdr(fields) = CreatePdr::from_ie(ie)?;
    let spdr = ctx.extract(session, &fields)?;
    if let Err(e) = ctx.apply(&spdr) {
        log::error!("Forwarding plane rejected PDR {}: {e}", spdr.pdr_id);
        if let Err(release) = ctx.discard(session, &spdr) {
            log::error!("Releasing TEID of PDR {}: {release}", spdr.pdr_id);
        }
        return Err(e);
    }
    log::debug!("PDR {} created ({:?})", spdr.pdr_id, spdr.target);
    session.put_pdr(spdr.clone());
    Ok(spdr)
}

/// Returns the PDR when it moved to a newly allocated uplink TEID
fn update_pdr(
    conn: &PfcpConnection,
    ctx: &mut PdrCreationContext<'_>,
    session: &mut Session,
    ie: &Ie,
) -> UpfResult<Option<SPdrInfo>> {
    let UpdatePdr(fields) = UpdatePdr::from_ie(ie)?;
    let old = session.pdr(fields.pdr_id)?.clone();
    let new = ctx.update(session, &old, &fields)?;
    let moved = new.target != old.target;

    if let Err(e) = ctx.apply_update(session, &old, &new) {
        if moved {
            if let Err(release) = ctx.discard(session, &new) {
                log::error!("Releasing TEID of PDR {}: {release}", new.pdr_id);
            }
        }
        return Err(e);
    }

    conn.clear_downlink_reported(session.local_seid, new.pdr_id)?;
    session.put_pdr(new.clone());
    Ok((moved && new.target.is_uplink()).then_some(new))
}

fn remove_pdr(
    conn: &PfcpConnection,
    ctx: &mut PdrCreationContext<'_>,
    session: &mut Session,
    ie: &Ie,
) -> UpfResult<()> {
    let pdr = RemovePdr::from_ie(ie)?;
    let Some(spdr) = session.remove_pdr(pdr.pdr_id) else {
        log::debug!("Remove PDR {}: not in session, skipped", pdr.pdr_id);
        return Ok(());
    };
    if let Err(e) = ctx.delete(session, &spdr) {
        session.put_pdr(spdr);
        return Err(e);
    }
    conn.clear_downlink_reported(session.local_seid, pdr.pdr_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpfConfig;
    use crate::forwarding::{ForwardingOp, InMemoryForwardingPlane};
    use crate::session::PdrTarget;
    use crate::teid::{TeidAllocator, TeidOwner};
    use n4_pfcp::grouped::{ForwardingParameters, Pdi, PdrFields, QerFields};
    use n4_pfcp::ie::FarId;
    use n4_pfcp::types::{ApplyAction, FTeid, Mbr, OuterHeaderCreation, UeIpAddress};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const CP_SEID: u64 = 0x1000;

    struct Fixture {
        conn: PfcpConnection,
        fp: Arc<InMemoryForwardingPlane>,
    }

    fn fixture_with_pool(pool: u32) -> Fixture {
        let fp = Arc::new(InMemoryForwardingPlane::new());
        let conn = PfcpConnection::new(
            &UpfConfig::default(),
            Arc::new(TeidAllocator::new(pool).unwrap()),
            fp.clone(),
        );
        Fixture { conn, fp }
    }

    fn fixture() -> Fixture {
        fixture_with_pool(100)
    }

    fn smf() -> SocketAddr {
        "10.0.0.1:8805".parse().unwrap()
    }

    fn smf_node_id() -> NodeId {
        NodeId::Ipv4(Ipv4Addr::new(10, 0, 0, 1))
    }

    fn associate(conn: &PfcpConnection) {
        let req = AssociationSetupRequest::new(&smf_node_id(), 3_900_000_000);
        let rsp = handle_association_setup_request(conn, &req, smf());
        assert_eq!(rsp.cause, PfcpCause::RequestAccepted);
    }

    fn far_ie(far_id: u32) -> Ie {
        CreateFar {
            far_id,
            apply_action: Some(ApplyAction::forward()),
            forwarding_parameters: Some(ForwardingParameters {
                outer_header_creation: Some(OuterHeaderCreation::gtpu_ipv4(
                    0x100,
                    Ipv4Addr::new(192, 168, 0, 10),
                )),
                ..Default::default()
            }),
        }
        .to_ie()
    }

    fn uplink_pdr_ie(pdr_id: u16, far_id: u32, choose_id: Option<u8>) -> Ie {
        CreatePdr(PdrFields {
            pdr_id,
            far_id: Some(FarId(far_id)),
            pdi: Some(Pdi {
                f_teid: Some(FTeid::choose(true, false, choose_id)),
                ..Default::default()
            }),
            ..Default::default()
        })
        .to_ie()
    }

    fn downlink_pdr_ie(pdr_id: u16, far_id: u32) -> Ie {
        CreatePdr(PdrFields {
            pdr_id,
            far_id: Some(FarId(far_id)),
            pdi: Some(Pdi {
                ue_ip_address: Some(UeIpAddress::ipv4(Ipv4Addr::new(10, 45, 0, 2), true)),
                ..Default::default()
            }),
            ..Default::default()
        })
        .to_ie()
    }

    fn establishment() -> SessionEstablishmentRequest {
        let mut req = SessionEstablishmentRequest::new(
            &smf_node_id(),
            &FSeid::new(CP_SEID, Some(Ipv4Addr::new(10, 0, 0, 1)), None),
        );
        req.create_far = vec![far_ie(1), far_ie(2)];
        req.create_pdr = vec![uplink_pdr_ie(1, 1, None), downlink_pdr_ie(2, 2)];
        req
    }

    fn establish(conn: &PfcpConnection) -> u64 {
        let reply = handle_session_establishment_request(conn, &establishment(), smf());
        assert_eq!(reply.message.cause, PfcpCause::RequestAccepted);
        reply.message.up_f_seid.unwrap().seid
    }

    fn session(conn: &PfcpConnection, local_seid: u64) -> Option<Session> {
        conn.association()
            .unwrap()
            .as_ref()
            .and_then(|a| a.session(local_seid).cloned())
    }

    #[test]
    fn test_association_setup_requires_node_id() {
        let f = fixture();
        let rsp = handle_association_setup_request(
            &f.conn,
            &AssociationSetupRequest::default(),
            smf(),
        );
        assert_eq!(rsp.cause, PfcpCause::MandatoryIeMissing);
        assert!(f.conn.association().unwrap().is_none());
        assert!(f.conn.peer_addr().is_none());
    }

    #[test]
    fn test_association_setup_accepted() {
        let f = fixture();
        let req = AssociationSetupRequest::new(&smf_node_id(), 3_900_000_000);
        let rsp = handle_association_setup_request(&f.conn, &req, smf());
        assert_eq!(rsp.cause, PfcpCause::RequestAccepted);
        assert_eq!(rsp.node_id, f.conn.node_id());
        assert!(rsp.up_function_features.is_some());
        assert_eq!(rsp.user_plane_ip_resource_information.len(), 1);

        let guard = f.conn.association().unwrap();
        let assoc = guard.as_ref().unwrap();
        assert_eq!(assoc.node_id, "10.0.0.1");
        assert_eq!(assoc.recovery_time_stamp, Some(3_900_000_000));
        drop(guard);
        assert_eq!(f.conn.peer_addr(), Some(smf()));
    }

    #[test]
    fn test_association_replace_releases_sessions() {
        let f = fixture();
        associate(&f.conn);
        establish(&f.conn);
        assert_eq!(f.conn.teids().busy_count().unwrap(), 1);

        associate(&f.conn);
        let guard = f.conn.association().unwrap();
        assert!(guard.as_ref().unwrap().sessions.is_empty());
        drop(guard);
        assert_eq!(f.conn.teids().busy_count().unwrap(), 0);
        assert_eq!(f.fp.counts(), (0, 0, 0));
    }

    #[test]
    fn test_heartbeat_request_refreshes_peer() {
        let f = fixture();
        associate(&f.conn);
        f.conn.heartbeat_tick(3).unwrap();
        f.conn.heartbeat_tick(3).unwrap();
        assert_eq!(f.conn.peer_state().unwrap().missed, 2);

        let rsp = handle_heartbeat_request(&f.conn, &HeartbeatRequest::new(3_900_000_001), smf());
        assert_eq!(rsp.recovery_time_stamp, f.conn.recovery_time_stamp());
        assert_eq!(f.conn.peer_state().unwrap().missed, 0);

        // Restarted peer recorded
        let guard = f.conn.association().unwrap();
        assert_eq!(guard.as_ref().unwrap().recovery_time_stamp, Some(3_900_000_001));
    }

    #[test]
    fn test_heartbeat_response_refreshes_peer() {
        let f = fixture();
        associate(&f.conn);
        f.conn.heartbeat_tick(3).unwrap();
        handle_heartbeat_response(&f.conn, smf());
        assert_eq!(f.conn.peer_state().unwrap().missed, 0);
    }

    #[test]
    fn test_establishment_without_association() {
        let f = fixture();
        let reply = handle_session_establishment_request(&f.conn, &establishment(), smf());
        assert_eq!(reply.seid, 0);
        assert_eq!(reply.message.cause, PfcpCause::NoEstablishedPfcpAssociation);
    }

    #[test]
    fn test_establishment_requires_cp_f_seid() {
        let f = fixture();
        associate(&f.conn);
        let mut req = establishment();
        req.cp_f_seid = None;
        let reply = handle_session_establishment_request(&f.conn, &req, smf());
        assert_eq!(reply.seid, 0);
        assert_eq!(reply.message.cause, PfcpCause::MandatoryIeMissing);
    }

    #[test]
    fn test_establishment_creates_session() {
        let f = fixture();
        associate(&f.conn);
        let reply = handle_session_establishment_request(&f.conn, &establishment(), smf());
        let rsp = reply.message;
        assert_eq!(reply.seid, CP_SEID);
        assert_eq!(rsp.cause, PfcpCause::RequestAccepted);

        let up_f_seid = rsp.up_f_seid.unwrap();
        assert_eq!(up_f_seid.seid, 1);
        assert_eq!(up_f_seid.ipv4, Some(Ipv4Addr::new(127, 0, 0, 7)));

        // Only the uplink PDR has a UP-chosen TEID
        assert_eq!(rsp.created_pdr.len(), 1);
        let created = &rsp.created_pdr[0];
        assert_eq!(created.pdr_id, 1);
        let f_teid = created.f_teid.unwrap();
        assert_eq!(f_teid.ipv4, Some(f.conn.advertised_n3_address()));

        let sess = session(&f.conn, 1).unwrap();
        assert_eq!(sess.remote_seid, CP_SEID);
        assert_eq!(sess.pdrs.len(), 2);
        assert_eq!(sess.fars.len(), 2);
        assert_eq!(f.fp.counts(), (2, 2, 0));

        let uplink = f.fp.uplink_pdr(f_teid.teid).unwrap();
        assert_eq!(uplink.far_handle, sess.far_handle(1));
        let far = f.fp.far(sess.far_handle(1).unwrap()).unwrap();
        assert_eq!(far.teid, 0x100);
        assert_eq!(far.remote_ip, Some(Ipv4Addr::new(192, 168, 0, 10)));
        assert_eq!(far.local_ip, f.conn.n3_address());
    }

    #[test]
    fn test_establishment_far_rejected() {
        let f = fixture();
        associate(&f.conn);
        f.fp.reject(ForwardingOp::NewFar);
        let reply = handle_session_establishment_request(&f.conn, &establishment(), smf());
        assert_eq!(reply.message.cause, PfcpCause::RuleCreationModificationFailure);
        assert!(reply.message.up_f_seid.is_none());
        assert!(f.conn.association().unwrap().as_ref().unwrap().sessions.is_empty());
        assert_eq!(f.conn.teids().busy_count().unwrap(), 0);
    }

    #[test]
    fn test_establishment_pool_exhausted_skips_pdr() {
        let f = fixture_with_pool(1);
        associate(&f.conn);
        let mut req = establishment();
        req.create_pdr = vec![uplink_pdr_ie(1, 1, None), uplink_pdr_ie(3, 1, None)];
        let rsp = handle_session_establishment_request(&f.conn, &req, smf()).message;
        assert_eq!(rsp.cause, PfcpCause::RequestAccepted);
        assert_eq!(rsp.created_pdr.len(), 1);
        assert_eq!(rsp.created_pdr[0].pdr_id, 1);
        assert_eq!(f.conn.teids().busy_count().unwrap(), 1);

        let sess = session(&f.conn, rsp.up_f_seid.unwrap().seid).unwrap();
        assert!(sess.pdr(1).is_ok());
        assert!(sess.pdr(3).is_err());
    }

    #[test]
    fn test_establishment_skips_pdr_with_peer_teid() {
        let f = fixture();
        associate(&f.conn);
        let mut req = establishment();
        let peer_teid = CreatePdr(PdrFields {
            pdr_id: 3,
            far_id: Some(FarId(1)),
            pdi: Some(Pdi {
                f_teid: Some(FTeid::ipv4(0x77, Ipv4Addr::new(10, 0, 0, 9))),
                ..Default::default()
            }),
            ..Default::default()
        })
        .to_ie();
        req.create_pdr = vec![uplink_pdr_ie(1, 1, None), peer_teid];

        let rsp = handle_session_establishment_request(&f.conn, &req, smf()).message;
        assert_eq!(rsp.cause, PfcpCause::RequestAccepted);
        assert_eq!(rsp.created_pdr.len(), 1);
        let teid = rsp.created_pdr[0].f_teid.unwrap().teid;

        // The installed uplink entry and the pool agree
        assert_eq!(f.conn.teids().busy_count().unwrap(), 1);
        assert_eq!(f.conn.teids().owner_of(teid).unwrap(), Some(TeidOwner::new(1, 1)));
        assert!(f.fp.uplink_pdr(teid).is_some());
        assert!(f.fp.uplink_pdr(0x77).is_none());
        assert_eq!(f.fp.counts(), (1, 2, 0));
        assert_eq!(session(&f.conn, 1).unwrap().pdrs.len(), 1);
    }

    #[test]
    fn test_establishment_pdr_rejected_by_forwarding_plane() {
        let f = fixture();
        associate(&f.conn);
        f.fp.reject(ForwardingOp::PutPdr);
        let rsp = handle_session_establishment_request(&f.conn, &establishment(), smf()).message;
        assert_eq!(rsp.cause, PfcpCause::RequestAccepted);
        assert!(rsp.created_pdr.is_empty());
        assert_eq!(f.conn.teids().busy_count().unwrap(), 0);
        assert!(session(&f.conn, 1).unwrap().pdrs.is_empty());
    }

    #[test]
    fn test_establishment_choose_id_shares_teid() {
        let f = fixture();
        associate(&f.conn);
        let mut req = establishment();
        req.create_pdr = vec![uplink_pdr_ie(1, 1, Some(5)), uplink_pdr_ie(3, 1, Some(5))];
        let rsp = handle_session_establishment_request(&f.conn, &req, smf()).message;
        assert_eq!(rsp.created_pdr.len(), 2);
        assert_eq!(
            rsp.created_pdr[0].f_teid.unwrap().teid,
            rsp.created_pdr[1].f_teid.unwrap().teid
        );
        assert_eq!(f.conn.teids().busy_count().unwrap(), 1);
    }

    #[test]
    fn test_choose_id_owner_removed_then_recreated() {
        let f = fixture();
        associate(&f.conn);
        let mut req = establishment();
        req.create_pdr = vec![uplink_pdr_ie(1, 1, Some(5)), uplink_pdr_ie(2, 1, Some(5))];
        let rsp = handle_session_establishment_request(&f.conn, &req, smf()).message;
        let seid = rsp.up_f_seid.unwrap().seid;
        let shared = rsp.created_pdr[0].f_teid.unwrap().teid;

        let mut remove = SessionModificationRequest::default();
        remove.remove_pdr = vec![RemovePdr { pdr_id: 1 }.to_ie()];
        let reply = handle_session_modification_request(&f.conn, seid, &remove, smf());
        assert_eq!(reply.message.cause, PfcpCause::RequestAccepted);
        assert_eq!(f.conn.teids().owner_of(shared).unwrap(), Some(TeidOwner::new(seid, 2)));

        let mut create = SessionModificationRequest::default();
        create.create_pdr = vec![uplink_pdr_ie(1, 1, None)];
        let reply = handle_session_modification_request(&f.conn, seid, &create, smf());
        assert_eq!(reply.message.cause, PfcpCause::RequestAccepted);
        assert_eq!(reply.message.created_pdr.len(), 1);
        assert_ne!(reply.message.created_pdr[0].f_teid.unwrap().teid, shared);
        assert_eq!(f.conn.teids().busy_count().unwrap(), 2);

        let reply = handle_session_deletion_request(&f.conn, seid, smf());
        assert_eq!(reply.message.cause, PfcpCause::RequestAccepted);
        assert_eq!(f.conn.teids().busy_count().unwrap(), 0);
        assert_eq!(f.fp.counts(), (0, 0, 0));
    }

    #[test]
    fn test_modification_unknown_session() {
        let f = fixture();
        associate(&f.conn);
        let reply = handle_session_modification_request(
            &f.conn,
            42,
            &SessionModificationRequest::default(),
            smf(),
        );
        assert_eq!(reply.seid, 0);
        assert_eq!(reply.message.cause, PfcpCause::SessionContextNotFound);
    }

    #[test]
    fn test_modification_updates_rules() {
        let f = fixture();
        associate(&f.conn);
        let seid = establish(&f.conn);

        let mut req = SessionModificationRequest::default();
        req.cp_f_seid = Some(FSeid::new(0x2000, Some(Ipv4Addr::new(10, 0, 0, 1)), None).to_ie());
        req.create_qer = vec![CreateQer(QerFields {
            qer_id: 1,
            mbr: Some(Mbr {
                uplink: 1000,
                downlink: 2000,
            }),
            ..Default::default()
        })
        .to_ie()];
        req.update_pdr = vec![UpdatePdr(PdrFields {
            pdr_id: 2,
            qer_id: Some(n4_pfcp::ie::QerId(1)),
            ..Default::default()
        })
        .to_ie()];
        req.remove_pdr = vec![RemovePdr { pdr_id: 9 }.to_ie()];

        let reply = handle_session_modification_request(&f.conn, seid, &req, smf());
        assert_eq!(reply.message.cause, PfcpCause::RequestAccepted);
        assert_eq!(reply.seid, 0x2000);
        assert!(reply.message.created_pdr.is_empty());

        let sess = session(&f.conn, seid).unwrap();
        assert_eq!(sess.remote_seid, 0x2000);
        let qer = sess.qer(1).unwrap();
        assert_eq!(qer.info.max_bitrate_ul, 1_000_000);
        let downlink = f.fp.downlink_pdr_v4(Ipv4Addr::new(10, 45, 0, 2)).unwrap();
        assert_eq!(downlink.qer_handle, Some(qer.global_id));
    }

    #[test]
    fn test_modification_update_unknown_far_fails() {
        let f = fixture();
        associate(&f.conn);
        let seid = establish(&f.conn);

        let mut req = SessionModificationRequest::default();
        req.update_far = vec![UpdateFar {
            far_id: 77,
            ..Default::default()
        }
        .to_ie()];
        let reply = handle_session_modification_request(&f.conn, seid, &req, smf());
        assert_eq!(reply.seid, CP_SEID);
        assert_eq!(reply.message.cause, PfcpCause::RuleCreationModificationFailure);
    }

    #[test]
    fn test_modification_remove_pdr_releases_teid() {
        let f = fixture();
        associate(&f.conn);
        let seid = establish(&f.conn);
        assert_eq!(f.conn.teids().busy_count().unwrap(), 1);

        let mut req = SessionModificationRequest::default();
        req.remove_pdr = vec![RemovePdr { pdr_id: 1 }.to_ie()];
        req.remove_far = vec![RemoveFar { far_id: 1 }.to_ie()];
        let reply = handle_session_modification_request(&f.conn, seid, &req, smf());
        assert_eq!(reply.message.cause, PfcpCause::RequestAccepted);
        assert_eq!(f.conn.teids().busy_count().unwrap(), 0);

        let sess = session(&f.conn, seid).unwrap();
        assert!(sess.pdr(1).is_err());
        assert!(sess.far(1).is_err());
        assert_eq!(f.fp.counts(), (1, 1, 0));
    }

    #[test]
    fn test_modification_partial_failure_keeps_earlier_steps() {
        let f = fixture();
        associate(&f.conn);
        let seid = establish(&f.conn);

        let mut req = SessionModificationRequest::default();
        req.create_far = vec![far_ie(3)];
        req.remove_qer = vec![RemoveQer { qer_id: 4 }.to_ie()];
        let reply = handle_session_modification_request(&f.conn, seid, &req, smf());
        assert_eq!(reply.message.cause, PfcpCause::RuleCreationModificationFailure);
        assert!(session(&f.conn, seid).unwrap().far(3).is_ok());
    }

    #[test]
    fn test_update_pdr_to_new_uplink_reports_created() {
        let f = fixture();
        associate(&f.conn);
        let seid = establish(&f.conn);

        let mut req = SessionModificationRequest::default();
        req.update_pdr = vec![UpdatePdr(PdrFields {
            pdr_id: 2,
            pdi: Some(Pdi {
                f_teid: Some(FTeid::choose(true, false, None)),
                ..Default::default()
            }),
            ..Default::default()
        })
        .to_ie()];
        let reply = handle_session_modification_request(&f.conn, seid, &req, smf());
        assert_eq!(reply.message.cause, PfcpCause::RequestAccepted);
        assert_eq!(reply.message.created_pdr.len(), 1);
        assert_eq!(reply.message.created_pdr[0].pdr_id, 2);
        assert!(f.fp.downlink_pdr_v4(Ipv4Addr::new(10, 45, 0, 2)).is_none());
        assert!(matches!(
            session(&f.conn, seid).unwrap().pdr(2).unwrap().target,
            PdrTarget::Uplink { .. }
        ));
    }

    #[test]
    fn test_deletion_frees_everything() {
        let f = fixture();
        associate(&f.conn);
        let seid = establish(&f.conn);
        f.conn.mark_downlink_reported(seid, 2).unwrap();

        let reply = handle_session_deletion_request(&f.conn, seid, smf());
        assert_eq!(reply.seid, CP_SEID);
        assert_eq!(reply.message.cause, PfcpCause::RequestAccepted);
        assert!(session(&f.conn, seid).is_none());
        assert_eq!(f.conn.teids().busy_count().unwrap(), 0);
        assert_eq!(f.fp.counts(), (0, 0, 0));
        assert!(f.conn.mark_downlink_reported(seid, 2).unwrap());
    }

    #[test]
    fn test_deletion_failure_keeps_session() {
        let f = fixture();
        associate(&f.conn);
        let seid = establish(&f.conn);
        f.fp.reject(ForwardingOp::DeleteFar);

        let reply = handle_session_deletion_request(&f.conn, seid, smf());
        assert_eq!(reply.seid, CP_SEID);
        assert_eq!(reply.message.cause, PfcpCause::RuleCreationModificationFailure);
        let sess = session(&f.conn, seid).unwrap();
        assert!(sess.pdrs.is_empty());
        assert_eq!(sess.fars.len(), 2);

        // Retry converges
        f.fp.accept(ForwardingOp::DeleteFar);
        let reply = handle_session_deletion_request(&f.conn, seid, smf());
        assert_eq!(reply.message.cause, PfcpCause::RequestAccepted);
        assert_eq!(f.fp.counts(), (0, 0, 0));
    }

    #[test]
    fn test_deletion_unknown_session() {
        let f = fixture();
        associate(&f.conn);
        let reply = handle_session_deletion_request(&f.conn, 5, smf());
        assert_eq!(reply.seid, 0);
        assert_eq!(reply.message.cause, PfcpCause::SessionContextNotFound);
    }
}
