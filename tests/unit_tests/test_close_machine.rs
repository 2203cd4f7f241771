// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use std::sync::Arc;

use urpc_rs::{
    errors::ErrCode,
    models::cdc::{CdcMessage, ConnStateFlags, HostCdcState},
    sock::{
        ConnState,
        close::{close_active, close_active_abort, close_shutdown_write},
        connection::{ConnCfg, Connection},
    },
};

fn active_conn() -> Arc<Connection> {
    let conn = Connection::new(ConnCfg::default());
    conn.connect().expect("init -> active");
    conn
}

/// Deliver a CDC frame carrying the given connection-state flags.
fn deliver_flags(conn: &Arc<Connection>, flags: ConnStateFlags, seqno: u16) {
    let state = HostCdcState {
        seqno,
        conn_state_flags: flags,
        ..Default::default()
    };
    conn.on_cdc_recv(&CdcMessage::from_host(&state));
}

#[tokio::test]
async fn close_from_init_goes_straight_to_closed() {
    let conn = Connection::new(ConnCfg::default());
    close_active(&conn, None).await.expect("close");
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn active_close_waits_in_peer_close_wait1() {
    let conn = active_conn();
    close_active(&conn, None).await.expect("close");
    assert_eq!(conn.state(), ConnState::PeerCloseWait1);
    assert!(
        conn.local_tx_flags()
            .contains(ConnStateFlags::PEER_CONN_CLOSED)
    );

    // repeating the close after its first effect is a no-op
    close_active(&conn, None).await.expect("close again");
    assert_eq!(conn.state(), ConnState::PeerCloseWait1);
}

#[tokio::test]
async fn shutdown_write_is_half_close() {
    let conn = active_conn();
    close_shutdown_write(&conn, None).await.expect("shutdown");
    assert_eq!(conn.state(), ConnState::PeerCloseWait1);
    let tx = conn.local_tx_flags();
    assert!(tx.contains(ConnStateFlags::PEER_DONE_WRITING));
    assert!(!tx.any_close(), "half-close must not announce a full close");

    close_shutdown_write(&conn, None).await.expect("repeat");
    assert_eq!(conn.state(), ConnState::PeerCloseWait1);
}

#[tokio::test]
async fn peer_done_writing_triggers_passive_app_close_wait() {
    let conn = active_conn();
    deliver_flags(&conn, ConnStateFlags::PEER_DONE_WRITING, 1);
    assert_eq!(conn.state(), ConnState::AppCloseWait1);
    // duplicate delivery changes nothing
    deliver_flags(&conn, ConnStateFlags::PEER_DONE_WRITING, 2);
    assert_eq!(conn.state(), ConnState::AppCloseWait1);

    // the application closes: confirm, then park until the peer's own
    // close actually arrives
    close_active(&conn, None).await.expect("close");
    assert_eq!(conn.state(), ConnState::PeerFinCloseWait);

    // the passive worker is what finishes the job
    deliver_flags(
        &conn,
        ConnStateFlags::PEER_DONE_WRITING | ConnStateFlags::PEER_CONN_CLOSED,
        3,
    );
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn shutdown_then_close_passes_app_fin_close_wait() {
    let conn = active_conn();
    deliver_flags(&conn, ConnStateFlags::PEER_DONE_WRITING, 1);
    assert_eq!(conn.state(), ConnState::AppCloseWait1);

    // confirm the shutdown first, then close while the peer's close is
    // still outstanding
    close_shutdown_write(&conn, None).await.expect("shutdown");
    assert_eq!(conn.state(), ConnState::AppCloseWait2);
    close_active(&conn, None).await.expect("close");
    assert_eq!(conn.state(), ConnState::AppFinCloseWait);

    deliver_flags(&conn, ConnStateFlags::PEER_CONN_CLOSED, 2);
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn peer_close_then_local_close() {
    let conn = active_conn();
    deliver_flags(&conn, ConnStateFlags::PEER_CONN_CLOSED, 1);
    assert_eq!(conn.state(), ConnState::AppCloseWait1);
    close_active(&conn, None).await.expect("close");
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn our_close_then_peer_close_reaches_closed() {
    let conn = active_conn();
    close_active(&conn, None).await.expect("close");
    assert_eq!(conn.state(), ConnState::PeerCloseWait1);
    deliver_flags(
        &conn,
        ConnStateFlags::PEER_DONE_WRITING | ConnStateFlags::PEER_CONN_CLOSED,
        1,
    );
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn peer_abort_from_active_runs_process_abort() {
    let conn = active_conn();
    deliver_flags(&conn, ConnStateFlags::PEER_CONN_ABORT, 1);
    assert_eq!(conn.state(), ConnState::ProcessAbort);
    assert_eq!(conn.sk_err(), Some(ErrCode::ConnAborted));

    close_active(&conn, None).await.expect("close after abort");
    assert_eq!(conn.state(), ConnState::Closed);
    assert!(
        conn.local_tx_flags()
            .contains(ConnStateFlags::PEER_CONN_ABORT)
    );
}

#[tokio::test]
async fn peer_abort_while_waiting_for_peer_close() {
    let conn = active_conn();
    close_active(&conn, None).await.expect("close");
    assert_eq!(conn.state(), ConnState::PeerCloseWait1);
    // we already sent a close: abort collapses straight to closed
    deliver_flags(&conn, ConnStateFlags::PEER_CONN_ABORT, 1);
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn active_abort_is_terminal() {
    let conn = active_conn();
    close_active_abort(&conn);
    assert_eq!(conn.state(), ConnState::Closed);
    assert_eq!(conn.sk_err(), Some(ErrCode::ConnAborted));
    assert!(conn.is_killed());

    // repeating the abort after its first effect is a no-op
    close_active_abort(&conn);
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn recv_reports_eof_after_peer_done_writing() {
    let conn = active_conn();
    deliver_flags(&conn, ConnStateFlags::PEER_DONE_WRITING, 1);
    let got = conn.recvmsg(100).expect("recv at eof");
    assert_eq!(got, 0, "orderly eof must read as zero");
}

#[tokio::test]
async fn send_after_shutdown_write_is_rejected() {
    let conn = active_conn();
    close_shutdown_write(&conn, None).await.expect("shutdown");
    assert!(conn.sendmsg(10).is_err());
}
