// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Active/passive close, half-close and abort over the CDC channel.
//!
//! A close is only announced after staged TX bytes have drained (bounded by
//! the linger timeout); `close_final` then tells the peer either
//! `PEER_CONN_CLOSED` (our RX is drained too) or `PEER_CONN_ABORT` (the
//! peer would lose data). The passive worker runs whenever an inbound CDC
//! frame carries any closing flag and is the only place that wakes blocked
//! readers and writers.

use std::{sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::debug;

use crate::{
    errors::{ErrCode, UrpcError, UrpcResult},
    models::cdc::ConnStateFlags,
    sock::{ConnState, connection::Connection},
};

/// Linger bound applied when the caller does not supply one.
pub const MAX_STREAM_WAIT: Duration = Duration::from_secs(10);

fn close_wr(conn: &Connection) -> UrpcResult<()> {
    conn.set_local_tx_flag(ConnStateFlags::PEER_DONE_WRITING);
    conn.cdc_send()
}

fn close_final(conn: &Connection) -> UrpcResult<()> {
    if conn.bytes_to_rcv() == 0 {
        conn.set_local_tx_flag(ConnStateFlags::PEER_CONN_CLOSED);
    } else {
        conn.set_local_tx_flag(ConnStateFlags::PEER_CONN_ABORT);
    }
    if conn.is_killed() {
        return Err(UrpcError::ConnAborted);
    }
    conn.cdc_send()
}

pub fn close_abort(conn: &Connection) -> UrpcResult<()> {
    conn.set_local_tx_flag(ConnStateFlags::PEER_CONN_ABORT);
    conn.cdc_send()
}

/// Wait for staged sends to drain, up to `linger`. Flushes corked data
/// first; an error or kill on the connection ends the wait early.
pub async fn close_stream_wait(conn: &Arc<Connection>, linger: Duration) {
    if linger.is_zero() || conn.tx_prepared_sends() == 0 {
        return;
    }
    // push out whatever is corked in the send buffer
    match conn.tx_flush() {
        Ok(_) | Err(UrpcError::Backpressure) => {},
        Err(e) => debug!("flush before close failed: {e}"),
    }
    let _ = timeout(linger, async {
        while conn.tx_prepared_sends() != 0 && !conn.is_killed() && conn.sk_err().is_none()
        {
            conn.write_space.notified().await;
            // retry the flush; the peer may have opened window
            match conn.tx_flush() {
                Ok(_) | Err(UrpcError::Backpressure) => {},
                Err(_) => break,
            }
        }
    })
    .await;
}

fn keep_first(err: &mut Option<UrpcError>, res: UrpcResult<()>) {
    if let Err(e) = res {
        if err.is_none() {
            *err = Some(e);
        }
    }
}

/// Full close (`SHUT_RDWR`). Loops until no peer event changes the state
/// underneath a step.
pub async fn close_active(
    conn: &Arc<Connection>,
    linger: Option<Duration>,
) -> UrpcResult<()> {
    let linger = linger.unwrap_or(MAX_STREAM_WAIT);
    let mut first_err: Option<UrpcError> = None;
    loop {
        let again = match conn.state() {
            ConnState::Init | ConnState::Listen => {
                conn.set_state(ConnState::Closed);
                false
            },
            ConnState::Active => {
                close_stream_wait(conn, linger).await;
                if conn.move_state(ConnState::Active, ConnState::PeerCloseWait1) {
                    keep_first(&mut first_err, close_final(conn));
                    false
                } else {
                    // peer event changed the state mid-step
                    true
                }
            },
            ConnState::AppFinCloseWait => {
                if conn
                    .local_tx_flags()
                    .contains(ConnStateFlags::PEER_DONE_WRITING)
                    && !conn.sent_any_close()
                {
                    keep_first(&mut first_err, close_final(conn));
                }
                conn.set_state(ConnState::Closed);
                false
            },
            st @ (ConnState::AppCloseWait1 | ConnState::AppCloseWait2) => {
                if !conn.rxed_any_close() {
                    close_stream_wait(conn, linger).await;
                }
                if conn.state() != st {
                    true
                } else {
                    // confirm close from the peer's point of view
                    keep_first(&mut first_err, close_final(conn));
                    if conn.rxed_any_close() {
                        conn.set_state(ConnState::Closed);
                    } else if st == ConnState::AppCloseWait2 {
                        // writes were already shut down; the peer's close
                        // is still outstanding
                        conn.set_state(ConnState::AppFinCloseWait);
                    } else {
                        // peer has only shut down writes so far; park here
                        // until the passive worker sees its actual close
                        conn.set_state(ConnState::PeerFinCloseWait);
                    }
                    false
                }
            },
            ConnState::PeerCloseWait1 | ConnState::PeerCloseWait2 => {
                if conn
                    .local_tx_flags()
                    .contains(ConnStateFlags::PEER_DONE_WRITING)
                    && !conn.sent_any_close()
                {
                    // just shutdown-wr done earlier; send the close now
                    keep_first(&mut first_err, close_final(conn));
                }
                // the peer's PEER_CONN_CLOSED will cause the transition
                false
            },
            ConnState::ProcessAbort => {
                keep_first(&mut first_err, close_abort(conn));
                conn.set_state(ConnState::Closed);
                false
            },
            ConnState::PeerAbortWait => {
                conn.set_state(ConnState::Closed);
                false
            },
            ConnState::Closed | ConnState::PeerFinCloseWait => false,
        };
        if !again {
            break;
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Half-close (`SHUT_WR`): stop writing, keep reading.
pub async fn close_shutdown_write(
    conn: &Arc<Connection>,
    linger: Option<Duration>,
) -> UrpcResult<()> {
    let linger = linger.unwrap_or(MAX_STREAM_WAIT);
    let mut first_err: Option<UrpcError> = None;
    loop {
        let again = match conn.state() {
            ConnState::Active => {
                close_stream_wait(conn, linger).await;
                if conn.move_state(ConnState::Active, ConnState::PeerCloseWait1) {
                    keep_first(&mut first_err, close_wr(conn));
                    false
                } else {
                    true
                }
            },
            ConnState::AppCloseWait1 => {
                // passive close in progress on the other side
                if !conn.rxed_any_close() {
                    close_stream_wait(conn, linger).await;
                }
                if conn.move_state(ConnState::AppCloseWait1, ConnState::AppCloseWait2) {
                    keep_first(&mut first_err, close_wr(conn));
                    false
                } else {
                    true
                }
            },
            _ => false,
        };
        if !again {
            break;
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Local abort: communication is no longer possible. The connection error
/// is the single source of truth for the failure.
pub fn close_active_abort(conn: &Arc<Connection>) {
    if conn.state() != ConnState::Init {
        conn.set_sk_err(ErrCode::ConnAborted);
    }
    match conn.state() {
        ConnState::Active
        | ConnState::AppCloseWait1
        | ConnState::AppCloseWait2
        | ConnState::PeerCloseWait1
        | ConnState::PeerCloseWait2
        | ConnState::PeerFinCloseWait
        | ConnState::ProcessAbort
        | ConnState::AppFinCloseWait => {
            conn.set_state(ConnState::PeerAbortWait);
            conn.kill();
            conn.set_state(ConnState::Closed);
        },
        ConnState::Init | ConnState::Listen | ConnState::PeerAbortWait
        | ConnState::Closed => {},
    }
}

fn close_passive_abort_received(conn: &Arc<Connection>) {
    conn.set_sk_err(ErrCode::ConnAborted);
    match conn.state() {
        ConnState::Init | ConnState::Active | ConnState::AppCloseWait1 => {
            conn.set_state(ConnState::ProcessAbort);
        },
        ConnState::AppFinCloseWait => {
            conn.set_state(ConnState::ProcessAbort);
        },
        ConnState::PeerCloseWait1 | ConnState::PeerCloseWait2 => {
            let tx = conn.local_tx_flags();
            if tx.contains(ConnStateFlags::PEER_DONE_WRITING) && !conn.sent_any_close() {
                // just shut down, but not yet closed locally
                conn.set_state(ConnState::ProcessAbort);
            } else {
                conn.set_state(ConnState::Closed);
            }
        },
        ConnState::AppCloseWait2
        | ConnState::PeerFinCloseWait
        | ConnState::PeerAbortWait => {
            conn.set_state(ConnState::Closed);
        },
        ConnState::ProcessAbort | ConnState::Listen | ConnState::Closed => {},
    }
}

/// Passive close: some closing flag was received (`peer_conn_closed`,
/// `peer_conn_abort` or `peer_done_writing`) or the link group died. The
/// only place that wakes blocked users.
pub fn close_passive_work(conn: &Arc<Connection>) {
    let rx_flags = conn.rx_flags();
    let old = conn.state();

    if rx_flags.contains(ConnStateFlags::PEER_CONN_ABORT) {
        // peer has not received all data
        close_passive_abort_received(conn);
    } else {
        match conn.state() {
            ConnState::Init | ConnState::Active => {
                conn.set_state(ConnState::AppCloseWait1);
            },
            ConnState::PeerCloseWait1 | ConnState::PeerCloseWait2 => {
                if conn.state() == ConnState::PeerCloseWait1
                    && rx_flags.contains(ConnStateFlags::PEER_DONE_WRITING)
                {
                    conn.set_state(ConnState::PeerCloseWait2);
                }
                if conn.rxed_any_close() {
                    if conn.sent_any_close() {
                        conn.set_state(ConnState::Closed);
                    } else {
                        // just shutdown, but not yet closed locally
                        conn.set_state(ConnState::AppCloseWait1);
                    }
                }
            },
            ConnState::PeerFinCloseWait | ConnState::AppFinCloseWait => {
                if conn.rxed_any_close() {
                    conn.set_state(ConnState::Closed);
                }
            },
            _ => {},
        }
    }

    if old != conn.state() {
        debug!(from = ?old, to = ?conn.state(), "passive close transition");
    }
    if conn.state() == ConnState::Closed && old != ConnState::Closed {
        debug!(conn = conn.cfg().conn_id, "connection closed");
    }
    conn.data_ready.notify_waiters();
    conn.write_space.notify_waiters();
}
