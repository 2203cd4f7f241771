// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

pub mod close;
pub mod connection;

/// Lifecycle states of a memory-socket connection.
///
/// `App*` states mean the application side still owes an action, `Peer*`
/// states mean we are waiting on the peer. Both close directions meet in
/// `Closed`; aborts shortcut through `ProcessAbort` / `PeerAbortWait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Listen,
    Active,
    /// We closed or shut down writes; waiting for the peer to finish.
    PeerCloseWait1,
    /// Peer is done writing too; waiting for its close.
    PeerCloseWait2,
    /// Peer announced close/shutdown; the application has not closed yet.
    AppCloseWait1,
    /// We confirmed shutdown-write after the peer's announcement.
    AppCloseWait2,
    /// Application closed after the peer did; final flush pending.
    AppFinCloseWait,
    /// We closed first and confirmed the peer's shutdown; its close pends.
    PeerFinCloseWait,
    /// Local abort in progress.
    ProcessAbort,
    /// Peer abort observed; local cleanup pending.
    PeerAbortWait,
    Closed,
}

/// Urgent-data latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrgState {
    #[default]
    Invalid,
    /// The urgent byte has arrived and was not consumed yet.
    Valid,
    /// The urgent byte was delivered via MSG_OOB.
    Read,
}

pub use connection::{CdcTransport, ConnCfg, Connection};
