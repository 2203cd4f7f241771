// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Error taxonomy of the runtime.
//!
//! Data-plane operations return [`UrpcError`] directly so hot paths stay
//! allocation-free; control-plane plumbing wraps them in `anyhow` the same
//! way higher layers do for I/O. Async completion events carry the flat
//! [`ErrCode`] so the user sees one stable integer surface.

use thiserror::Error;

use crate::models::opcode::MsgStatus;

/// Completion-record status reported by the verbs provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrStatus {
    Success,
    LocalProtectionErr,
    RemoteProtectionErr,
    AccessAbort,
    AckTimeout,
    Flush,
    RnrRetryExceeded,
    DataPoison,
}

/// Flat error code carried on async events and task results.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrCode {
    #[default]
    Success = 0,
    Fail,
    Timeout,
    TransportErr,
    ProtocolErr,
    ResourceErr,
    ProviderErr,
    PeerDecline,
    Canceled,
    ConnAborted,
    ForceExit = i32::MAX,
}

#[derive(Debug, Error)]
pub enum UrpcError {
    /// Bad depths, unknown trans mode, malformed TLV and friends.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// Out of memory, credits, TX slots or RX buffers.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    #[error("buffer allocation failed")]
    AllocFailed,

    /// TCP side-band trouble: disconnects, handshake failures, short frames.
    #[error("transport: {0}")]
    Transport(String),

    /// Wire-format violation: bad header, unsupported version, TLV overrun.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Completion with an error status from the verbs provider.
    #[error("provider completion error: {0:?}")]
    Provider(CrStatus),

    /// Status code the peer put into a RSP head.
    #[error("peer reported: {0:?}")]
    Peer(MsgStatus),

    /// Flow control window is empty; retry after the peer advertises.
    #[error("send flow-controlled")]
    Backpressure,

    /// No free WR slot right now; back off and retry.
    #[error("no free work-request slot")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("canceled")]
    Canceled,

    /// Connection was aborted, locally or by the peer.
    #[error("connection aborted")]
    ConnAborted,

    /// Queue/channel/task is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    State(&'static str),

    /// Handle does not resolve to a live object.
    #[error("stale or unknown handle")]
    BadHandle,
}

impl UrpcError {
    pub fn err_code(&self) -> ErrCode {
        match self {
            UrpcError::Config(_) | UrpcError::Protocol(_) => ErrCode::ProtocolErr,
            UrpcError::Exhausted(_) | UrpcError::AllocFailed | UrpcError::Busy => {
                ErrCode::ResourceErr
            },
            UrpcError::Transport(_) => ErrCode::TransportErr,
            UrpcError::Provider(_) => ErrCode::ProviderErr,
            UrpcError::Peer(MsgStatus::ServerDecline) => ErrCode::PeerDecline,
            UrpcError::Peer(_) => ErrCode::Fail,
            UrpcError::Backpressure => ErrCode::ResourceErr,
            UrpcError::Timeout => ErrCode::Timeout,
            UrpcError::Canceled => ErrCode::Canceled,
            UrpcError::ConnAborted => ErrCode::ConnAborted,
            UrpcError::State(_) | UrpcError::BadHandle => ErrCode::Fail,
        }
    }
}

pub type UrpcResult<T> = std::result::Result<T, UrpcError>;
