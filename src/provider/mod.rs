// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Abstract verbs-provider contract consumed by the queue layer.
//!
//! The runtime never talks to fabric hardware directly: it programs against
//! a jetty (send queue + receive/completion plane) that accepts SEND /
//! SEND_IMM / WRITE / WRITE_IMM / READ work requests and yields completion
//! records on poll. Registration of queue memory produces an opaque segment
//! handle plus the access token peers must present.

pub mod loopback;

use std::fmt;

use crate::{
    errors::{CrStatus, UrpcResult},
    models::imm::ImmData,
};

/// Opaque handle of a registered memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u64);

/// Registration result: the handle plus the token peers present on access.
#[derive(Debug, Clone, Copy)]
pub struct RegisteredSeg {
    pub handle: MemHandle,
    pub token: u32,
    pub addr: u64,
    pub len: u32,
}

/// Scatter-gather element over a registered region.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub mem_handle: MemHandle,
}

/// Remote target of a one-sided operation.
#[derive(Debug, Clone, Copy)]
pub struct RemoteSge {
    pub addr: u64,
    pub len: u32,
    pub token: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum WorkReqOp {
    Send,
    SendImm(ImmData),
    Write,
    WriteImm(ImmData),
    Read,
}

/// One posted work request. `user_ctx` rides into the matching completion
/// and is where the flow-control engine parks the advertisement it intends
/// to piggyback, so failed posts can return the credits.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub wr_id: u64,
    pub op: WorkReqOp,
    pub sges: Vec<Sge>,
    pub remote: Option<RemoteSge>,
    /// Queue that owns this WR; routes shared-RQ/CQ completions back home.
    pub owner_qid: u32,
    pub user_ctx: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Tx,
    Rx,
}

/// Completion record polled from a jetty.
#[derive(Debug, Clone)]
pub struct Completion {
    pub wr_id: u64,
    pub status: CrStatus,
    pub dir: IoDirection,
    pub byte_len: u32,
    pub imm: Option<ImmData>,
    /// Id of the queue owning the consumed RQE; routes shared-RQ dispatch.
    pub owner_qid: u32,
    pub user_ctx: u64,
}

/// Jetty creation parameters handed down from the queue layer.
#[derive(Debug, Clone)]
pub struct JettyCfg {
    pub qid: u32,
    pub tx_depth: u32,
    pub rx_depth: u32,
    pub max_sge: u32,
    pub tx_cq_depth: u32,
    pub priority: u8,
}

/// Provider-side async state of a jetty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JettyState {
    Working,
    Error,
    Fatal,
}

/// One bidirectional verb-level queue pair.
pub trait Jetty: Send + Sync + fmt::Debug {
    fn post_tx(&self, wr: WorkRequest) -> UrpcResult<()>;

    fn post_rx(&self, wr: WorkRequest) -> UrpcResult<()>;

    fn poll(&self, dir: IoDirection, max: usize, out: &mut Vec<Completion>) -> usize;

    /// Bind to the peer jetty identified by its EID + queue id.
    fn connect(&self, peer_eid: [u8; 16], peer_qid: u32) -> UrpcResult<()>;

    fn state(&self) -> JettyState;

    /// Attempt recovery after an error state; providers may decline.
    fn modify_to_working(&self) -> UrpcResult<()>;
}

/// The fabric provider: registers memory and creates jetties.
pub trait Provider: Send + Sync + fmt::Debug {
    fn register(&self, addr: u64, len: u32) -> UrpcResult<RegisteredSeg>;

    fn unregister(&self, handle: MemHandle) -> UrpcResult<()>;

    fn create_jetty(&self, cfg: &JettyCfg) -> UrpcResult<std::sync::Arc<dyn Jetty>>;

    /// EID this provider answers on.
    fn local_eid(&self) -> [u8; 16];
}
