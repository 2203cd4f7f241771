// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! In-process provider: jetties are matched by `(eid, qid)` inside one
//! fabric, data moves with plain memory copies. Backs the IPC trans mode
//! and every data-plane test; the semantics mirror what a hardware provider
//! guarantees (post order, RQE consumption for SEND and WRITE_IMM, token
//! checks on one-sided access).

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    errors::{CrStatus, UrpcError, UrpcResult},
    provider::{
        Completion, IoDirection, Jetty, JettyCfg, JettyState, MemHandle, Provider,
        RegisteredSeg, RemoteSge, WorkReqOp, WorkRequest,
    },
};

/// One shared fabric; every provider created from it can reach every other.
#[derive(Debug, Default)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

/// The fabric every in-process endpoint shares, standing in for the host's
/// shared memory.
pub fn process_fabric() -> &'static LoopbackFabric {
    static FABRIC: once_cell::sync::Lazy<LoopbackFabric> =
        once_cell::sync::Lazy::new(LoopbackFabric::new);
    &FABRIC
}

#[derive(Debug, Default)]
struct FabricInner {
    segs: DashMap<u64, RegisteredSeg>,
    next_handle: AtomicU64,
    next_token: AtomicU32,
    jetties: DashMap<([u8; 16], u32), Arc<LoopbackJetty>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self, eid: [u8; 16]) -> Arc<LoopbackProvider> {
        Arc::new(LoopbackProvider {
            eid,
            fabric: Arc::clone(&self.inner),
        })
    }
}

#[derive(Debug)]
pub struct LoopbackProvider {
    eid: [u8; 16],
    fabric: Arc<FabricInner>,
}

impl Provider for LoopbackProvider {
    fn register(&self, addr: u64, len: u32) -> UrpcResult<RegisteredSeg> {
        let handle = self.fabric.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.fabric.next_token.fetch_add(1, Ordering::Relaxed) + 0x100;
        let seg = RegisteredSeg {
            handle: MemHandle(handle),
            token,
            addr,
            len,
        };
        self.fabric.segs.insert(handle, seg);
        Ok(seg)
    }

    fn unregister(&self, handle: MemHandle) -> UrpcResult<()> {
        self.fabric
            .segs
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(UrpcError::BadHandle)
    }

    fn create_jetty(&self, cfg: &JettyCfg) -> UrpcResult<Arc<dyn Jetty>> {
        if cfg.tx_depth == 0 || cfg.rx_depth == 0 {
            return Err(UrpcError::Config("jetty depths must be non-zero"));
        }
        let jetty = Arc::new(LoopbackJetty {
            cfg: cfg.clone(),
            eid: self.eid,
            fabric: Arc::downgrade(&self.fabric),
            peer: Mutex::new(None),
            rx_posted: Mutex::new(VecDeque::with_capacity(cfg.rx_depth as usize)),
            tx_cq: Mutex::new(VecDeque::new()),
            rx_cq: Mutex::new(VecDeque::new()),
            state: AtomicU8::new(STATE_WORKING),
        });
        self.fabric
            .jetties
            .insert((self.eid, cfg.qid), Arc::clone(&jetty));
        Ok(jetty)
    }

    fn local_eid(&self) -> [u8; 16] {
        self.eid
    }
}

const STATE_WORKING: u8 = 0;
const STATE_ERROR: u8 = 1;
const STATE_FATAL: u8 = 2;

#[derive(Debug)]
pub struct LoopbackJetty {
    cfg: JettyCfg,
    eid: [u8; 16],
    fabric: Weak<FabricInner>,
    peer: Mutex<Option<([u8; 16], u32)>>,
    rx_posted: Mutex<VecDeque<WorkRequest>>,
    tx_cq: Mutex<VecDeque<Completion>>,
    rx_cq: Mutex<VecDeque<Completion>>,
    state: AtomicU8,
}

impl LoopbackJetty {
    fn peer_jetty(&self) -> UrpcResult<Arc<LoopbackJetty>> {
        let fabric = self.fabric.upgrade().ok_or(UrpcError::BadHandle)?;
        let key = self
            .peer
            .lock()
            .expect("peer lock poisoned")
            .ok_or(UrpcError::State("jetty not connected"))?;
        fabric
            .jetties
            .get(&key)
            .map(|j| Arc::clone(j.value()))
            .ok_or(UrpcError::State("peer jetty gone"))
    }

    fn validate_remote(&self, remote: &RemoteSge, len: u32) -> UrpcResult<()> {
        let fabric = self.fabric.upgrade().ok_or(UrpcError::BadHandle)?;
        let covered = fabric.segs.iter().any(|seg| {
            seg.token == remote.token
                && remote.addr >= seg.addr
                && remote.addr + len as u64 <= seg.addr + seg.len as u64
        });
        if covered {
            Ok(())
        } else {
            Err(UrpcError::Provider(CrStatus::RemoteProtectionErr))
        }
    }

    fn gather(sges: &[crate::provider::Sge]) -> Vec<u8> {
        let mut out = Vec::new();
        for sge in sges {
            // addresses point into queue buffers owned by live Queue objects
            let src = unsafe {
                std::slice::from_raw_parts(sge.addr as *const u8, sge.len as usize)
            };
            out.extend_from_slice(src);
        }
        out
    }

    fn scatter(sges: &[crate::provider::Sge], data: &[u8]) -> UrpcResult<u32> {
        let cap: u64 = sges.iter().map(|s| s.len as u64).sum();
        if (data.len() as u64) > cap {
            return Err(UrpcError::Provider(CrStatus::LocalProtectionErr));
        }
        let mut off = 0usize;
        for sge in sges {
            if off == data.len() {
                break;
            }
            let n = (sge.len as usize).min(data.len() - off);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data[off..].as_ptr(),
                    sge.addr as *mut u8,
                    n,
                );
            }
            off += n;
        }
        Ok(data.len() as u32)
    }

    fn complete_tx(&self, wr: &WorkRequest, byte_len: u32) {
        self.tx_cq
            .lock()
            .expect("tx cq lock poisoned")
            .push_back(Completion {
                wr_id: wr.wr_id,
                status: CrStatus::Success,
                dir: IoDirection::Tx,
                byte_len,
                imm: None,
                owner_qid: wr.owner_qid,
                user_ctx: wr.user_ctx,
            });
    }
}

impl Jetty for LoopbackJetty {
    fn post_tx(&self, wr: WorkRequest) -> UrpcResult<()> {
        if self.state() != JettyState::Working {
            return Err(UrpcError::State("jetty not working"));
        }
        if wr.sges.len() > self.cfg.max_sge as usize {
            return Err(UrpcError::Config("sge list exceeds max_sge"));
        }
        let peer = self.peer_jetty()?;

        match wr.op {
            WorkReqOp::Send | WorkReqOp::SendImm(_) => {
                let data = Self::gather(&wr.sges);
                let rx_wr = peer
                    .rx_posted
                    .lock()
                    .expect("rx lock poisoned")
                    .pop_front()
                    .ok_or(UrpcError::Provider(CrStatus::RnrRetryExceeded))?;
                let byte_len = Self::scatter(&rx_wr.sges, &data)?;
                let imm = match wr.op {
                    WorkReqOp::SendImm(imm) => Some(imm),
                    _ => None,
                };
                peer.rx_cq
                    .lock()
                    .expect("rx cq lock poisoned")
                    .push_back(Completion {
                        wr_id: rx_wr.wr_id,
                        status: CrStatus::Success,
                        dir: IoDirection::Rx,
                        byte_len,
                        imm,
                        owner_qid: rx_wr.owner_qid,
                        user_ctx: rx_wr.user_ctx,
                    });
                self.complete_tx(&wr, byte_len);
            },
            WorkReqOp::Write | WorkReqOp::WriteImm(_) => {
                let data = Self::gather(&wr.sges);
                let remote = wr
                    .remote
                    .ok_or(UrpcError::Config("write without remote sge"))?;
                self.validate_remote(&remote, data.len() as u32)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        remote.addr as *mut u8,
                        data.len(),
                    );
                }
                if let WorkReqOp::WriteImm(imm) = wr.op {
                    // the data is visible before the IMM completion lands
                    let rx_wr = peer
                        .rx_posted
                        .lock()
                        .expect("rx lock poisoned")
                        .pop_front()
                        .ok_or(UrpcError::Provider(CrStatus::RnrRetryExceeded))?;
                    peer.rx_cq
                        .lock()
                        .expect("rx cq lock poisoned")
                        .push_back(Completion {
                            wr_id: rx_wr.wr_id,
                            status: CrStatus::Success,
                            dir: IoDirection::Rx,
                            byte_len: data.len() as u32,
                            imm: Some(imm),
                            owner_qid: rx_wr.owner_qid,
                            user_ctx: rx_wr.user_ctx,
                        });
                }
                self.complete_tx(&wr, data.len() as u32);
            },
            WorkReqOp::Read => {
                let remote = wr
                    .remote
                    .ok_or(UrpcError::Config("read without remote sge"))?;
                let cap: u64 = wr.sges.iter().map(|s| s.len as u64).sum();
                let len = (remote.len as u64).min(cap) as u32;
                self.validate_remote(&remote, len)?;
                let data = unsafe {
                    std::slice::from_raw_parts(remote.addr as *const u8, len as usize)
                        .to_vec()
                };
                Self::scatter(&wr.sges, &data)?;
                self.complete_tx(&wr, len);
            },
        }
        Ok(())
    }

    fn post_rx(&self, wr: WorkRequest) -> UrpcResult<()> {
        let mut posted = self.rx_posted.lock().expect("rx lock poisoned");
        if posted.len() >= self.cfg.rx_depth as usize {
            return Err(UrpcError::Exhausted("rx depth"));
        }
        posted.push_back(wr);
        Ok(())
    }

    fn poll(&self, dir: IoDirection, max: usize, out: &mut Vec<Completion>) -> usize {
        let cq = match dir {
            IoDirection::Tx => &self.tx_cq,
            IoDirection::Rx => &self.rx_cq,
        };
        let mut cq = cq.lock().expect("cq lock poisoned");
        let n = max.min(cq.len());
        out.extend(cq.drain(..n));
        n
    }

    fn connect(&self, peer_eid: [u8; 16], peer_qid: u32) -> UrpcResult<()> {
        debug!(qid = self.cfg.qid, peer_qid, "loopback jetty connect");
        *self.peer.lock().expect("peer lock poisoned") = Some((peer_eid, peer_qid));
        Ok(())
    }

    fn state(&self) -> JettyState {
        match self.state.load(Ordering::Acquire) {
            STATE_WORKING => JettyState::Working,
            STATE_ERROR => JettyState::Error,
            _ => JettyState::Fatal,
        }
    }

    fn modify_to_working(&self) -> UrpcResult<()> {
        if self.state.load(Ordering::Acquire) == STATE_FATAL {
            return Err(UrpcError::State("jetty is fatal"));
        }
        self.state.store(STATE_WORKING, Ordering::Release);
        Ok(())
    }
}

impl LoopbackJetty {
    /// Test hook: push the jetty into an error state as a provider async
    /// event would.
    pub fn inject_error(&self) {
        self.state.store(STATE_ERROR, Ordering::Release);
    }

    /// EID this jetty answers on.
    pub fn eid(&self) -> [u8; 16] {
        self.eid
    }
}
