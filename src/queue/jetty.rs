// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! The queue object: one ordered jetty carrying work requests and
//! completions, with RX replenishment, TX slot reservation and credit
//! bookkeeping.
//!
//! Ordering: WQEs posted to the same queue complete in issue order for
//! SEND/WRITE; for WRITE_IMM the peer observes the landed data before the
//! IMM completion is delivered, which is why the immediate word can double
//! as a credit carrier.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU8, AtomicU64, Ordering},
};

use tracing::{debug, warn};

use crate::{
    errors::{CrStatus, UrpcError, UrpcResult},
    models::imm::{ImmData, ImmType},
    provider::{
        Completion, IoDirection, Jetty, JettyCfg, Provider, RemoteSge, Sge, WorkReqOp,
        WorkRequest,
    },
    queue::{
        buf::{DEFAULT_PAGE_SIZE, QueueBuf},
        credit::{CreditMode, CreditPool, CreditStats},
        cursor::{AtomicCursor, Cursor},
        flow_control::{Advert, FlowControl, FlowControlCfg, FlowControlStats},
    },
};

/// How bytes move to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransMode {
    /// Native two-sided send/recv.
    SendRecv,
    /// One-sided READ pull.
    Read,
    /// WRITE_IMM push; the immediate word carries credits.
    WriteImm,
    /// In-process shared memory.
    IpcShared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Polling,
    Interrupt,
}

/// Ownership state machine of a queue. Provider async events and `modify`
/// calls drive the transitions; every data op fast-fails unless the queue
/// is `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueOwnState {
    Idle = 0,
    Running = 1,
    Reset = 2,
    Error = 3,
    Ready = 4,
    Fault = 5,
    Err = 6,
}

impl QueueOwnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Reset,
            3 => Self::Error,
            4 => Self::Ready,
            5 => Self::Fault,
            _ => Self::Err,
        }
    }

    fn can_move_to(self, next: QueueOwnState) -> bool {
        use QueueOwnState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Reset)
                | (Running, Error)
                | (Reset, Ready)
                | (Reset, Fault)
                | (Error, Ready)
                | (Error, Fault)
                | (Ready, Running)
                | (_, Err)
        )
    }
}

#[derive(Debug, Clone)]
pub struct QueueCfg {
    pub trans_mode: TransMode,
    pub rx_depth: u32,
    pub tx_depth: u32,
    pub rx_buf_size: u32,
    pub tx_buf_size: u32,
    pub max_sge: u32,
    pub priority: u8,
    pub custom_flag: u8,
    pub mode: QueueMode,
    pub io_lock_free: bool,
    pub flow_control: bool,
    /// Post RX WRs into this queue's ring instead of allocating one.
    pub share_rq_with: Option<Arc<Queue>>,
    /// Share the partner's TX completion plane.
    pub share_tx_cq_with: Option<Arc<Queue>>,
}

impl Default for QueueCfg {
    fn default() -> Self {
        Self {
            trans_mode: TransMode::SendRecv,
            rx_depth: 64,
            tx_depth: 64,
            rx_buf_size: 4096,
            tx_buf_size: 4096,
            max_sge: 4,
            priority: 0,
            custom_flag: 0,
            mode: QueueMode::Polling,
            io_lock_free: false,
            flow_control: false,
            share_rq_with: None,
            share_tx_cq_with: None,
        }
    }
}

/// Peer side of a bound queue, imported during channel attach.
#[derive(Debug, Clone, Copy)]
pub struct PeerBinding {
    pub eid: [u8; 16],
    pub qid: u32,
    pub token: u32,
    pub seg_addr: u64,
    pub seg_len: u32,
    pub window_addr: u64,
    pub window_token: u32,
    pub rx_depth: u32,
}

/// One message to transmit.
#[derive(Debug)]
pub struct TxMsg<'a> {
    pub data: &'a [u8],
    pub user_ctx: u64,
}

/// Completion handed back from [`Queue::poll`], payload already located in
/// the queue's own RX ring.
#[derive(Debug)]
pub struct QueueCompletion {
    pub dir: IoDirection,
    pub status: CrStatus,
    pub byte_len: u32,
    pub entry_addr: u64,
    pub imm: Option<ImmData>,
    pub owner_qid: u32,
    pub wr_id: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStatsSnapshot {
    pub tx_posted: u64,
    pub tx_completed: u64,
    pub rx_posted: u64,
    pub rx_completed: u64,
}

/// Window-buffer layout: slot 0 holds our advertised counter (peers READ
/// it), slot 1 is the landing zone (peers WRITE into it, our READ fills it).
const WINDOW_LOCAL_SLOT: u64 = 0;
const WINDOW_LANDING_SLOT: u64 = 8;

#[derive(Debug)]
pub struct Queue {
    qid: u32,
    cfg: QueueCfg,
    state: AtomicU8,
    provider: Arc<dyn Provider>,
    jetty: Arc<dyn Jetty>,
    rx_buf: Mutex<QueueBuf>,
    tx_buf: Mutex<QueueBuf>,
    window_buf: Mutex<QueueBuf>,
    /// TX producer / finished pair and RX producer / consumer pair.
    tx_pi: AtomicCursor,
    tx_ci: AtomicCursor,
    rx_pi: AtomicCursor,
    rx_ci: AtomicCursor,
    pub credit: CreditPool,
    pub fc: FlowControl,
    peer: Mutex<Option<PeerBinding>>,
    io_lock: Mutex<()>,
    tx_posted: AtomicU64,
    tx_completed: AtomicU64,
    rx_posted: AtomicU64,
    rx_completed: AtomicU64,
    rx_seg_token: u32,
    rx_seg_addr: u64,
    rx_seg_len: u32,
    window_token: u32,
    window_addr: u64,
    notify: tokio::sync::Notify,
}

impl Queue {
    pub fn create(
        provider: Arc<dyn Provider>,
        qid: u32,
        cfg: QueueCfg,
    ) -> UrpcResult<Arc<Self>> {
        if qid > 0x00ff_ffff {
            return Err(UrpcError::Config("queue id exceeds 24 bits"));
        }
        if cfg.rx_depth == 0 || cfg.tx_depth == 0 {
            return Err(UrpcError::Config("queue depths must be non-zero"));
        }
        if let Some(partner) = &cfg.share_tx_cq_with {
            // the shared plane must absorb both producers
            if partner.cfg.tx_depth < cfg.tx_depth {
                return Err(UrpcError::Config("shared tx cq too shallow"));
            }
        }

        let mut rx_buf = if cfg.share_rq_with.is_some() {
            // shared RQ: the ring lives with the owner
            QueueBuf::alloc(1, cfg.rx_buf_size, DEFAULT_PAGE_SIZE, true)?
        } else {
            QueueBuf::alloc(cfg.rx_depth, cfg.rx_buf_size, DEFAULT_PAGE_SIZE, true)?
        };
        let mut tx_buf =
            QueueBuf::alloc(cfg.tx_depth, cfg.tx_buf_size, DEFAULT_PAGE_SIZE, true)?;
        let mut window_buf = QueueBuf::alloc(2, 8, DEFAULT_PAGE_SIZE, false)?;

        // register before any peer can learn the addresses; roll back in
        // reverse order on partial failure
        let rx_seg = rx_buf.register(provider.as_ref())?;
        if let Err(e) = tx_buf.register(provider.as_ref()) {
            let _ = rx_buf.unregister(provider.as_ref());
            return Err(e);
        }
        let window_seg = match window_buf.register(provider.as_ref()) {
            Ok(seg) => seg,
            Err(e) => {
                let _ = tx_buf.unregister(provider.as_ref());
                let _ = rx_buf.unregister(provider.as_ref());
                return Err(e);
            },
        };

        let jetty_cfg = JettyCfg {
            qid,
            tx_depth: cfg.tx_depth,
            rx_depth: cfg.rx_depth,
            max_sge: cfg.max_sge,
            tx_cq_depth: 2 * (cfg.tx_depth + 1),
            priority: cfg.priority,
        };
        let jetty = match &cfg.share_rq_with {
            Some(owner) => Arc::clone(&owner.jetty),
            None => match provider.create_jetty(&jetty_cfg) {
                Ok(j) => j,
                Err(e) => {
                    let _ = window_buf.unregister(provider.as_ref());
                    let _ = tx_buf.unregister(provider.as_ref());
                    let _ = rx_buf.unregister(provider.as_ref());
                    return Err(e);
                },
            },
        };

        let mode = if cfg.io_lock_free {
            CreditMode::LockFree
        } else {
            CreditMode::Atomic
        };
        let fc = FlowControl::new(&FlowControlCfg {
            enabled: cfg.flow_control,
            local_rx_depth: cfg.rx_depth as u16,
            remote_rx_depth: cfg.rx_depth as u16,
            initial_window: None,
            notify_interval: None,
            mode,
        });

        let q = Arc::new(Self {
            qid,
            credit: CreditPool::new(cfg.tx_depth as u16, mode),
            fc,
            state: AtomicU8::new(QueueOwnState::Idle as u8),
            provider,
            jetty,
            rx_seg_token: rx_seg.token,
            rx_seg_addr: rx_seg.addr,
            rx_seg_len: rx_seg.len,
            window_token: window_seg.token,
            window_addr: window_seg.addr,
            rx_buf: Mutex::new(rx_buf),
            tx_buf: Mutex::new(tx_buf),
            window_buf: Mutex::new(window_buf),
            tx_pi: AtomicCursor::default(),
            tx_ci: AtomicCursor::default(),
            rx_pi: AtomicCursor::default(),
            rx_ci: AtomicCursor::default(),
            peer: Mutex::new(None),
            io_lock: Mutex::new(()),
            tx_posted: AtomicU64::new(0),
            tx_completed: AtomicU64::new(0),
            rx_posted: AtomicU64::new(0),
            rx_completed: AtomicU64::new(0),
            cfg,
            notify: tokio::sync::Notify::new(),
        });
        debug!(qid, "queue created");
        Ok(q)
    }

    #[inline]
    pub fn qid(&self) -> u32 {
        self.qid
    }

    #[inline]
    pub fn cfg(&self) -> &QueueCfg {
        &self.cfg
    }

    #[inline]
    pub fn state(&self) -> QueueOwnState {
        QueueOwnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn modify(&self, next: QueueOwnState) -> UrpcResult<()> {
        let cur = self.state();
        if !cur.can_move_to(next) {
            return Err(UrpcError::State("illegal queue state transition"));
        }
        self.state.store(next as u8, Ordering::Release);
        Ok(())
    }

    /// Provider async event pushed the queue into an error state.
    pub fn on_async_error(&self) {
        let _ = self.modify(QueueOwnState::Error);
    }

    /// Descriptor of the local RX segment, exported during attach.
    pub fn export_binding(&self) -> PeerBinding {
        PeerBinding {
            eid: self.provider.local_eid(),
            qid: self.qid,
            token: self.rx_seg_token,
            seg_addr: self.rx_seg_addr,
            seg_len: self.rx_seg_len,
            window_addr: self.window_addr,
            window_token: self.window_token,
            rx_depth: self.cfg.rx_depth,
        }
    }

    /// Bind to the peer queue and start running. Posts the initial RX ring.
    pub fn bind_peer(&self, peer: PeerBinding) -> UrpcResult<()> {
        self.jetty.connect(peer.eid, peer.qid)?;
        *self.peer.lock().expect("peer lock poisoned") = Some(peer);
        if self.state() == QueueOwnState::Idle {
            self.modify(QueueOwnState::Running)?;
        }
        self.rx_post(self.cfg.rx_depth)?;
        Ok(())
    }

    pub fn peer_binding(&self) -> Option<PeerBinding> {
        *self.peer.lock().expect("peer lock poisoned")
    }

    #[inline]
    fn check_running(&self) -> UrpcResult<()> {
        if self.state() != QueueOwnState::Running {
            return Err(UrpcError::State("queue not running"));
        }
        Ok(())
    }

    #[inline]
    fn io_guard(&self) -> Option<std::sync::MutexGuard<'_, ()>> {
        (!self.cfg.io_lock_free).then(|| self.io_lock.lock().expect("io lock poisoned"))
    }

    /// Post `n` RX buffers from the ring and account them with the
    /// flow-control engine.
    pub fn rx_post(&self, n: u32) -> UrpcResult<()> {
        {
            let _io = self.io_guard();
            match &self.cfg.share_rq_with {
                Some(owner) => owner.rx_post_raw(n, self.qid)?,
                None => self.rx_post_raw(n, self.qid)?,
            }
        }
        self.fc_account_posted(n);
        Ok(())
    }

    fn rx_post_raw(&self, n: u32, owner_qid: u32) -> UrpcResult<()> {
        let rx_buf = self.rx_buf.lock().expect("rx buf lock poisoned");
        let handle = rx_buf.mem_handle().ok_or(UrpcError::BadHandle)?;
        for _ in 0..n {
            let pi = self.rx_pi.load();
            let ci = self.rx_ci.load();
            if Cursor::diff(rx_buf.entry_cnt, &ci, &pi) >= self.cfg.rx_depth {
                return Err(UrpcError::Exhausted("rx depth"));
            }
            let slot = pi.count & rx_buf.entry_mask;
            let addr = rx_buf.entry_addr(slot);
            let wr = WorkRequest {
                wr_id: ((owner_qid as u64) << 32) | slot as u64,
                op: WorkReqOp::Send, // direction comes from the ring
                sges: vec![Sge {
                    addr,
                    len: rx_buf.entry_size(),
                    mem_handle: handle,
                }],
                remote: None,
                owner_qid,
                user_ctx: addr,
            };
            self.jetty.post_rx(wr)?;
            self.rx_pi.update(|c| c.add(rx_buf.entry_cnt, 1));
            self.rx_posted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Account posted buffers with the flow-control engine and run whatever
    /// advertisement it asks for.
    fn fc_account_posted(&self, n: u32) {
        match self.fc.rq_posted_inc(n as u16) {
            Advert::None => {},
            Advert::Bootstrap(credits) => {
                if let Err(e) = self.fc_window_bootstrap(credits) {
                    warn!(qid = self.qid, "window bootstrap failed: {e}");
                    self.fc.recover_tx_imm(credits);
                }
            },
            Advert::Notify(credits) => {
                if let Err(e) = self.send_fc_imm(ImmType::FlowControl, credits) {
                    warn!(qid = self.qid, "flow-control advert failed: {e}");
                    self.fc.recover_tx_imm(credits);
                }
            },
        }
    }

    /// One-shot window exchange: WRITE our accumulated counter into the
    /// peer's landing slot and READ the peer's advertised slot into ours.
    fn fc_window_bootstrap(&self, credits: u16) -> UrpcResult<()> {
        let peer = self
            .peer_binding()
            .ok_or(UrpcError::State("queue not bound"))?;
        let win = self.window_buf.lock().expect("window lock poisoned");
        let handle = win.mem_handle().ok_or(UrpcError::BadHandle)?;
        unsafe {
            *((win.base_addr() + WINDOW_LOCAL_SLOT) as *mut u64) = credits as u64;
        }
        let write_wr = WorkRequest {
            wr_id: u64::MAX - 1,
            op: WorkReqOp::Write,
            sges: vec![Sge {
                addr: win.base_addr() + WINDOW_LOCAL_SLOT,
                len: 8,
                mem_handle: handle,
            }],
            remote: Some(RemoteSge {
                addr: peer.window_addr + WINDOW_LANDING_SLOT,
                len: 8,
                token: peer.window_token,
            }),
            owner_qid: self.qid,
            user_ctx: credits as u64,
        };
        self.jetty.post_tx(write_wr)?;
        let read_wr = WorkRequest {
            wr_id: u64::MAX - 2,
            op: WorkReqOp::Read,
            sges: vec![Sge {
                addr: win.base_addr() + WINDOW_LANDING_SLOT,
                len: 8,
                mem_handle: handle,
            }],
            remote: Some(RemoteSge {
                addr: peer.window_addr + WINDOW_LOCAL_SLOT,
                len: 8,
                token: peer.window_token,
            }),
            owner_qid: self.qid,
            user_ctx: 0,
        };
        self.jetty.post_tx(read_wr)?;
        Ok(())
    }

    /// Absorb whatever landed in the window slots (bootstrap WRITE from the
    /// peer or our own READ). Idempotent: the landing slot is cleared.
    pub fn fc_absorb_window(&self) {
        if !self.fc.enabled() {
            return;
        }
        let win = self.window_buf.lock().expect("window lock poisoned");
        let landing = (win.base_addr() + WINDOW_LANDING_SLOT) as *mut u64;
        let v = unsafe { landing.read() };
        if v != 0 {
            unsafe { landing.write(0) };
            self.fc.remote_window_inc(v.min(u16::MAX as u64) as u16);
        }
    }

    fn send_fc_imm(&self, imm_type: ImmType, credits: u16) -> UrpcResult<()> {
        self.check_running()?;
        let wr = WorkRequest {
            wr_id: u64::MAX,
            op: WorkReqOp::SendImm(ImmData::new(
                credits.min(u8::MAX as u16) as u8,
                false,
                false,
                imm_type as u32,
            )),
            sges: Vec::new(),
            remote: None,
            owner_qid: self.qid,
            user_ctx: 0,
        };
        self.jetty.post_tx(wr)
    }

    /// Ask the peer to allocate shared-pool credits for this queue. A single
    /// request may be outstanding at a time; repeats are dropped and counted.
    pub fn shared_credit_request(&self, want: u16) -> UrpcResult<()> {
        if !self.fc.credit_apply_begin() {
            return Err(UrpcError::Busy);
        }
        match self.send_fc_imm(ImmType::FcCreditReq, want) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fc.credit_apply_end();
                Err(e)
            },
        }
    }

    /// Reserve a TX slot, stage `msg` into the ring and post it.
    pub fn tx_post(&self, msg: &TxMsg<'_>) -> UrpcResult<u64> {
        self.check_running()?;
        let _io = self.io_guard();

        let mut tx_buf = self.tx_buf.lock().expect("tx buf lock poisoned");
        if msg.data.len() > tx_buf.entry_size() as usize {
            return Err(UrpcError::Config("message exceeds tx entry size"));
        }
        let pi = self.tx_pi.load();
        let ci = self.tx_ci.load();
        if Cursor::diff(tx_buf.entry_cnt, &ci, &pi) >= self.cfg.tx_depth {
            return Err(UrpcError::Exhausted("tx depth"));
        }
        if !self.fc.try_consume(1) {
            return Err(UrpcError::Backpressure);
        }

        let slot = pi.count & tx_buf.entry_mask;
        let entry_addr = tx_buf.entry_addr(slot);
        unsafe {
            std::ptr::copy_nonoverlapping(
                msg.data.as_ptr(),
                entry_addr as *mut u8,
                msg.data.len(),
            );
        }
        if let Some(wrid) = &mut tx_buf.wrid {
            wrid[slot as usize] = msg.user_ctx;
        }

        let credits = self.fc.fill_tx_imm();
        let handle = tx_buf.mem_handle().ok_or(UrpcError::BadHandle)?;
        let wr_id = ((self.qid as u64) << 32) | slot as u64;
        let sge = Sge {
            addr: entry_addr,
            len: msg.data.len() as u32,
            mem_handle: handle,
        };
        let entry_shift = tx_buf.base_shift;
        let entry_cnt = tx_buf.entry_cnt;
        drop(tx_buf);

        // the consumed RQE names the owning queue; the imm token space stays
        // reserved for the flow-control sub-opcodes
        let wr = match self.cfg.trans_mode {
            TransMode::SendRecv | TransMode::IpcShared => WorkRequest {
                wr_id,
                op: if self.fc.enabled() {
                    WorkReqOp::SendImm(ImmData::new(
                        credits,
                        false,
                        false,
                        crate::models::imm::TOKEN_DATA,
                    ))
                } else {
                    WorkReqOp::Send
                },
                sges: vec![sge],
                remote: None,
                owner_qid: self.qid,
                user_ctx: credits as u64,
            },
            TransMode::WriteImm => {
                let peer = self
                    .peer_binding()
                    .ok_or(UrpcError::State("queue not bound"))?;
                let off = ((slot as u64) << entry_shift) % peer.seg_len.max(1) as u64;
                let write_blocked = msg.data.len() as u64 > peer.seg_len as u64 - off;
                WorkRequest {
                    wr_id,
                    op: WorkReqOp::WriteImm(ImmData::new(
                        credits,
                        write_blocked,
                        false,
                        crate::models::imm::TOKEN_DATA,
                    )),
                    sges: vec![sge],
                    remote: Some(RemoteSge {
                        addr: peer.seg_addr + off,
                        len: msg.data.len() as u32,
                        token: peer.token,
                    }),
                    owner_qid: self.qid,
                    user_ctx: credits as u64,
                }
            },
            TransMode::Read => {
                let peer = self
                    .peer_binding()
                    .ok_or(UrpcError::State("queue not bound"))?;
                WorkRequest {
                    wr_id,
                    op: WorkReqOp::Read,
                    sges: vec![sge],
                    remote: Some(RemoteSge {
                        addr: peer.seg_addr,
                        len: msg.data.len() as u32,
                        token: peer.token,
                    }),
                    owner_qid: self.qid,
                    user_ctx: credits as u64,
                }
            },
        };

        match self.jetty.post_tx(wr) {
            Ok(()) => {
                self.tx_pi.update(|c| c.add(entry_cnt, 1));
                self.tx_posted.fetch_add(1, Ordering::Relaxed);
                Ok(wr_id)
            },
            Err(e) => {
                // the advertisement never reached the wire; take everything
                // back so the window stays accountable
                self.fc.recover_tx_imm(credits as u16);
                self.fc.remote_window_inc(1);
                Err(e)
            },
        }
    }

    /// Poll up to `max` completions. RX completions update cursors, harvest
    /// piggybacked credits and replenish the consumed ring entry.
    pub fn poll(&self, dir: IoDirection, max: usize) -> Vec<QueueCompletion> {
        self.fc_absorb_window();
        let mut raw = Vec::with_capacity(max);
        self.jetty.poll(dir, max, &mut raw);
        let mut out = Vec::with_capacity(raw.len());
        for c in raw {
            out.push(self.absorb_completion(c));
        }
        out
    }

    fn absorb_completion(&self, c: Completion) -> QueueCompletion {
        let entry_addr = match c.dir {
            IoDirection::Rx => {
                self.rx_completed.fetch_add(1, Ordering::Relaxed);
                self.rx_ci.update(|cur| {
                    cur.add(self.rx_ring_entry_cnt(), 1);
                });
                self.fc.rx_consumed_inc(1);
                if let Some(imm) = c.imm {
                    match imm.imm_type() {
                        Some(ImmType::FcCreditReq) => {
                            // peer asks for shared credits; grant from idle
                            let granted = self.credit.dec(imm.credits() as u16);
                            if granted > 0
                                && let Err(e) =
                                    self.send_fc_imm(ImmType::FcCreditRep, granted)
                            {
                                self.credit.inc(granted);
                                debug!(qid = self.qid, "credit grant failed: {e}");
                            }
                        },
                        Some(ImmType::FcCreditRep) => {
                            self.fc.remote_window_inc(imm.credits() as u16);
                            self.fc.credit_apply_end();
                        },
                        Some(ImmType::FlowControl) | None => {
                            self.fc.remote_window_inc(imm.credits() as u16);
                        },
                    }
                }
                if c.status == CrStatus::Success && c.owner_qid == self.qid {
                    // put the consumed entry back on the wire
                    if let Err(e) = self.rx_post(1) {
                        debug!(qid = self.qid, "rx replenish deferred: {e}");
                    }
                }
                c.user_ctx // RX WRs carry the entry address as user_ctx
            },
            IoDirection::Tx => {
                self.tx_completed.fetch_add(1, Ordering::Relaxed);
                self.tx_ci.update(|cur| {
                    cur.add(self.tx_ring_entry_cnt(), 1);
                });
                0
            },
        };
        if self.cfg.mode == QueueMode::Interrupt {
            self.notify.notify_waiters();
        }
        QueueCompletion {
            dir: c.dir,
            status: c.status,
            byte_len: c.byte_len,
            entry_addr,
            imm: c.imm,
            owner_qid: c.owner_qid,
            wr_id: c.wr_id,
        }
    }

    fn rx_ring_entry_cnt(&self) -> u32 {
        self.rx_buf.lock().expect("rx buf lock poisoned").entry_cnt
    }

    fn tx_ring_entry_cnt(&self) -> u32 {
        self.tx_buf.lock().expect("tx buf lock poisoned").entry_cnt
    }

    /// Read payload bytes out of an RX completion.
    pub fn rx_payload(&self, comp: &QueueCompletion) -> Vec<u8> {
        let len = comp.byte_len as usize;
        unsafe {
            std::slice::from_raw_parts(comp.entry_addr as *const u8, len).to_vec()
        }
    }

    /// User context recorded for a TX completion's slot.
    pub fn tx_user_ctx(&self, wr_id: u64) -> Option<u64> {
        let tx_buf = self.tx_buf.lock().expect("tx buf lock poisoned");
        let slot = (wr_id as u32) & tx_buf.entry_mask;
        tx_buf.wrid.as_ref().map(|w| w[slot as usize])
    }

    /// Waitable handle for interrupt-mode queues.
    pub fn interrupt_handle(&self) -> UrpcResult<&tokio::sync::Notify> {
        if self.cfg.mode != QueueMode::Interrupt {
            return Err(UrpcError::State("queue is in polling mode"));
        }
        Ok(&self.notify)
    }

    pub fn query(&self) -> (QueueCfg, QueueStatsSnapshot, CreditStats, FlowControlStats) {
        (
            self.cfg.clone(),
            QueueStatsSnapshot {
                tx_posted: self.tx_posted.load(Ordering::Relaxed),
                tx_completed: self.tx_completed.load(Ordering::Relaxed),
                rx_posted: self.rx_posted.load(Ordering::Relaxed),
                rx_completed: self.rx_completed.load(Ordering::Relaxed),
            },
            self.credit.stats(),
            self.fc.stats(),
        )
    }

    /// Outstanding TX work requests still waiting for completion.
    pub fn tx_outstanding(&self) -> u64 {
        self.tx_posted.load(Ordering::Acquire) - self.tx_completed.load(Ordering::Acquire)
    }

    /// Tear the queue down. Refuses while TX work is outstanding; leaked RX
    /// credits are accounted before the buffers go away.
    pub fn destroy(&self) -> UrpcResult<()> {
        if self.tx_outstanding() != 0 {
            return Err(UrpcError::Busy);
        }
        let leak = self.fc.teardown_leak();
        if leak > 0 {
            self.credit.leak(leak);
        }
        let mut tx_buf = self.tx_buf.lock().expect("tx buf lock poisoned");
        let mut rx_buf = self.rx_buf.lock().expect("rx buf lock poisoned");
        let mut window_buf = self.window_buf.lock().expect("window lock poisoned");
        tx_buf.unregister(self.provider.as_ref())?;
        rx_buf.unregister(self.provider.as_ref())?;
        window_buf.unregister(self.provider.as_ref())?;
        self.state.store(QueueOwnState::Err as u8, Ordering::Release);
        debug!(qid = self.qid, "queue destroyed");
        Ok(())
    }
}
