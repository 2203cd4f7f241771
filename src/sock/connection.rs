// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! The memory-socket connection: buffer space accounting, CDC exchange and
//! urgent data, shared with the close automaton in [`crate::sock::close`].
//!
//! Space invariants, each guarded by acquire/release pairs around the
//! updates: `bytes_to_rcv ≤ rmb_len`, `sndbuf_space ≤ sndbuf_len`,
//! `peer_rmbe_space ≤ peer_rmbe_size`.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
};

use tokio::sync::Notify;
use tracing::debug;

use crate::{
    errors::{ErrCode, UrpcError, UrpcResult},
    models::cdc::{CdcMessage, ConnStateFlags, HostCdcState, ProducerFlags},
    queue::cursor::Cursor,
    sock::{ConnState, UrgState},
};

/// Where outbound CDC frames go. The queue layer provides the real
/// implementation over a WR slot; tests wire connection pairs directly.
pub trait CdcTransport: Send + Sync {
    fn send_cdc(&self, msg: &CdcMessage) -> UrpcResult<()>;
}

/// Transport that drops frames; placeholder until a link is attached.
#[derive(Debug, Default)]
pub struct NullCdcTransport;

impl CdcTransport for NullCdcTransport {
    fn send_cdc(&self, _msg: &CdcMessage) -> UrpcResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConnCfg {
    pub conn_id: u32,
    pub sndbuf_len: u32,
    pub rmb_len: u32,
    pub peer_rmbe_size: u32,
    pub token: u32,
    /// WR slots available for CDC messages before `Busy` is reported.
    pub cdc_slots: u32,
    /// Deliver the urgent byte inline (`SO_OOBINLINE`).
    pub urg_inline: bool,
}

impl Default for ConnCfg {
    fn default() -> Self {
        Self {
            conn_id: 0,
            sndbuf_len: 65536,
            rmb_len: 65536,
            peer_rmbe_size: 65536,
            token: 0,
            cdc_slots: 8,
            urg_inline: false,
        }
    }
}

struct Cursors {
    /// TX over the send buffer.
    tx_prep: Cursor,
    tx_sent: Cursor,
    tx_fin: Cursor,
    /// RX over the remote-memory buffer.
    rx_prod: Cursor,
    rx_cons: Cursor,
    rx_confirmed: Cursor,
    urg_curs: Cursor,
}

pub struct Connection {
    cfg: ConnCfg,
    state: Mutex<ConnState>,
    curs: Mutex<Cursors>,
    local_tx_ctrl: Mutex<HostCdcState>,
    local_rx_ctrl: Mutex<HostCdcState>,
    urg_state: Mutex<UrgState>,

    bytes_to_rcv: AtomicU32,
    sndbuf_space: AtomicU32,
    peer_rmbe_space: AtomicU32,
    tx_cdc_seq: AtomicU16,
    cdc_slots: AtomicU32,
    killed: AtomicBool,
    sk_err: Mutex<Option<ErrCode>>,

    transport: Mutex<Arc<dyn CdcTransport>>,
    pub state_change: Notify,
    pub data_ready: Notify,
    pub write_space: Notify,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.cfg.conn_id)
            .field("state", &self.state())
            .field("bytes_to_rcv", &self.bytes_to_rcv())
            .finish()
    }
}

impl Connection {
    pub fn new(cfg: ConnCfg) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnState::Init),
            curs: Mutex::new(Cursors {
                tx_prep: Cursor::default(),
                tx_sent: Cursor::default(),
                tx_fin: Cursor::default(),
                rx_prod: Cursor::default(),
                rx_cons: Cursor::default(),
                rx_confirmed: Cursor::default(),
                urg_curs: Cursor::default(),
            }),
            local_tx_ctrl: Mutex::new(HostCdcState {
                token: cfg.token,
                ..Default::default()
            }),
            local_rx_ctrl: Mutex::new(HostCdcState::default()),
            urg_state: Mutex::new(UrgState::Invalid),
            bytes_to_rcv: AtomicU32::new(0),
            sndbuf_space: AtomicU32::new(cfg.sndbuf_len),
            peer_rmbe_space: AtomicU32::new(cfg.peer_rmbe_size),
            tx_cdc_seq: AtomicU16::new(0),
            cdc_slots: AtomicU32::new(cfg.cdc_slots),
            killed: AtomicBool::new(false),
            sk_err: Mutex::new(None),
            transport: Mutex::new(Arc::new(NullCdcTransport)),
            state_change: Notify::new(),
            data_ready: Notify::new(),
            write_space: Notify::new(),
            cfg,
        })
    }

    pub fn attach_transport(&self, t: Arc<dyn CdcTransport>) {
        *self.transport.lock().expect("transport lock poisoned") = t;
    }

    #[inline]
    pub fn cfg(&self) -> &ConnCfg {
        &self.cfg
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn set_state(&self, next: ConnState) {
        let mut st = self.state.lock().expect("state lock poisoned");
        if *st != next {
            debug!(conn = self.cfg.conn_id, from = ?*st, to = ?next, "conn state");
            *st = next;
            drop(st);
            self.state_change.notify_waiters();
        }
    }

    /// Compare-and-set used by the close automaton so a peer event that
    /// changed the state mid-step is detected (`false`).
    pub(crate) fn move_state(&self, from: ConnState, next: ConnState) -> bool {
        let mut st = self.state.lock().expect("state lock poisoned");
        if *st != from {
            return false;
        }
        *st = next;
        drop(st);
        self.state_change.notify_waiters();
        true
    }

    pub fn connect(&self) -> UrpcResult<()> {
        if !self.move_state(ConnState::Init, ConnState::Active) {
            return Err(UrpcError::State("connection not in init"));
        }
        Ok(())
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.state_change.notify_waiters();
    }

    pub fn sk_err(&self) -> Option<ErrCode> {
        *self.sk_err.lock().expect("err lock poisoned")
    }

    pub(crate) fn set_sk_err(&self, err: ErrCode) {
        *self.sk_err.lock().expect("err lock poisoned") = Some(err);
        self.data_ready.notify_waiters();
        self.write_space.notify_waiters();
    }

    #[inline]
    pub fn bytes_to_rcv(&self) -> u32 {
        self.bytes_to_rcv.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sndbuf_space(&self) -> u32 {
        self.sndbuf_space.load(Ordering::Acquire)
    }

    #[inline]
    pub fn peer_rmbe_space(&self) -> u32 {
        self.peer_rmbe_space.load(Ordering::Acquire)
    }

    /// Bytes staged but not yet flushed to the peer.
    pub fn tx_prepared_sends(&self) -> u32 {
        let curs = self.curs.lock().expect("cursor lock poisoned");
        Cursor::diff(self.cfg.sndbuf_len, &curs.tx_sent, &curs.tx_prep)
    }

    /// Connection-state flags we have announced (or staged) toward the peer.
    pub fn local_tx_flags(&self) -> ConnStateFlags {
        self.local_tx_ctrl
            .lock()
            .expect("tx ctrl lock poisoned")
            .conn_state_flags
    }

    pub(crate) fn rx_flags(&self) -> ConnStateFlags {
        self.local_rx_ctrl
            .lock()
            .expect("rx ctrl lock poisoned")
            .conn_state_flags
    }

    pub(crate) fn set_local_tx_flag(&self, flag: ConnStateFlags) {
        self.local_tx_ctrl
            .lock()
            .expect("tx ctrl lock poisoned")
            .conn_state_flags
            .insert(flag);
    }

    /// Any close already announced to the peer?
    pub(crate) fn sent_any_close(&self) -> bool {
        self.local_tx_flags().any_close()
    }

    /// Any close (or shutdown) received from the peer?
    pub fn rxed_any_close(&self) -> bool {
        self.rx_flags().any_close()
    }

    pub fn rxed_any_close_or_senddone(&self) -> bool {
        self.rx_flags().any_close_or_senddone()
    }

    /// Stage `len` bytes into the send buffer. Fails with backpressure when
    /// the buffer is out of space.
    pub fn sendmsg(&self, len: u32) -> UrpcResult<u32> {
        if self.state() != ConnState::Active {
            return Err(UrpcError::State("connection not active"));
        }
        if self
            .local_tx_flags()
            .contains(ConnStateFlags::PEER_DONE_WRITING)
        {
            return Err(UrpcError::State("write side already shut down"));
        }
        let space = self.sndbuf_space();
        if space == 0 {
            return Err(UrpcError::Backpressure);
        }
        let take = len.min(space);
        self.sndbuf_space.fetch_sub(take, Ordering::AcqRel);
        let mut curs = self.curs.lock().expect("cursor lock poisoned");
        curs.tx_prep.add(self.cfg.sndbuf_len, take);
        Ok(take)
    }

    /// Flush staged bytes toward the peer: consume peer RMBE space, advance
    /// the producer cursor and announce it via CDC.
    pub fn tx_flush(&self) -> UrpcResult<u32> {
        let mut curs = self.curs.lock().expect("cursor lock poisoned");
        let pending = Cursor::diff(self.cfg.sndbuf_len, &curs.tx_sent, &curs.tx_prep);
        if pending == 0 {
            return Ok(0);
        }
        let room = self.peer_rmbe_space();
        let moved = pending.min(room);
        if moved == 0 {
            // peer RMBE is full; announce write_blocked
            let mut tx = self.local_tx_ctrl.lock().expect("tx ctrl lock poisoned");
            tx.prod_flags.insert(ProducerFlags::WRITE_BLOCKED);
            drop(tx);
            drop(curs);
            self.cdc_send()?;
            return Err(UrpcError::Backpressure);
        }
        self.peer_rmbe_space.fetch_sub(moved, Ordering::AcqRel);
        curs.tx_sent.add(self.cfg.sndbuf_len, moved);
        let sent = curs.tx_sent;
        drop(curs);
        {
            let mut tx = self.local_tx_ctrl.lock().expect("tx ctrl lock poisoned");
            tx.prod.add(self.cfg.peer_rmbe_size, moved);
            tx.prod_flags.remove(ProducerFlags::WRITE_BLOCKED);
        }
        self.cdc_send()?;
        // sndbuf space frees once the transfer is on the wire
        self.sndbuf_space.fetch_add(moved, Ordering::AcqRel);
        {
            let mut curs = self.curs.lock().expect("cursor lock poisoned");
            curs.tx_fin = sent;
        }
        self.write_space.notify_waiters();
        Ok(moved)
    }

    /// Send one urgent byte; it travels with `URG_DATA_PRESENT` and the
    /// producer cursor marking its position.
    pub fn send_oob(&self) -> UrpcResult<()> {
        let taken = self.sendmsg(1)?;
        debug_assert_eq!(taken, 1);
        {
            let mut tx = self.local_tx_ctrl.lock().expect("tx ctrl lock poisoned");
            tx.prod_flags
                .insert(ProducerFlags::URG_DATA_PENDING | ProducerFlags::URG_DATA_PRESENT);
        }
        self.tx_flush().map(|_| ())
    }

    /// Consume up to `len` received bytes. Returns 0 at EOF (peer done
    /// writing and nothing buffered).
    pub fn recvmsg(&self, len: u32) -> UrpcResult<u32> {
        if let Some(err) = self.sk_err() {
            if err == ErrCode::ConnAborted {
                return Err(UrpcError::ConnAborted);
            }
        }
        let avail = self.bytes_to_rcv();
        if avail == 0 {
            if self.rxed_any_close_or_senddone() {
                return Ok(0); // orderly EOF
            }
            return Err(UrpcError::Backpressure);
        }

        // urgent byte handling: non-inline delivery skips it in the stream
        let mut skip_urg = 0;
        if !self.cfg.urg_inline
            && *self.urg_state.lock().expect("urg lock poisoned") == UrgState::Valid
        {
            skip_urg = 1;
        }
        let take = len.min(avail - skip_urg.min(avail));
        let consumed = take + skip_urg;
        self.bytes_to_rcv.fetch_sub(consumed.min(avail), Ordering::AcqRel);
        {
            let mut curs = self.curs.lock().expect("cursor lock poisoned");
            curs.rx_cons.add(self.cfg.rmb_len, consumed);
            let cons = curs.rx_cons;
            curs.rx_confirmed = cons;
        }
        if skip_urg == 1 {
            *self.urg_state.lock().expect("urg lock poisoned") = UrgState::Read;
        }
        {
            let mut tx = self.local_tx_ctrl.lock().expect("tx ctrl lock poisoned");
            tx.cons.add(self.cfg.rmb_len, consumed);
        }
        // piggyback the consumer update so the peer regains RMBE space
        self.cdc_send()?;
        Ok(take)
    }

    /// Deliver the urgent byte (`MSG_OOB`).
    pub fn recv_oob(&self) -> UrpcResult<u8> {
        let mut urg = self.urg_state.lock().expect("urg lock poisoned");
        match *urg {
            UrgState::Valid => {
                *urg = UrgState::Read;
                Ok(1)
            },
            _ => Err(UrpcError::State("no urgent data")),
        }
    }

    pub fn urg_state(&self) -> UrgState {
        *self.urg_state.lock().expect("urg lock poisoned")
    }

    fn take_cdc_slot(&self) -> UrpcResult<()> {
        let mut cur = self.cdc_slots.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return Err(UrpcError::Busy);
            }
            match self.cdc_slots.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => cur = seen,
            }
        }
    }

    fn put_cdc_slot(&self) {
        self.cdc_slots.fetch_add(1, Ordering::AcqRel);
    }

    /// Build a CDC frame from the local TX control state and send it.
    /// `Busy` surfaces to the caller, who retries from a delayed work item.
    pub fn cdc_send(&self) -> UrpcResult<()> {
        if self.is_killed() {
            return Err(UrpcError::ConnAborted);
        }
        self.take_cdc_slot()?;
        let msg = {
            let mut tx = self.local_tx_ctrl.lock().expect("tx ctrl lock poisoned");
            tx.seqno = self.tx_cdc_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            CdcMessage::from_host(&tx)
        };
        let transport = self
            .transport
            .lock()
            .expect("transport lock poisoned")
            .clone();
        let res = transport.send_cdc(&msg);
        self.put_cdc_slot();
        res
    }

    /// Absorb an inbound CDC frame: cursors, spaces, urgent latch, and the
    /// passive-close trigger when any closing flag is present.
    pub fn on_cdc_recv(self: &Arc<Self>, msg: &CdcMessage) {
        let (old_prod, old_cons) = {
            let rx = self.local_rx_ctrl.lock().expect("rx ctrl lock poisoned");
            (rx.prod, rx.cons)
        };
        {
            let mut rx = self.local_rx_ctrl.lock().expect("rx ctrl lock poisoned");
            // a stale seqno must not overwrite a newer state
            let diff = msg.seqno.get().wrapping_sub(rx.seqno);
            if rx.seqno != 0 && (diff == 0 || diff > u16::MAX / 2) {
                return;
            }
            msg.merge_to_host(&mut rx);
        }
        let (new_prod, new_cons, flags, prod_flags) = {
            let rx = self.local_rx_ctrl.lock().expect("rx ctrl lock poisoned");
            (rx.prod, rx.cons, rx.conn_state_flags, rx.prod_flags)
        };

        // freshly produced bytes land in our RMB
        let produced = Cursor::diff_large(self.cfg.rmb_len, &old_prod, &new_prod);
        if produced > 0 {
            let cur = self.bytes_to_rcv.load(Ordering::Acquire);
            let capped = (cur + produced).min(self.cfg.rmb_len);
            self.bytes_to_rcv.store(capped, Ordering::Release);
            if prod_flags.contains(ProducerFlags::URG_DATA_PRESENT) {
                let mut curs = self.curs.lock().expect("cursor lock poisoned");
                curs.urg_curs = new_prod;
                drop(curs);
                *self.urg_state.lock().expect("urg lock poisoned") = UrgState::Valid;
            }
            {
                let mut curs = self.curs.lock().expect("cursor lock poisoned");
                curs.rx_prod = new_prod;
            }
            self.data_ready.notify_waiters();
        }

        // the peer consumed bytes out of its RMB: our window grows back
        let acked = Cursor::diff_large(self.cfg.peer_rmbe_size, &old_cons, &new_cons);
        if acked > 0 {
            let cur = self.peer_rmbe_space.load(Ordering::Acquire);
            self.peer_rmbe_space
                .store((cur + acked).min(self.cfg.peer_rmbe_size), Ordering::Release);
            self.write_space.notify_waiters();
        }

        if flags.any_close_or_senddone() {
            crate::sock::close::close_passive_work(self);
        }
    }
}
