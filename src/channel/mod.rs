// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Channels and the process-wide channel table.
//!
//! A channel multiplexes many queues between two endpoints. Local queues
//! are owned by their creator: removing the channel drops remote-queue
//! references but never destroys local queues. A queue handle lives in at
//! most one channel at a time; the table enforces that with an ownership
//! map beside the id lookup.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    errors::{UrpcError, UrpcResult},
    models::handshake::{InstanceKey, QueueInfo},
    queue::{PeerBinding, Queue},
};

const CHID_MASK: u32 = 0x00ff_ffff;

#[derive(Debug)]
pub struct Channel {
    chid: u32,
    /// Channel id the peer assigned on its side.
    mapped_chid: AtomicU32,
    peer: Mutex<InstanceKey>,
    /// Side-band address this channel attached through.
    attach_addr: Mutex<Option<std::net::SocketAddr>>,
    local_queues: Mutex<Vec<Arc<Queue>>>,
    remote_queues: Mutex<Vec<PeerBinding>>,
    /// Dedicated queue pair for keepalive traffic, when negotiated.
    manage_pair: Mutex<Option<(Arc<Queue>, PeerBinding)>>,
    keepalive_attr: AtomicU32,
    ref_cnt: AtomicU32,
}

impl Channel {
    #[inline]
    pub fn chid(&self) -> u32 {
        self.chid
    }

    #[inline]
    pub fn peer(&self) -> InstanceKey {
        *self.peer.lock().expect("peer lock poisoned")
    }

    pub fn set_peer(&self, key: InstanceKey) {
        *self.peer.lock().expect("peer lock poisoned") = key;
    }

    pub fn attach_addr(&self) -> Option<std::net::SocketAddr> {
        *self.attach_addr.lock().expect("attach addr lock poisoned")
    }

    pub fn set_attach_addr(&self, addr: std::net::SocketAddr) {
        *self.attach_addr.lock().expect("attach addr lock poisoned") = Some(addr);
    }

    pub fn mapped_chid(&self) -> u32 {
        self.mapped_chid.load(Ordering::Acquire)
    }

    pub fn set_mapped_chid(&self, chid: u32) {
        self.mapped_chid.store(chid, Ordering::Release);
    }

    pub fn keepalive_attr(&self) -> u32 {
        self.keepalive_attr.load(Ordering::Acquire)
    }

    pub fn set_keepalive_attr(&self, attr: u32) {
        self.keepalive_attr.store(attr, Ordering::Release);
    }

    pub fn hold(&self) -> u32 {
        self.ref_cnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn put(&self) -> u32 {
        self.ref_cnt.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn refs(&self) -> u32 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    pub fn local_queues(&self) -> Vec<Arc<Queue>> {
        self.local_queues
            .lock()
            .expect("local queues lock poisoned")
            .clone()
    }

    pub fn remote_queues(&self) -> Vec<PeerBinding> {
        self.remote_queues
            .lock()
            .expect("remote queues lock poisoned")
            .clone()
    }

    pub fn local_queue(&self, qid: u32) -> Option<Arc<Queue>> {
        self.local_queues
            .lock()
            .expect("local queues lock poisoned")
            .iter()
            .find(|q| q.qid() == qid)
            .cloned()
    }

    pub fn remote_queue(&self, qid: u32) -> Option<PeerBinding> {
        self.remote_queues
            .lock()
            .expect("remote queues lock poisoned")
            .iter()
            .find(|b| b.qid == qid)
            .copied()
    }

    pub fn set_manage_pair(&self, local: Arc<Queue>, remote: PeerBinding) {
        *self.manage_pair.lock().expect("manage lock poisoned") = Some((local, remote));
    }

    pub fn manage_pair(&self) -> Option<(Arc<Queue>, PeerBinding)> {
        self.manage_pair
            .lock()
            .expect("manage lock poisoned")
            .clone()
    }

    fn add_remote(&self, binding: PeerBinding) {
        let mut rq = self.remote_queues.lock().expect("remote queues lock poisoned");
        if rq.iter().all(|b| b.qid != binding.qid) {
            rq.push(binding);
        }
    }

    fn rm_remote(&self, qid: u32) -> bool {
        let mut rq = self.remote_queues.lock().expect("remote queues lock poisoned");
        let before = rq.len();
        rq.retain(|b| b.qid != qid);
        rq.len() != before
    }

    /// Queue descriptors exported to the peer during attach/refresh.
    pub fn export_queue_infos(&self) -> Vec<QueueInfo> {
        self.local_queues()
            .iter()
            .map(|q| {
                let b = q.export_binding();
                let cfg = q.cfg();
                let mut info = QueueInfo {
                    priority: cfg.priority,
                    custom_flag: cfg.custom_flag,
                    ..Default::default()
                };
                info.qid.set(b.qid);
                info.trans_mode.set(cfg.trans_mode as u32);
                info.rx_depth.set(cfg.rx_depth);
                info.tx_depth.set(cfg.tx_depth);
                info.rx_buf_size.set(cfg.rx_buf_size);
                info.token.set(b.token);
                info.seg_addr.set(b.seg_addr);
                info.seg_len.set(b.seg_len);
                info.window_addr.set(b.window_addr);
                info.window_token.set(b.window_token);
                info
            })
            .collect()
    }
}

/// Turn an imported queue descriptor into a peer binding.
pub fn binding_from_info(eid: [u8; 16], info: &QueueInfo) -> PeerBinding {
    PeerBinding {
        eid,
        qid: info.qid.get(),
        token: info.token.get(),
        seg_addr: info.seg_addr.get(),
        seg_len: info.seg_len.get(),
        window_addr: info.window_addr.get(),
        window_token: info.window_token.get(),
        rx_depth: info.rx_depth.get(),
    }
}

#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: DashMap<u32, Arc<Channel>>,
    /// qid -> owning chid; a queue sits in at most one channel.
    queue_owner: DashMap<u32, u32>,
    next_chid: AtomicU32,
}

impl ChannelTable {
    pub fn new() -> Self {
        let table = Self::default();
        table.next_chid.store(1, Ordering::Relaxed);
        table
    }

    pub fn create(&self, peer: InstanceKey) -> Arc<Channel> {
        let chid = loop {
            let id = self.next_chid.fetch_add(1, Ordering::Relaxed) & CHID_MASK;
            if !self.channels.contains_key(&id) {
                break id;
            }
        };
        let ch = Arc::new(Channel {
            chid,
            mapped_chid: AtomicU32::new(0),
            peer: Mutex::new(peer),
            attach_addr: Mutex::new(None),
            local_queues: Mutex::new(Vec::new()),
            remote_queues: Mutex::new(Vec::new()),
            manage_pair: Mutex::new(None),
            keepalive_attr: AtomicU32::new(0),
            ref_cnt: AtomicU32::new(1),
        });
        self.channels.insert(chid, Arc::clone(&ch));
        debug!(chid, "channel created");
        ch
    }

    pub fn get(&self, chid: u32) -> Option<Arc<Channel>> {
        self.channels.get(&chid).map(|c| Arc::clone(c.value()))
    }

    /// Scan for an existing channel to the same peer, to reuse its TCP.
    pub fn find_by_peer(&self, peer: &InstanceKey) -> Option<Arc<Channel>> {
        self.channels
            .iter()
            .find(|c| c.peer() == *peer)
            .map(|c| Arc::clone(c.value()))
    }

    pub fn queue_add_local(&self, chid: u32, q: Arc<Queue>) -> UrpcResult<()> {
        let ch = self.get(chid).ok_or(UrpcError::BadHandle)?;
        let qid = q.qid();
        match self.queue_owner.entry(qid) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(UrpcError::State("queue already sits in a channel"));
            },
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(chid);
            },
        }
        ch.local_queues
            .lock()
            .expect("local queues lock poisoned")
            .push(q);
        Ok(())
    }

    pub fn queue_rm_local(&self, chid: u32, qid: u32) -> UrpcResult<Arc<Queue>> {
        let ch = self.get(chid).ok_or(UrpcError::BadHandle)?;
        let mut lq = ch.local_queues.lock().expect("local queues lock poisoned");
        let pos = lq
            .iter()
            .position(|q| q.qid() == qid)
            .ok_or(UrpcError::BadHandle)?;
        let q = lq.remove(pos);
        drop(lq);
        self.queue_owner.remove(&qid);
        Ok(q)
    }

    pub fn queue_add_remote(&self, chid: u32, binding: PeerBinding) -> UrpcResult<()> {
        let ch = self.get(chid).ok_or(UrpcError::BadHandle)?;
        ch.add_remote(binding);
        Ok(())
    }

    pub fn queue_rm_remote(&self, chid: u32, qid: u32) -> UrpcResult<()> {
        let ch = self.get(chid).ok_or(UrpcError::BadHandle)?;
        if ch.rm_remote(qid) {
            Ok(())
        } else {
            Err(UrpcError::BadHandle)
        }
    }

    /// Bind a local queue to an imported remote descriptor.
    pub fn queue_pair(&self, chid: u32, l_qid: u32, r_qid: u32) -> UrpcResult<()> {
        let ch = self.get(chid).ok_or(UrpcError::BadHandle)?;
        let q = ch.local_queue(l_qid).ok_or(UrpcError::BadHandle)?;
        let binding = ch.remote_queue(r_qid).ok_or(UrpcError::BadHandle)?;
        q.bind_peer(binding)
    }

    pub fn queue_unpair(&self, chid: u32, l_qid: u32) -> UrpcResult<()> {
        let ch = self.get(chid).ok_or(UrpcError::BadHandle)?;
        let q = ch.local_queue(l_qid).ok_or(UrpcError::BadHandle)?;
        q.modify(crate::queue::QueueOwnState::Reset)
    }

    /// Remove a channel. Remote references go away with it; local queues
    /// stay alive with their owner and become attachable again.
    pub fn remove(&self, chid: u32) -> UrpcResult<()> {
        let (_, ch) = self.channels.remove(&chid).ok_or(UrpcError::BadHandle)?;
        for q in ch.local_queues().iter() {
            self.queue_owner.remove(&q.qid());
        }
        ch.remote_queues
            .lock()
            .expect("remote queues lock poisoned")
            .clear();
        debug!(chid, "channel removed");
        Ok(())
    }

    /// Where a queue currently lives, if anywhere.
    pub fn owner_of(&self, qid: u32) -> Option<u32> {
        self.queue_owner.get(&qid).map(|e| *e.value())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
