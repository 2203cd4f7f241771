// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Client-side connection entries: one TCP per peer endpoint, shared by
//! every task and channel talking to it.
//!
//! Entries are reference-counted; a broken TCP triggers bounded
//! reconnection, and tasks still registered when the link comes back
//! reissue their in-flight step themselves (their receive channel reports
//! the break).

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{cfg::config::SslConfig, transport::conn::CtlConnection};

pub const MAX_RETRY_TIMES: u32 = 3;

#[derive(Debug)]
pub struct ClientConnectEntry {
    addr: SocketAddr,
    conn: Mutex<Option<Arc<CtlConnection>>>,
    ref_cnt: AtomicU32,
    retry_times: AtomicU32,
    error_cnt: AtomicU32,
    server_chid: AtomicU32,
    /// Channels multiplexed over this TCP.
    channels: Mutex<Vec<u32>>,
}

impl ClientConnectEntry {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn conn(&self) -> Option<Arc<CtlConnection>> {
        self.conn.lock().expect("conn lock poisoned").clone()
    }

    pub fn server_chid(&self) -> u32 {
        self.server_chid.load(Ordering::Acquire)
    }

    pub fn set_server_chid(&self, chid: u32) {
        self.server_chid.store(chid, Ordering::Release);
    }

    pub fn track_channel(&self, chid: u32) {
        let mut list = self.channels.lock().expect("channels lock poisoned");
        if !list.contains(&chid) {
            list.push(chid);
        }
    }

    pub fn untrack_channel(&self, chid: u32) {
        self.channels
            .lock()
            .expect("channels lock poisoned")
            .retain(|c| *c != chid);
    }

    pub fn channels(&self) -> Vec<u32> {
        self.channels.lock().expect("channels lock poisoned").clone()
    }

    pub fn refs(&self) -> u32 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    pub fn error_cnt(&self) -> u32 {
        self.error_cnt.load(Ordering::Relaxed)
    }

    pub fn note_error(&self) {
        self.error_cnt.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct ClientConnectTable {
    entries: DashMap<SocketAddr, Arc<ClientConnectEntry>>,
}

impl ClientConnectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the entry for `addr`, dialing if necessary. Reconnection after
    /// a break is bounded by `MAX_RETRY_TIMES`.
    pub async fn get_or_connect(
        &self,
        addr: SocketAddr,
        ssl: Option<&SslConfig>,
        io_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<ClientConnectEntry>> {
        let entry = self
            .entries
            .entry(addr)
            .or_insert_with(|| {
                Arc::new(ClientConnectEntry {
                    addr,
                    conn: Mutex::new(None),
                    ref_cnt: AtomicU32::new(0),
                    retry_times: AtomicU32::new(0),
                    error_cnt: AtomicU32::new(0),
                    server_chid: AtomicU32::new(0),
                    channels: Mutex::new(Vec::new()),
                })
            })
            .clone();

        let live = entry
            .conn()
            .filter(|c| !c.state().should_stop())
            .is_some();
        if !live {
            let retries = entry.retry_times.fetch_add(1, Ordering::AcqRel);
            if retries >= MAX_RETRY_TIMES {
                entry.retry_times.store(MAX_RETRY_TIMES, Ordering::Release);
                bail!("reconnect attempts to {addr} exhausted");
            }
            match CtlConnection::connect(addr, ssl, io_timeout, cancel.child_token())
                .await
            {
                Ok(conn) => {
                    debug!(%addr, "side-band (re)connected");
                    entry.retry_times.store(0, Ordering::Release);
                    *entry.conn.lock().expect("conn lock poisoned") = Some(conn);
                },
                Err(e) => {
                    warn!(%addr, "side-band connect failed: {e}");
                    entry.note_error();
                    return Err(e);
                },
            }
        }
        entry.ref_cnt.fetch_add(1, Ordering::AcqRel);
        Ok(entry)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<ClientConnectEntry>> {
        self.entries.get(addr).map(|e| Arc::clone(e.value()))
    }

    /// Drop one reference; the entry and its TCP go away with the last one.
    pub fn release(&self, entry: &Arc<ClientConnectEntry>) {
        if entry.ref_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some((_, e)) = self.entries.remove(&entry.addr) {
                if let Some(conn) = e.conn() {
                    conn.close();
                }
                debug!(addr = %entry.addr, "client connect entry released");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
