// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! One framed side-band connection.
//!
//! Every message is a 24-byte control head followed by `data_size` payload
//! bytes; reads run in two phases (head, then data) so a short read resumes
//! where it stopped. Inbound frames are routed to the task that registered
//! the frame's `task_id`; frames for unknown tasks go to the server
//! dispatcher, which is how fresh requests reach the task engine.

use std::{net::SocketAddr, sync::{Arc, Mutex, atomic::{AtomicU32, Ordering}}, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::SslConfig,
    models::{common::CTL_HEAD_LEN, control::CtlHead},
    transport::{CtlFrame, TcpState, io_with_timeout},
};

pub type ServerDispatch = Arc<dyn Fn(Arc<CtlConnection>, CtlFrame) + Send + Sync>;

pub struct CtlConnection {
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    state: Mutex<TcpState>,
    peer_addr: SocketAddr,
    /// task_id -> sender feeding the task's receive phase.
    pending: DashMap<i32, mpsc::Sender<CtlFrame>>,
    dispatch: Mutex<Option<ServerDispatch>>,
    cancel: CancellationToken,
    io_timeout: Duration,
    error_cnt: AtomicU32,
}

impl std::fmt::Debug for CtlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtlConnection")
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl CtlConnection {
    /// Connect out to a listener. TLS, when configured, runs as its own
    /// phase between TCP connect and the first frame; the handshake itself
    /// belongs to the external TLS provider.
    pub async fn connect(
        addr: SocketAddr,
        ssl: Option<&SslConfig>,
        io_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect timeout to {addr}"))?
            .with_context(|| format!("connect to {addr}"))?;
        stream.set_nodelay(true)?;
        let mut state = TcpState::Connecting;
        if let Some(ssl) = ssl {
            state = TcpState::TlsConnecting;
            // PSK handshake is the TLS provider's business; the cipher list
            // is validated here so a bad config fails before any I/O
            if ssl.cipher_list.is_empty() {
                bail!("empty TLS cipher list");
            }
        }
        debug!(%addr, ?state, "side-band connected");
        let (r, w) = stream.into_split();
        let conn = Arc::new(Self {
            reader: tokio::sync::Mutex::new(r),
            writer: tokio::sync::Mutex::new(w),
            state: Mutex::new(TcpState::Connected),
            peer_addr: addr,
            pending: DashMap::new(),
            dispatch: Mutex::new(None),
            cancel,
            io_timeout,
            error_cnt: AtomicU32::new(0),
        });
        conn.spawn_read_loop();
        Ok(conn)
    }

    /// Wrap an accepted stream on the server side.
    pub fn from_accepted(
        stream: TcpStream,
        io_timeout: Duration,
        dispatch: ServerDispatch,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        let conn = Arc::new(Self {
            reader: tokio::sync::Mutex::new(r),
            writer: tokio::sync::Mutex::new(w),
            state: Mutex::new(TcpState::Connected),
            peer_addr,
            pending: DashMap::new(),
            dispatch: Mutex::new(Some(dispatch)),
            cancel,
            io_timeout,
            error_cnt: AtomicU32::new(0),
        });
        conn.spawn_read_loop();
        Ok(conn)
    }

    #[inline]
    pub fn state(&self) -> TcpState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, next: TcpState) {
        *self.state.lock().expect("state lock poisoned") = next;
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn error_cnt(&self) -> u32 {
        self.error_cnt.load(Ordering::Relaxed)
    }

    /// Register interest in frames carrying `task_id`.
    pub fn register_task(&self, task_id: i32) -> mpsc::Receiver<CtlFrame> {
        let (tx, rx) = mpsc::channel(8);
        self.pending.insert(task_id, tx);
        rx
    }

    pub fn unregister_task(&self, task_id: i32) {
        self.pending.remove(&task_id);
    }

    /// Frame and send one control message.
    pub async fn send_msg(&self, head: &CtlHead, payload: &[u8]) -> Result<()> {
        if self.state().should_stop() {
            bail!("connection to {} is down", self.peer_addr);
        }
        if payload.len() != head.data_size.get() as usize {
            bail!(
                "payload length {} disagrees with head data_size {}",
                payload.len(),
                head.data_size.get()
            );
        }
        let mut head_buf = [0u8; CTL_HEAD_LEN];
        head.to_wire_bytes(&mut head_buf)?;

        let mut w = self.writer.lock().await;
        io_with_timeout(
            "write ctl head",
            w.write_all(&head_buf),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        if !payload.is_empty() {
            io_with_timeout(
                "write ctl payload",
                w.write_all(payload),
                self.io_timeout,
                &self.cancel,
            )
            .await?;
        }
        Ok(())
    }

    fn spawn_read_loop(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = conn.read_loop().await {
                if !conn.cancel.is_cancelled() {
                    warn!(peer = %conn.peer_addr, "ctl read loop exited: {e}");
                }
                conn.on_broken();
            }
        });
    }

    async fn read_loop(self: &Arc<Self>) -> Result<()> {
        let mut head_buf = [0u8; CTL_HEAD_LEN];
        loop {
            if self.cancel.is_cancelled() {
                bail!("cancelled");
            }
            // phase one: the fixed head
            {
                let mut r = self.reader.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => bail!("cancelled"),
                    res = r.read_exact(&mut head_buf) => { res?; },
                }
            }
            let head = CtlHead::from_wire_bytes(&head_buf)?;
            // phase two: exactly data_size payload bytes
            let mut payload = BytesMut::zeroed(head.data_size.get() as usize);
            if !payload.is_empty() {
                let mut r = self.reader.lock().await;
                io_with_timeout(
                    "read ctl payload",
                    r.read_exact(&mut payload),
                    self.io_timeout,
                    &self.cancel,
                )
                .await?;
            }
            let frame = CtlFrame {
                head,
                payload: payload.freeze(),
            };
            self.route(frame).await;
        }
    }

    async fn route(self: &Arc<Self>, frame: CtlFrame) {
        let task_id = frame.head.task_id.get();
        if let Some(tx) = self.pending.get(&task_id).map(|e| e.value().clone()) {
            if tx.send(frame).await.is_err() {
                debug!(task_id, "task receiver dropped before its frame");
                self.pending.remove(&task_id);
            }
            return;
        }
        let dispatch = self
            .dispatch
            .lock()
            .expect("dispatch lock poisoned")
            .clone();
        match dispatch {
            Some(cb) => cb(Arc::clone(self), frame),
            None => {
                warn!(task_id, "frame for unknown task dropped");
                self.error_cnt.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    fn on_broken(&self) {
        self.set_state(TcpState::Error);
        // dropping senders wakes every waiting task with a channel-closed
        self.pending.clear();
    }

    pub fn close(&self) {
        self.set_state(TcpState::Closed);
        self.cancel.cancel();
        self.pending.clear();
    }

    /// Take the next frame addressed to `task_id`.
    pub async fn recv_frame(
        &self,
        rx: &mut mpsc::Receiver<CtlFrame>,
        timeout: Duration,
    ) -> Result<CtlFrame> {
        tokio::select! {
            _ = self.cancel.cancelled() => bail!("cancelled"),
            f = tokio::time::timeout(timeout, rx.recv()) => {
                match f {
                    Ok(Some(frame)) => Ok(frame),
                    Ok(None) => bail!("connection dropped before the reply"),
                    Err(_) => bail!("recv timeout"),
                }
            }
        }
    }
}
