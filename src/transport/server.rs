// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Listener and accept entries for the server side of the side-band.
//!
//! Every accepted TCP becomes a [`ServerAcceptEntry`] that remembers which
//! peer instance it belongs to and which server channels were created over
//! it, so a dying TCP can bulk-release everything it owned.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    models::handshake::InstanceKey,
    transport::{
        CtlFrame,
        conn::{CtlConnection, ServerDispatch},
    },
};

#[derive(Debug)]
pub struct ServerAcceptEntry {
    conn: Arc<CtlConnection>,
    client_key: OnceCell<InstanceKey>,
    /// Server channels created over this TCP; released together when the
    /// connection dies.
    server_channels: Mutex<Vec<u32>>,
}

impl ServerAcceptEntry {
    pub fn conn(&self) -> &Arc<CtlConnection> {
        &self.conn
    }

    pub fn client_key(&self) -> Option<InstanceKey> {
        self.client_key.get().copied()
    }

    pub fn bind_client_key(&self, key: InstanceKey) {
        let _ = self.client_key.set(key);
    }

    pub fn track_channel(&self, chid: u32) {
        let mut list = self
            .server_channels
            .lock()
            .expect("server channels lock poisoned");
        if !list.contains(&chid) {
            list.push(chid);
        }
    }

    pub fn untrack_channel(&self, chid: u32) {
        self.server_channels
            .lock()
            .expect("server channels lock poisoned")
            .retain(|c| *c != chid);
    }

    pub fn take_channels(&self) -> Vec<u32> {
        std::mem::take(
            &mut self
                .server_channels
                .lock()
                .expect("server channels lock poisoned"),
        )
    }
}

/// Frame handler invoked for every inbound request frame, with the accept
/// entry it arrived on.
pub type AcceptDispatch =
    Arc<dyn Fn(Arc<ServerAcceptEntry>, CtlFrame) + Send + Sync>;

pub struct CtlListener {
    local_addr: SocketAddr,
    entries: Mutex<Vec<Arc<ServerAcceptEntry>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for CtlListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtlListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl CtlListener {
    /// Bind and start accepting. `dispatch` sees every request frame.
    pub async fn bind(
        addr: SocketAddr,
        io_timeout: Duration,
        dispatch: AcceptDispatch,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        let this = Arc::new(Self {
            local_addr,
            entries: Mutex::new(Vec::new()),
            cancel: cancel.clone(),
        });
        let accept_this = Arc::clone(&this);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "side-band accepted");
                                if let Err(e) = accept_this.adopt(
                                    stream,
                                    io_timeout,
                                    Arc::clone(&dispatch),
                                ) {
                                    warn!(%peer, "accept setup failed: {e}");
                                }
                            },
                            Err(e) => {
                                warn!("accept failed: {e}");
                            },
                        }
                    }
                }
            }
        });
        Ok(this)
    }

    fn adopt(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        io_timeout: Duration,
        dispatch: AcceptDispatch,
    ) -> Result<()> {
        let entry_cell: Arc<OnceCell<Arc<ServerAcceptEntry>>> = Arc::new(OnceCell::new());
        let routed_cell = Arc::clone(&entry_cell);
        let conn_dispatch: ServerDispatch = Arc::new(move |_conn, frame| {
            if let Some(entry) = routed_cell.get() {
                dispatch(Arc::clone(entry), frame);
            }
        });
        let conn = CtlConnection::from_accepted(
            stream,
            io_timeout,
            conn_dispatch,
            self.cancel.child_token(),
        )?;
        let entry = Arc::new(ServerAcceptEntry {
            conn,
            client_key: OnceCell::new(),
            server_channels: Mutex::new(Vec::new()),
        });
        let _ = entry_cell.set(Arc::clone(&entry));
        self.entries
            .lock()
            .expect("entries lock poisoned")
            .push(entry);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn entries(&self) -> Vec<Arc<ServerAcceptEntry>> {
        self.entries.lock().expect("entries lock poisoned").clone()
    }

    /// Drop dead entries and hand back the channels they owned so the
    /// caller can release the resources.
    pub fn sweep_dead(&self) -> Vec<u32> {
        let mut dead_channels = Vec::new();
        let mut entries = self.entries.lock().expect("entries lock poisoned");
        entries.retain(|e| {
            if e.conn.state().should_stop() {
                dead_channels.extend(e.take_channels());
                false
            } else {
                true
            }
        });
        dead_channels
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
