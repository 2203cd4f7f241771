// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

pub mod client;
pub mod conn;
pub mod server;

use std::time::Duration;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::models::control::CtlHead;

/// Side-band connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Uninitialized,
    Connecting,
    TlsConnecting,
    Connected,
    Closed,
    Error,
}

impl TcpState {
    #[inline]
    pub fn should_stop(self) -> bool {
        matches!(self, TcpState::Closed | TcpState::Error)
    }
}

/// One framed message off the side-band: validated head plus payload.
#[derive(Debug, Clone)]
pub struct CtlFrame {
    pub head: CtlHead,
    pub payload: Bytes,
}

pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("{label} cancelled")),
        res = tokio::time::timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow!("{label} timeout")),
            }
        }
    }
}
