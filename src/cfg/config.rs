// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Runtime configuration: a plain struct the caller fills in. No
//! environment parsing happens here; YAML loading exists for tooling and
//! tests that want a file-backed config.

use std::{net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::queue::TransMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
    /// Open the listener and initiate connects.
    Both,
}

impl Role {
    #[inline]
    pub fn listens(self) -> bool {
        matches!(self, Role::Server | Role::Both)
    }

    #[inline]
    pub fn connects(self) -> bool {
        matches!(self, Role::Client | Role::Both)
    }
}

/// Per-device fabric selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransInfo {
    pub trans_mode: TransModeCfg,
    /// Device EID, an IPv4/IPv6 address mapped into 16 bytes for IP mode.
    pub eid: [u8; 16],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransModeCfg {
    Ip,
    Ub,
    Ib,
}

impl TransModeCfg {
    pub fn queue_trans_mode(self) -> TransMode {
        match self {
            // IP mode rides the in-process provider
            TransModeCfg::Ip => TransMode::IpcShared,
            TransModeCfg::Ub | TransModeCfg::Ib => TransMode::SendRecv,
        }
    }
}

bitflags::bitflags! {
    /// Feature toggles mirrored into negotiation capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Feature: u32 {
        /// Skip peer-token validation on imports.
        const DISABLE_TOKEN_POLICY = 1 << 0;
        const ENABLE_FLOW_CONTROL  = 1 << 1;
        /// Pro API: explicit post/poll instead of enqueue/dequeue.
        const API_PRO              = 1 << 2;
        const KEEPALIVE            = 1 << 3;
        const DP_ENCRYPT           = 1 << 4;
    }
}

impl Default for Feature {
    fn default() -> Self {
        Feature::API_PRO
    }
}

/// PSK material for the optional TLS side-band. The TLS engine itself is an
/// external collaborator; this only carries what it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    pub cipher_list: String,
    pub psk_identity: String,
    #[serde(skip_serializing, default)]
    pub psk_key: Vec<u8>,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            cipher_list: "PSK-AES128-GCM-SHA256:PSK-AES256-GCM-SHA384".to_string(),
            psk_identity: String::new(),
            psk_key: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneCfg {
    /// Side-band listen address (server roles).
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrpcConfig {
    pub role: Role,
    pub trans_info: Vec<TransInfo>,
    #[serde(skip, default)]
    pub feature: Feature,
    pub ssl: Option<SslConfig>,
    pub control_plane: ControlPlaneCfg,
    /// Side-band I/O timeout.
    #[serde(with = "duration_ms", default = "default_io_timeout")]
    pub io_timeout: Duration,
    /// Timer slots granted to each channel.
    #[serde(default = "default_timer_pool")]
    pub timers_per_channel: u32,
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_timer_pool() -> u32 {
    8
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

impl Default for UrpcConfig {
    fn default() -> Self {
        Self {
            role: Role::Both,
            trans_info: vec![TransInfo {
                trans_mode: TransModeCfg::Ip,
                eid: [0; 16],
            }],
            feature: Feature::default(),
            ssl: None,
            control_plane: ControlPlaneCfg { listen: None },
            io_timeout: default_io_timeout(),
            timers_per_channel: default_timer_pool(),
        }
    }
}

impl UrpcConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read config file: {}", path.as_ref().display())
        })?;
        serde_yaml::from_str(&raw).with_context(|| {
            format!("failed to parse config file: {}", path.as_ref().display())
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.trans_info.is_empty() {
            anyhow::bail!("at least one trans_info entry is required");
        }
        if self.role.listens() && self.control_plane.listen.is_none() {
            anyhow::bail!("server role requires a control-plane listen address");
        }
        Ok(())
    }

    /// EID of the first configured device.
    pub fn local_eid(&self) -> [u8; 16] {
        self.trans_info.first().map(|t| t.eid).unwrap_or([0; 16])
    }

    /// Map an IPv4 address into the 16-byte EID form.
    pub fn eid_from_ipv4(addr: std::net::Ipv4Addr) -> [u8; 16] {
        let mut eid = [0u8; 16];
        eid[10] = 0xff;
        eid[11] = 0xff;
        eid[12..16].copy_from_slice(&addr.octets());
        eid
    }
}
