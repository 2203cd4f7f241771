// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use std::sync::{Arc, Mutex, Weak};

use urpc_rs::{
    cfg::config::{ControlPlaneCfg, Role, TransInfo, TransModeCfg, UrpcConfig},
    errors::UrpcResult,
    models::cdc::CdcMessage,
    sock::connection::{CdcTransport, Connection},
};

/// Distinct fabric EIDs per test endpoint.
pub fn eid(tag: u8) -> [u8; 16] {
    let mut e = [0u8; 16];
    e[0] = 0xfe;
    e[15] = tag;
    e
}

pub fn server_config(tag: u8) -> UrpcConfig {
    UrpcConfig {
        role: Role::Server,
        trans_info: vec![TransInfo {
            trans_mode: TransModeCfg::Ip,
            eid: eid(tag),
        }],
        control_plane: ControlPlaneCfg {
            listen: Some("127.0.0.1:0".parse().expect("addr")),
        },
        ..Default::default()
    }
}

pub fn client_config(tag: u8) -> UrpcConfig {
    UrpcConfig {
        role: Role::Client,
        trans_info: vec![TransInfo {
            trans_mode: TransModeCfg::Ip,
            eid: eid(tag),
        }],
        control_plane: ControlPlaneCfg { listen: None },
        ..Default::default()
    }
}

/// Delivers CDC frames straight into the peer connection, standing in for
/// the WR slot path of a real link.
pub struct PairTransport {
    peer: Mutex<Weak<Connection>>,
}

impl PairTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: Mutex::new(Weak::new()),
        })
    }

    pub fn wire(&self, peer: &Arc<Connection>) {
        *self.peer.lock().expect("peer lock") = Arc::downgrade(peer);
    }
}

impl CdcTransport for PairTransport {
    fn send_cdc(&self, msg: &CdcMessage) -> UrpcResult<()> {
        if let Some(peer) = self.peer.lock().expect("peer lock").upgrade() {
            peer.on_cdc_recv(msg);
        }
        Ok(())
    }
}

/// Build a wired pair of memory-socket connections in the active state.
pub fn connected_pair(
    cfg_a: urpc_rs::sock::connection::ConnCfg,
    cfg_b: urpc_rs::sock::connection::ConnCfg,
) -> (Arc<Connection>, Arc<Connection>) {
    let a = Connection::new(cfg_a);
    let b = Connection::new(cfg_b);
    let t_ab = PairTransport::new();
    t_ab.wire(&b);
    a.attach_transport(t_ab);
    let t_ba = PairTransport::new();
    t_ba.wire(&a);
    b.attach_transport(t_ba);
    a.connect().expect("a active");
    b.connect().expect("b active");
    (a, b)
}
