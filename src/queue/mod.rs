// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

pub mod buf;
pub mod credit;
pub mod cursor;
pub mod disorder;
pub mod flow_control;
pub mod jetty;

pub use jetty::{PeerBinding, Queue, QueueCfg, QueueMode, QueueOwnState, TransMode, TxMsg};
