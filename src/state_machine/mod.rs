// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

pub mod attach_states;
pub mod detach_states;
pub mod queue_states;
pub mod server_states;
pub mod task;

use std::sync::Arc;

use crate::{
    cfg::config::Feature,
    channel::ChannelTable,
    events::AsyncEventQueue,
    models::handshake::InstanceKey,
    provider::Provider,
    queue::Queue,
};

pub enum Transition<S, R> {
    Next(S, R),
    Stay(R),
    Done(R),
}

pub trait StateMachine<Ctx, RespCtx>: Sized {
    type StepResult<'a>: Future<Output = RespCtx> + Send + 'a
    where
        Self: 'a,
        RespCtx: 'a,
        Ctx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}

/// What the engine does after a step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Stop,
}

/// Shared control-plane context handed to every workflow step.
#[derive(Clone)]
pub struct ControlCtx {
    pub channel_table: Arc<ChannelTable>,
    pub provider: Arc<dyn Provider>,
    pub events: Arc<AsyncEventQueue>,
    pub local_key: InstanceKey,
    pub feature: Feature,
    /// Queues the local side serves to attaching peers.
    pub server_queues: Arc<std::sync::Mutex<Vec<Arc<Queue>>>>,
}

impl ControlCtx {
    pub fn server_queue_list(&self) -> Vec<Arc<Queue>> {
        self.server_queues
            .lock()
            .expect("server queues lock poisoned")
            .clone()
    }
}
