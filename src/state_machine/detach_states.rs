// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Client detach: `SendDetach → RecvDetach → Done`. The channel's remote
//! references are dropped after the peer confirms; local queues stay with
//! their owner.

use std::pin::Pin;

use anyhow::Result;
use tracing::debug;

use crate::{
    models::{handshake::{DetachInfo, DetachMsgV1}, opcode::CtlOpcode},
    state_machine::{StateMachine, Transition, attach_states::AttachCtx},
};

type DetachStepOut = Transition<DetachStates, Result<()>>;

pub enum DetachStates {
    Detach(Detach),
}

#[derive(Debug)]
pub struct Detach;

impl StateMachine<AttachCtx, DetachStepOut> for Detach {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = DetachStepOut> + Send + 'a>>
    where
        Self: 'a,
        AttachCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut AttachCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            ctx.task.enter_step();
            let mut detach_info = DetachInfo::default();
            detach_info.client_chid.set(ctx.channel.chid());
            detach_info.server_chid.set(ctx.channel.mapped_chid());
            let payload = DetachMsgV1 { detach_info }.serialize();

            match ctx
                .round_trip(CtlOpcode::QueueInfoDetach, &payload, true)
                .await
            {
                Ok(_frame) => {
                    for binding in ctx.channel.remote_queues() {
                        let _ = ctx
                            .ctl
                            .channel_table
                            .queue_rm_remote(ctx.channel.chid(), binding.qid);
                    }
                    debug!(chid = ctx.channel.chid(), "detach complete");
                    Transition::Done(Ok(()))
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

pub async fn run_detach(mut state: DetachStates, ctx: &mut AttachCtx) -> Result<()> {
    let result = loop {
        let tr = match &mut state {
            DetachStates::Detach(s) => s.step(ctx).await,
        };
        match tr {
            Transition::Next(next_state, _r) => state = next_state,
            Transition::Stay(Ok(_)) => {},
            Transition::Stay(Err(e)) => break Err(e),
            Transition::Done(r) => break r,
        }
    };
    ctx.finish();
    result
}

pub fn start_detach() -> DetachStates {
    DetachStates::Detach(Detach)
}
