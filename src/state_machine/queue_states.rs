// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Per-channel queue workflows: add (local or remote side), remove, pair,
//! unpair. Every workflow is one request/response round followed by the
//! local import or unbind.

use std::pin::Pin;

use anyhow::{Result, anyhow};
use tracing::debug;
use zerocopy::IntoBytes;

use crate::{
    channel::binding_from_info,
    models::{
        handshake::{
            AttachMsgV1, ChannelMsg, QUEUE_SIDE_LOCAL, QUEUE_SIDE_REMOTE, QueueBindInfo,
        },
        opcode::CtlOpcode,
        tlv::{TlvType, TlvWriter},
    },
    state_machine::{StateMachine, Transition, attach_states::AttachCtx},
};

type QueueStepOut = Transition<QueueOpStates, Result<QueueOpStatus>>;

#[derive(Debug, Clone, Default)]
pub struct QueueOpStatus {
    pub l_qid: u32,
    pub r_qid: u32,
}

pub enum QueueOpStates {
    AddLocal(AddLocal),
    AddRemote(AddRemote),
    Remove(Remove),
    Pair(Pair),
    Unpair(Unpair),
}

/* ------------- announce a locally added queue to the server ------------- */

#[derive(Debug)]
pub struct AddLocal {
    pub qid: u32,
}

impl StateMachine<AttachCtx, QueueStepOut> for AddLocal {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = QueueStepOut> + Send + 'a>>
    where
        Self: 'a,
        AttachCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut AttachCtx) -> Self::StepResult<'a> {
        let qid = self.qid;
        Box::pin(async move {
            ctx.task.enter_step();
            let Some(q) = ctx.channel.local_queue(qid) else {
                return Transition::Done(Err(anyhow!("queue {qid} not in channel")));
            };
            let cfg = q.cfg();
            let b = q.export_binding();
            let mut info = crate::models::handshake::QueueInfo::default();
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

            let bind = QueueBindInfo {
                l_qid: zerocopy::U32::new(qid),
                mapped_server_chid: zerocopy::U32::new(ctx.channel.mapped_chid()),
                queue_side: QUEUE_SIDE_LOCAL,
                ..Default::default()
            };
            let mut w = TlvWriter::new();
            w.push(TlvType::QueueBindInfo, bind.as_bytes());
            w.push(TlvType::QueueInfo, info.as_bytes());
            let payload = w.finish();

            match ctx.round_trip(CtlOpcode::QueueInfoAdd, &payload, true).await {
                Ok(_) => {
                    debug!(qid, "local queue announced");
                    Transition::Done(Ok(QueueOpStatus {
                        l_qid: qid,
                        r_qid: 0,
                    }))
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

/* ------------- ask the server to offer a queue of its own --------------- */

#[derive(Debug)]
pub struct AddRemote;

impl StateMachine<AttachCtx, QueueStepOut> for AddRemote {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = QueueStepOut> + Send + 'a>>
    where
        Self: 'a,
        AttachCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut AttachCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            ctx.task.enter_step();
            let bind = QueueBindInfo {
                mapped_server_chid: zerocopy::U32::new(ctx.channel.mapped_chid()),
                queue_side: QUEUE_SIDE_REMOTE,
                ..Default::default()
            };
            let payload = bind.serialize();
            let frame = match ctx.round_trip(CtlOpcode::QueueInfoAdd, &payload, true).await
            {
                Ok(f) => f,
                Err(e) => return Transition::Done(Err(e)),
            };
            // reply carries the offered queue inside a channel message
            let reply = match AttachMsgV1::deserialize(&frame.payload) {
                Ok(r) => r,
                Err(e) => return Transition::Done(Err(e.into())),
            };
            let Some(chmsg) = reply.chmsgs.first() else {
                return Transition::Done(Err(anyhow!("add-queue reply without queue")));
            };
            let Some(info) = chmsg.qinfos.first() else {
                return Transition::Done(Err(anyhow!("add-queue reply without queue")));
            };
            let binding = binding_from_info(chmsg.chinfo.key.eid, info);
            if let Err(e) = ctx
                .ctl
                .channel_table
                .queue_add_remote(ctx.channel.chid(), binding)
            {
                return Transition::Done(Err(e.into()));
            }
            debug!(r_qid = binding.qid, "remote queue imported");
            Transition::Done(Ok(QueueOpStatus {
                l_qid: 0,
                r_qid: binding.qid,
            }))
        })
    }
}

/* -------------------- remove (either side) -------------------- */

#[derive(Debug)]
pub struct Remove {
    pub qid: u32,
    pub remote: bool,
}

impl StateMachine<AttachCtx, QueueStepOut> for Remove {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = QueueStepOut> + Send + 'a>>
    where
        Self: 'a,
        AttachCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut AttachCtx) -> Self::StepResult<'a> {
        let (qid, remote) = (self.qid, self.remote);
        Box::pin(async move {
            ctx.task.enter_step();
            let bind = QueueBindInfo {
                l_qid: zerocopy::U32::new(if remote { 0 } else { qid }),
                r_qid: zerocopy::U32::new(if remote { qid } else { 0 }),
                mapped_server_chid: zerocopy::U32::new(ctx.channel.mapped_chid()),
                queue_side: if remote { QUEUE_SIDE_REMOTE } else { QUEUE_SIDE_LOCAL },
                ..Default::default()
            };
            let payload = bind.serialize();
            match ctx.round_trip(CtlOpcode::QueueInfoRm, &payload, true).await {
                Ok(_) => {
                    let res = if remote {
                        ctx.ctl
                            .channel_table
                            .queue_rm_remote(ctx.channel.chid(), qid)
                            .map(|_| ())
                    } else {
                        ctx.ctl
                            .channel_table
                            .queue_rm_local(ctx.channel.chid(), qid)
                            .map(|_| ())
                    };
                    match res {
                        Ok(()) => Transition::Done(Ok(QueueOpStatus {
                            l_qid: if remote { 0 } else { qid },
                            r_qid: if remote { qid } else { 0 },
                        })),
                        Err(e) => Transition::Done(Err(e.into())),
                    }
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

/* -------------------- pair / unpair -------------------- */

#[derive(Debug)]
pub struct Pair {
    pub l_qid: u32,
    pub r_qid: u32,
}

impl StateMachine<AttachCtx, QueueStepOut> for Pair {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = QueueStepOut> + Send + 'a>>
    where
        Self: 'a,
        AttachCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut AttachCtx) -> Self::StepResult<'a> {
        let (l_qid, r_qid) = (self.l_qid, self.r_qid);
        Box::pin(async move {
            ctx.task.enter_step();
            let bind = QueueBindInfo {
                l_qid: zerocopy::U32::new(l_qid),
                r_qid: zerocopy::U32::new(r_qid),
                mapped_server_chid: zerocopy::U32::new(ctx.channel.mapped_chid()),
                queue_side: QUEUE_SIDE_LOCAL,
                ..Default::default()
            };
            let payload = bind.serialize();
            match ctx.round_trip(CtlOpcode::QueueInfoBind, &payload, true).await {
                Ok(_) => match ctx
                    .ctl
                    .channel_table
                    .queue_pair(ctx.channel.chid(), l_qid, r_qid)
                {
                    Ok(()) => {
                        debug!(l_qid, r_qid, "queues paired");
                        Transition::Done(Ok(QueueOpStatus { l_qid, r_qid }))
                    },
                    Err(e) => Transition::Done(Err(e.into())),
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

#[derive(Debug)]
pub struct Unpair {
    pub l_qid: u32,
    pub r_qid: u32,
}

impl StateMachine<AttachCtx, QueueStepOut> for Unpair {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = QueueStepOut> + Send + 'a>>
    where
        Self: 'a,
        AttachCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut AttachCtx) -> Self::StepResult<'a> {
        let (l_qid, r_qid) = (self.l_qid, self.r_qid);
        Box::pin(async move {
            ctx.task.enter_step();
            let bind = QueueBindInfo {
                l_qid: zerocopy::U32::new(l_qid),
                r_qid: zerocopy::U32::new(r_qid),
                mapped_server_chid: zerocopy::U32::new(ctx.channel.mapped_chid()),
                queue_side: QUEUE_SIDE_LOCAL,
                ..Default::default()
            };
            let payload = bind.serialize();
            match ctx
                .round_trip(CtlOpcode::QueueInfoUnbind, &payload, true)
                .await
            {
                Ok(_) => match ctx.ctl.channel_table.queue_unpair(ctx.channel.chid(), l_qid)
                {
                    Ok(()) => Transition::Done(Ok(QueueOpStatus { l_qid, r_qid })),
                    Err(e) => Transition::Done(Err(e.into())),
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

pub async fn run_queue_op(
    mut state: QueueOpStates,
    ctx: &mut AttachCtx,
) -> Result<QueueOpStatus> {
    let result = loop {
        let tr = match &mut state {
            QueueOpStates::AddLocal(s) => s.step(ctx).await,
            QueueOpStates::AddRemote(s) => s.step(ctx).await,
            QueueOpStates::Remove(s) => s.step(ctx).await,
            QueueOpStates::Pair(s) => s.step(ctx).await,
            QueueOpStates::Unpair(s) => s.step(ctx).await,
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

/// Build an exportable descriptor for one channel message; used by attach
/// and refresh alike.
pub fn channel_msg_for(channel: &crate::channel::Channel, key: crate::models::handshake::InstanceKey) -> ChannelMsg {
    let mut chinfo = crate::models::handshake::ChannelInfo::default();
    chinfo.chid.set(channel.chid());
    chinfo.key = key;
    ChannelMsg {
        chinfo,
        qinfos: channel.export_queue_infos(),
    }
}
