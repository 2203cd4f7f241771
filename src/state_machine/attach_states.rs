// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Client side of channel attach:
//! `SendNeg → RecvNeg → SendAttach → RecvAttach → ImportQueues → Done`.
//!
//! Each typed state performs its send phase, parks the task on the active
//! list while the transport round-trips, and consumes the reply; the runner
//! walks the transitions until `Done`.

use std::{pin::Pin, sync::Arc, time::Duration};

use anyhow::{Result, anyhow, bail};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    cfg::config::Feature,
    channel::{Channel, binding_from_info},
    models::{
        control::{CTL_VERSION_MAX, CtlCapability, CtlHead},
        handshake::{AttachInfo, AttachMsgV1, ChannelMsg, NegMsgV1},
        opcode::CtlOpcode,
    },
    state_machine::{
        ControlCtx, StateMachine, Transition,
        task::{TaskCtx, TaskListType, TaskState},
    },
    transport::{CtlFrame, conn::CtlConnection},
};

#[derive(Debug, Clone)]
pub struct AttachStatus {
    pub server_chid: u32,
    pub paired_queues: usize,
    pub cap: CtlCapability,
    pub version: u8,
}

pub struct AttachCtx {
    pub ctl: ControlCtx,
    pub conn: Arc<CtlConnection>,
    pub task: Arc<TaskCtx>,
    pub channel: Arc<Channel>,
    pub timeout: Duration,
    pub cap: CtlCapability,
    pub version: u8,
    pub crypto_key: Option<Vec<u8>>,
    rx: Option<mpsc::Receiver<CtlFrame>>,
}

impl AttachCtx {
    pub fn new(
        ctl: ControlCtx,
        conn: Arc<CtlConnection>,
        task: Arc<TaskCtx>,
        channel: Arc<Channel>,
        timeout: Duration,
    ) -> Self {
        let mut cap = CtlCapability::empty();
        if ctl.feature.contains(Feature::DP_ENCRYPT) {
            cap |= CtlCapability::DP_ENCRYPT;
        }
        if ctl.feature.contains(Feature::KEEPALIVE) {
            cap |= CtlCapability::KEEPALIVE;
        }
        Self {
            ctl,
            conn,
            task,
            channel,
            timeout,
            cap,
            version: CTL_VERSION_MAX,
            crypto_key: None,
            rx: None,
        }
    }

    fn head(&self, opcode: CtlOpcode, data_size: u32, is_start: bool) -> CtlHead {
        let mut head =
            CtlHead::new(self.version, opcode, self.channel.chid(), data_size);
        head.task_id.set(self.task.task_id);
        let mut cap = self.cap;
        if is_start {
            cap |= CtlCapability::IS_START;
        }
        head.set_capability(cap);
        head
    }

    /// One request/response round over the side-band, with the task-state
    /// bookkeeping every phase shares.
    pub(crate) async fn round_trip(
        &mut self,
        opcode: CtlOpcode,
        payload: &[u8],
        is_start: bool,
    ) -> Result<CtlFrame> {
        if self.rx.is_none() {
            self.rx = Some(self.conn.register_task(self.task.task_id));
        }
        let head = self.head(opcode, payload.len() as u32, is_start);

        self.task.set_task_state(TaskState::PendingSend);
        self.task.move_list(TaskListType::Active);
        self.task.set_task_state(TaskState::Sending);
        self.conn.send_msg(&head, payload).await?;
        self.task.set_task_state(TaskState::PendingRecv);

        let mut rx = self.rx.take().ok_or_else(|| anyhow!("no task receiver"))?;
        self.task.set_task_state(TaskState::Recving);
        let frame_res = tokio::select! {
            _ = self.task.cancel.cancelled() => Err(anyhow!("task canceled")),
            f = self.conn.recv_frame(&mut rx, self.timeout) => f,
        };
        self.rx = Some(rx);
        self.task.move_list(TaskListType::Running);
        let frame = frame_res?;
        if frame.head.error_code.get() != 0 {
            bail!(
                "peer rejected {opcode:?}: error {}",
                frame.head.error_code.get()
            );
        }
        self.task.set_task_state(TaskState::StepComplete);
        Ok(frame)
    }

    pub fn finish(&self) {
        self.conn.unregister_task(self.task.task_id);
    }
}

type AttachStepOut = Transition<AttachStates, Result<AttachStatus>>;

pub enum AttachStates {
    Negotiate(Negotiate),
    Attach(Attach),
    ImportQueues(ImportQueues),
}

/* -------------------- step 1: capability negotiation -------------------- */

#[derive(Debug)]
pub struct Negotiate;

impl StateMachine<AttachCtx, AttachStepOut> for Negotiate {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = AttachStepOut> + Send + 'a>>
    where
        Self: 'a,
        AttachCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut AttachCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            ctx.task.enter_step();
            let neg = NegMsgV1 {
                crypto_key: ctx
                    .cap
                    .contains(CtlCapability::DP_ENCRYPT)
                    .then(|| ctx.ctl.local_key.eid.to_vec()),
            };
            let payload = neg.serialize();
            let frame = match ctx
                .round_trip(CtlOpcode::SessionUpdate, &payload, true)
                .await
            {
                Ok(f) => f,
                Err(e) => return Transition::Done(Err(e)),
            };

            // both sides settle on the lower version and the capability
            // intersection
            ctx.version = frame.head.version.min(CTL_VERSION_MAX);
            ctx.cap &= frame.head.capability() | CtlCapability::IS_START;
            match NegMsgV1::deserialize(&frame.payload) {
                Ok(reply) => {
                    ctx.crypto_key = reply.crypto_key;
                    debug!(version = ctx.version, "negotiation complete");
                    Transition::Next(
                        AttachStates::Attach(Attach),
                        Err(anyhow!("attach pending")),
                    )
                },
                Err(e) => Transition::Done(Err(e.into())),
            }
        })
    }
}

/* -------------------- step 2: attach exchange -------------------- */

#[derive(Debug)]
pub struct Attach;

impl StateMachine<AttachCtx, AttachStepOut> for Attach {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = AttachStepOut> + Send + 'a>>
    where
        Self: 'a,
        AttachCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut AttachCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            ctx.task.enter_step();
            let mut chinfo = crate::models::handshake::ChannelInfo {
                key: ctx.ctl.local_key,
                ..Default::default()
            };
            chinfo.chid.set(ctx.channel.chid());
            let mut attach_info = AttachInfo::default();
            attach_info
                .keepalive_attr
                .set(ctx.channel.keepalive_attr() as u64);
            let msg = AttachMsgV1 {
                attach_info,
                chmsgs: vec![ChannelMsg {
                    chinfo,
                    qinfos: ctx.channel.export_queue_infos(),
                }],
            };
            let payload = match msg.serialize() {
                Ok(p) => p,
                Err(e) => return Transition::Done(Err(e.into())),
            };
            let frame = match ctx
                .round_trip(CtlOpcode::QueueInfoAttach, &payload, false)
                .await
            {
                Ok(f) => f,
                Err(e) => return Transition::Done(Err(e)),
            };
            match AttachMsgV1::deserialize(&frame.payload) {
                Ok(reply) => Transition::Next(
                    AttachStates::ImportQueues(ImportQueues { reply }),
                    Err(anyhow!("import pending")),
                ),
                Err(e) => Transition::Done(Err(e.into())),
            }
        })
    }
}

/* -------------------- step 3: import the server's queues ---------------- */

pub struct ImportQueues {
    pub reply: AttachMsgV1,
}

impl StateMachine<AttachCtx, AttachStepOut> for ImportQueues {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = AttachStepOut> + Send + 'a>>
    where
        Self: 'a,
        AttachCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut AttachCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            ctx.task.enter_step();
            ctx.task.set_task_state(TaskState::Importing);

            let server_chid = self.reply.attach_info.server_chid.get();
            ctx.channel.set_mapped_chid(server_chid);

            let Some(server_msg) = self.reply.chmsgs.first() else {
                return Transition::Done(Err(anyhow!(
                    "attach reply carries no channel message"
                )));
            };
            ctx.channel.set_peer(server_msg.chinfo.key);
            let peer_eid = server_msg.chinfo.key.eid;
            for info in &server_msg.qinfos {
                let binding = binding_from_info(peer_eid, info);
                if let Err(e) = ctx
                    .ctl
                    .channel_table
                    .queue_add_remote(ctx.channel.chid(), binding)
                {
                    return Transition::Done(Err(e.into()));
                }
            }

            // pair local and remote queues positionally; a later refresh or
            // explicit pair call can rebind
            let locals = ctx.channel.local_queues();
            let mut paired = 0usize;
            for (q, info) in locals.iter().zip(server_msg.qinfos.iter()) {
                let binding = binding_from_info(peer_eid, info);
                match q.bind_peer(binding) {
                    Ok(()) => paired += 1,
                    Err(e) => return Transition::Done(Err(e.into())),
                }
            }

            ctx.task.set_task_state(TaskState::StepComplete);
            Transition::Done(Ok(AttachStatus {
                server_chid,
                paired_queues: paired,
                cap: ctx.cap,
                version: ctx.version,
            }))
        })
    }
}

pub async fn run_attach(
    mut state: AttachStates,
    ctx: &mut AttachCtx,
) -> Result<AttachStatus> {
    debug!(chid = ctx.channel.chid(), "attach workflow start");
    let result = loop {
        let tr = match &mut state {
            AttachStates::Negotiate(s) => s.step(ctx).await,
            AttachStates::Attach(s) => s.step(ctx).await,
            AttachStates::ImportQueues(s) => s.step(ctx).await,
        };
        match tr {
            Transition::Next(next_state, _r) => {
                state = next_state;
            },
            Transition::Stay(Ok(_)) => {},
            Transition::Stay(Err(e)) => break Err(e),
            Transition::Done(r) => break r,
        }
    };
    ctx.finish();
    result
}

pub fn start_attach() -> AttachStates {
    AttachStates::Negotiate(Negotiate)
}
