// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Server-side mirrors of the client workflows. Every inbound request frame
//! becomes a short-lived server task; the reply echoes the client's task id
//! so the requester's receive phase can match it.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use tracing::{debug, warn};
use zerocopy::FromBytes as ZFromBytes;

use crate::{
    channel::binding_from_info,
    errors::ErrCode,
    models::{
        control::{CTL_VERSION_MAX, CtlHead},
        handshake::{
            AttachInfo, AttachMsgV1, ChannelMsg, DetachMsgV1, QUEUE_SIDE_LOCAL,
            QUEUE_SIDE_REMOTE, QueueBindInfo, QueueInfo,
        },
        opcode::CtlOpcode,
        tlv::{self, TlvType},
    },
    state_machine::{
        ControlCtx,
        queue_states::channel_msg_for,
        task::{TaskEngine, WorkflowType},
    },
    transport::{CtlFrame, server::ServerAcceptEntry},
};

/// Delay applied before server channels of one TCP are actually released,
/// coalescing teardown of co-located channels.
pub const RELEASE_DELAY: Duration = Duration::from_millis(200);

pub struct ServerEngine {
    pub ctl: ControlCtx,
    pub tasks: Arc<TaskEngine>,
}

impl ServerEngine {
    pub fn new(ctl: ControlCtx, tasks: Arc<TaskEngine>) -> Arc<Self> {
        Arc::new(Self { ctl, tasks })
    }

    /// Entry point wired into the listener dispatch. Runs each frame on its
    /// own tokio task so one slow handler cannot stall the read loop.
    pub fn handle_frame(self: &Arc<Self>, entry: Arc<ServerAcceptEntry>, frame: CtlFrame) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let opcode = frame.head.ctl_opcode_known();
            let task_id = frame.head.task_id.get();
            let res = match opcode {
                Some(CtlOpcode::SessionUpdate) => this.handle_neg(&entry, &frame).await,
                Some(CtlOpcode::QueueInfoAttach) => {
                    this.handle_attach(&entry, &frame).await
                },
                Some(CtlOpcode::QueueInfoDetach) => {
                    this.handle_detach(&entry, &frame).await
                },
                Some(CtlOpcode::QueueInfoAdd) => {
                    this.handle_add_queue(&entry, &frame).await
                },
                Some(CtlOpcode::QueueInfoRm) => this.handle_rm_queue(&entry, &frame).await,
                Some(CtlOpcode::QueueInfoBind) => this.handle_pair(&entry, &frame).await,
                Some(CtlOpcode::QueueInfoUnbind) => {
                    this.handle_unpair(&entry, &frame).await
                },
                Some(CtlOpcode::QueueInfoRefresh) => {
                    this.handle_refresh(&entry, &frame).await
                },
                Some(CtlOpcode::TaskCancel) => {
                    this.handle_task_cancel(&entry, &frame);
                    Ok(())
                },
                _ => Err(anyhow!("unsupported ctl opcode {}", frame.head.ctl_opcode)),
            };
            if let Err(e) = res {
                warn!(task_id, "server handler failed: {e}");
                let _ = this.reply_error(&entry, &frame, ErrCode::ProtocolErr).await;
            }
        });
    }

    fn reply_head(&self, frame: &CtlFrame, data_size: u32) -> CtlHead {
        let mut head = CtlHead::new(
            frame.head.version.min(CTL_VERSION_MAX),
            frame
                .head
                .ctl_opcode_known()
                .unwrap_or(CtlOpcode::SessionUpdate),
            frame.head.channel.get(),
            data_size,
        );
        head.task_id.set(frame.head.task_id.get());
        head.set_capability(frame.head.capability());
        head
    }

    async fn reply(
        &self,
        entry: &ServerAcceptEntry,
        frame: &CtlFrame,
        payload: &[u8],
    ) -> Result<()> {
        let head = self.reply_head(frame, payload.len() as u32);
        entry.conn().send_msg(&head, payload).await
    }

    async fn reply_error(
        &self,
        entry: &ServerAcceptEntry,
        frame: &CtlFrame,
        code: ErrCode,
    ) -> Result<()> {
        let mut head = self.reply_head(frame, 0);
        head.set_error(code as i32 as i16);
        entry.conn().send_msg(&head, &[]).await
    }

    /* ---------------- negotiation ---------------- */

    async fn handle_neg(
        &self,
        entry: &Arc<ServerAcceptEntry>,
        frame: &CtlFrame,
    ) -> Result<()> {
        use crate::models::handshake::NegMsgV1;
        let req = NegMsgV1::deserialize(&frame.payload)?;
        debug!(
            has_key = req.crypto_key.is_some(),
            "negotiation request received"
        );
        let reply = NegMsgV1 {
            crypto_key: req
                .crypto_key
                .is_some()
                .then(|| self.ctl.local_key.eid.to_vec()),
        };
        self.reply(entry, frame, &reply.serialize()).await
    }

    /* ---------------- attach ---------------- */

    async fn handle_attach(
        self: &Arc<Self>,
        entry: &Arc<ServerAcceptEntry>,
        frame: &CtlFrame,
    ) -> Result<()> {
        let req = AttachMsgV1::deserialize(&frame.payload)?;
        let client_msg = req
            .chmsgs
            .first()
            .ok_or_else(|| anyhow!("attach without channel message"))?;
        let client_key = client_msg.chinfo.key;
        entry.bind_client_key(client_key);

        let task = self.tasks.create_task(
            client_key,
            frame.head.task_id.get(),
            WorkflowType::HandleAttachReq,
            client_msg.chinfo.chid.get(),
            0,
            true,
        )?;

        // materialise the server channel mapped onto the client's
        let channel = self.ctl.channel_table.create(client_key);
        channel.set_mapped_chid(client_msg.chinfo.chid.get());
        channel.set_keepalive_attr(req.attach_info.keepalive_attr.get() as u32);
        entry.track_channel(channel.chid());

        for info in &client_msg.qinfos {
            let binding = binding_from_info(client_key.eid, info);
            self.ctl
                .channel_table
                .queue_add_remote(channel.chid(), binding)?;
        }

        // serve the registered queues over this channel and bind them to
        // the client's, positionally
        let serving = self.ctl.server_queue_list();
        for (q, info) in serving.iter().zip(client_msg.qinfos.iter()) {
            if self.ctl.channel_table.owner_of(q.qid()).is_none() {
                self.ctl
                    .channel_table
                    .queue_add_local(channel.chid(), Arc::clone(q))?;
            }
            let binding = binding_from_info(client_key.eid, info);
            q.bind_peer(binding)?;
        }

        let mut attach_info = AttachInfo::default();
        attach_info.server_chid.set(channel.chid());
        let reply = AttachMsgV1 {
            attach_info,
            chmsgs: vec![channel_msg_for(&channel, self.ctl.local_key)],
        };
        let payload = reply.serialize()?;
        let res = self.reply(entry, frame, &payload).await;
        self.tasks.put(&task);
        debug!(server_chid = channel.chid(), "attach request served");
        res
    }

    /* ---------------- detach ---------------- */

    async fn handle_detach(
        self: &Arc<Self>,
        entry: &Arc<ServerAcceptEntry>,
        frame: &CtlFrame,
    ) -> Result<()> {
        let req = DetachMsgV1::deserialize(&frame.payload)?;
        let server_chid = req.detach_info.server_chid.get();
        self.reply(entry, frame, &req.serialize()).await?;
        entry.untrack_channel(server_chid);
        self.schedule_release(vec![server_chid]);
        Ok(())
    }

    /// Deferred channel teardown: co-located channels released over one TCP
    /// coalesce into a single sweep.
    pub fn schedule_release(self: &Arc<Self>, chids: Vec<u32>) {
        if chids.is_empty() {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RELEASE_DELAY).await;
            for chid in chids {
                match this.ctl.channel_table.remove(chid) {
                    Ok(()) => debug!(chid, "server channel released"),
                    Err(e) => debug!(chid, "release skipped: {e}"),
                }
            }
        });
    }

    /* ---------------- queue add / rm ---------------- */

    async fn handle_add_queue(
        self: &Arc<Self>,
        entry: &Arc<ServerAcceptEntry>,
        frame: &CtlFrame,
    ) -> Result<()> {
        let bind = QueueBindInfo::deserialize(&frame.payload)?;
        let channel = self
            .ctl
            .channel_table
            .get(bind.mapped_server_chid.get())
            .ok_or_else(|| anyhow!("unknown server channel"))?;

        match bind.queue_side {
            QUEUE_SIDE_LOCAL => {
                // the client added one of its own queues; import it
                let info_el = tlv::search(&frame.payload, TlvType::QueueInfo)?
                    .ok_or_else(|| anyhow!("add-queue without queue info"))?;
                let info = QueueInfo::read_from_bytes(info_el.value)
                    .map_err(|e| anyhow!("bad queue info: {e}"))?;
                let binding = binding_from_info(channel.peer().eid, &info);
                self.ctl
                    .channel_table
                    .queue_add_remote(channel.chid(), binding)?;
                self.reply(entry, frame, &[]).await
            },
            QUEUE_SIDE_REMOTE => {
                // offer one of the registered queues back to the client
                let serving = self.ctl.server_queue_list();
                let q = serving
                    .iter()
                    .find(|q| self.ctl.channel_table.owner_of(q.qid()).is_none())
                    .ok_or_else(|| anyhow!("no queue available to offer"))?;
                self.ctl
                    .channel_table
                    .queue_add_local(channel.chid(), Arc::clone(q))?;
                let reply = AttachMsgV1 {
                    attach_info: AttachInfo::default(),
                    chmsgs: vec![channel_msg_for(&channel, self.ctl.local_key)],
                };
                self.reply(entry, frame, &reply.serialize()?).await
            },
            side => Err(anyhow!("bad queue side {side}")),
        }
    }

    async fn handle_rm_queue(
        self: &Arc<Self>,
        entry: &Arc<ServerAcceptEntry>,
        frame: &CtlFrame,
    ) -> Result<()> {
        let bind = QueueBindInfo::deserialize(&frame.payload)?;
        let chid = bind.mapped_server_chid.get();
        match bind.queue_side {
            // sides mirror: the client's local queue is our remote one
            QUEUE_SIDE_LOCAL => {
                self.ctl
                    .channel_table
                    .queue_rm_remote(chid, bind.l_qid.get())?;
            },
            QUEUE_SIDE_REMOTE => {
                let _ = self
                    .ctl
                    .channel_table
                    .queue_rm_local(chid, bind.r_qid.get())?;
            },
            side => return Err(anyhow!("bad queue side {side}")),
        }
        self.reply(entry, frame, &[]).await
    }

    /* ---------------- pair / unpair ---------------- */

    async fn handle_pair(
        self: &Arc<Self>,
        entry: &Arc<ServerAcceptEntry>,
        frame: &CtlFrame,
    ) -> Result<()> {
        let bind = QueueBindInfo::deserialize(&frame.payload)?;
        let chid = bind.mapped_server_chid.get();
        // our local r_qid binds to the client's l_qid
        self.ctl
            .channel_table
            .queue_pair(chid, bind.r_qid.get(), bind.l_qid.get())?;
        self.reply(entry, frame, &[]).await
    }

    async fn handle_unpair(
        self: &Arc<Self>,
        entry: &Arc<ServerAcceptEntry>,
        frame: &CtlFrame,
    ) -> Result<()> {
        let bind = QueueBindInfo::deserialize(&frame.payload)?;
        let chid = bind.mapped_server_chid.get();
        self.ctl.channel_table.queue_unpair(chid, bind.r_qid.get())?;
        self.reply(entry, frame, &[]).await
    }

    /* ---------------- refresh ---------------- */

    async fn handle_refresh(
        self: &Arc<Self>,
        entry: &Arc<ServerAcceptEntry>,
        frame: &CtlFrame,
    ) -> Result<()> {
        let chid = frame.head.channel.get();
        let channel = self
            .ctl
            .channel_table
            .find_by_peer(&entry.client_key().unwrap_or_default())
            .or_else(|| self.ctl.channel_table.get(chid))
            .ok_or_else(|| anyhow!("refresh for unknown channel"))?;

        // queues the client announced since attach are bound here
        let remotes = channel.remote_queues();
        let serving = self.ctl.server_queue_list();
        for (q, binding) in serving.iter().zip(remotes.iter()) {
            if self.ctl.channel_table.owner_of(q.qid()).is_none() {
                self.ctl
                    .channel_table
                    .queue_add_local(channel.chid(), Arc::clone(q))?;
            }
            if q.peer_binding().is_none() {
                q.bind_peer(*binding)?;
            }
        }

        let reply = AttachMsgV1 {
            attach_info: {
                let mut i = AttachInfo::default();
                i.server_chid.set(channel.chid());
                i
            },
            chmsgs: vec![channel_msg_for(&channel, self.ctl.local_key)],
        };
        self.reply(entry, frame, &reply.serialize()?).await
    }

    /* ---------------- cancel ---------------- */

    fn handle_task_cancel(&self, entry: &Arc<ServerAcceptEntry>, frame: &CtlFrame) {
        let Some(key) = entry.client_key() else {
            return;
        };
        if let Some(task) = self.tasks.get(&key, frame.head.task_id.get()) {
            debug!(task_id = task.task_id, "peer canceled task");
            task.user_cancel();
            self.tasks.put(&task);
        }
    }
}
