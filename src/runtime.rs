// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! The runtime object: every process-wide table lives here, created by
//! `init` and torn down by `uninit`. Public operations are methods; there
//! are no globals beyond the in-process fabric the loopback provider
//! models.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use dashmap::DashMap;
use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::{Feature, UrpcConfig},
    channel::{Channel, ChannelTable},
    errors::{ErrCode, UrpcError, UrpcResult},
    events::{AsyncEvent, AsyncEventQueue, AsyncEventType, timer::TimerWheel},
    models::{
        common::{REQ_HEAD_LEN, RSP_HEAD_LEN},
        control::CtlHead,
        handshake::InstanceKey,
        opcode::{CtlOpcode, KEEPALIVE_FUNCTION_ID, MsgStatus},
        parse::Msg,
        response::RspHeadBuilder,
    },
    provider::{IoDirection, Provider, loopback},
    queue::{Queue, QueueCfg, TxMsg, jetty::QueueCompletion},
    state_machine::{
        ControlCtx,
        attach_states::{AttachCtx, AttachStatus, run_attach, start_attach},
        detach_states::{run_detach, start_detach},
        queue_states::{
            AddLocal, AddRemote, Pair, QueueOpStates, Remove, Unpair, run_queue_op,
        },
        server_states::ServerEngine,
        task::{TaskCtx, TaskEngine, WorkflowType},
    },
    transport::{
        client::ClientConnectTable,
        conn::CtlConnection,
        server::{AcceptDispatch, CtlListener},
    },
};

const STATE_UNINIT: u8 = 0;
const STATE_INIT: u8 = 1;

/// Handler invoked for every RX completion of a served queue.
pub type RxHandler = Arc<dyn Fn(&Queue, &QueueCompletion) + Send + Sync>;

/// Server function: takes the request payload, returns status and reply
/// bytes.
pub type FunctionHandler = Arc<dyn Fn(&[u8]) -> (MsgStatus, Vec<u8>) + Send + Sync>;

pub struct Runtime {
    cfg: UrpcConfig,
    state: AtomicU8,
    local_key: InstanceKey,
    provider: Arc<dyn Provider>,
    channel_table: Arc<ChannelTable>,
    tasks: Arc<TaskEngine>,
    events: Arc<AsyncEventQueue>,
    wheel: Arc<TimerWheel>,
    connect_table: ClientConnectTable,
    listener: Mutex<Option<Arc<CtlListener>>>,
    server_engine: Mutex<Option<Arc<ServerEngine>>>,
    server_queues: Arc<Mutex<Vec<Arc<Queue>>>>,
    queues: DashMap<u32, Arc<Queue>>,
    rx_handlers: DashMap<u32, RxHandler>,
    functions: DashMap<u64, FunctionHandler>,
    next_qid: AtomicU32,
    next_req_id: AtomicU32,
    keepalive_misses: DashMap<u32, Arc<AtomicU32>>,
    state_cb: Mutex<Option<StateCallback>>,
    cancel: CancellationToken,
}

/// Service lifecycle hooks fired when the runtime flips between uninit and
/// init, keeping control-path and data-path startup from racing.
pub struct StateCallback {
    pub service_start: Box<dyn Fn() + Send + Sync>,
    pub service_end: Box<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("channels", &self.channel_table.len())
            .finish()
    }
}

impl Runtime {
    /// Bring the runtime up with the in-process provider.
    pub async fn init(cfg: UrpcConfig) -> Result<Arc<Self>> {
        let provider = loopback::process_fabric().provider(cfg.local_eid());
        Self::init_with_provider(cfg, provider).await
    }

    pub async fn init_with_provider(
        cfg: UrpcConfig,
        provider: Arc<dyn Provider>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let nonce: u32 = rand::rng().random();
        let local_key = InstanceKey::new(cfg.local_eid(), std::process::id(), nonce);

        let wheel = TimerWheel::new();
        wheel.spawn_driver();

        let rt = Arc::new(Self {
            local_key,
            provider,
            channel_table: Arc::new(ChannelTable::new()),
            tasks: TaskEngine::new(),
            events: AsyncEventQueue::new(),
            wheel,
            connect_table: ClientConnectTable::new(),
            listener: Mutex::new(None),
            server_engine: Mutex::new(None),
            server_queues: Arc::new(Mutex::new(Vec::new())),
            queues: DashMap::new(),
            rx_handlers: DashMap::new(),
            functions: DashMap::new(),
            next_qid: AtomicU32::new(1),
            next_req_id: AtomicU32::new(1),
            keepalive_misses: DashMap::new(),
            state_cb: Mutex::new(None),
            cancel: CancellationToken::new(),
            state: AtomicU8::new(STATE_UNINIT),
            cfg,
        });

        if rt.cfg.role.listens() {
            let addr = rt
                .cfg
                .control_plane
                .listen
                .expect("validated listen address");
            let engine = ServerEngine::new(rt.control_ctx(), Arc::clone(&rt.tasks));
            let dispatch_engine = Arc::clone(&engine);
            let dispatch: AcceptDispatch = Arc::new(move |entry, frame| {
                dispatch_engine.handle_frame(entry, frame);
            });
            let listener = CtlListener::bind(
                addr,
                rt.cfg.io_timeout,
                dispatch,
                rt.cancel.child_token(),
            )
            .await?;
            debug!(addr = %listener.local_addr(), "control-plane listener up");
            *rt.listener.lock().expect("listener lock poisoned") = Some(listener);
            *rt.server_engine.lock().expect("engine lock poisoned") = Some(engine);
        }

        rt.state.store(STATE_INIT, Ordering::Release);
        if let Some(cb) = rt.state_cb.lock().expect("state cb lock poisoned").as_ref() {
            (cb.service_start)();
        }
        Ok(rt)
    }

    /// Register the service lifecycle hooks. The start hook runs right away
    /// when the runtime is already up.
    pub fn set_state_callback(&self, cb: StateCallback) {
        if self.state.load(Ordering::Acquire) == STATE_INIT {
            (cb.service_start)();
        }
        *self.state_cb.lock().expect("state cb lock poisoned") = Some(cb);
    }

    pub fn uninit(&self) {
        if let Some(cb) = self.state_cb.lock().expect("state cb lock poisoned").as_ref()
        {
            (cb.service_end)();
        }
        self.state.store(STATE_UNINIT, Ordering::Release);
        self.cancel.cancel();
        self.wheel.shutdown();
        if let Some(listener) = self.listener.lock().expect("listener lock poisoned").take()
        {
            listener.shutdown();
        }
        debug!("runtime uninitialized");
    }

    #[inline]
    fn check_init(&self) -> UrpcResult<()> {
        if self.state.load(Ordering::Acquire) != STATE_INIT {
            return Err(UrpcError::State("runtime not initialized"));
        }
        Ok(())
    }

    pub fn local_key(&self) -> InstanceKey {
        self.local_key
    }

    pub fn events(&self) -> &Arc<AsyncEventQueue> {
        &self.events
    }

    /// Drain completion events; the user-facing edge of the control plane.
    pub fn event_get(&self, out: &mut [AsyncEvent]) -> usize {
        self.events.get(out)
    }

    pub fn timer_wheel(&self) -> &Arc<TimerWheel> {
        &self.wheel
    }

    /// Actual listen address of the side-band (useful with port 0).
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .expect("listener lock poisoned")
            .as_ref()
            .map(|l| l.local_addr())
    }

    fn control_ctx(&self) -> ControlCtx {
        ControlCtx {
            channel_table: Arc::clone(&self.channel_table),
            provider: Arc::clone(&self.provider),
            events: Arc::clone(&self.events),
            local_key: self.local_key,
            feature: self.cfg.feature,
            server_queues: Arc::clone(&self.server_queues),
        }
    }

    /* ---------------- queues ---------------- */

    pub fn queue_create(&self, mut cfg: QueueCfg) -> UrpcResult<Arc<Queue>> {
        self.check_init()?;
        if self.cfg.feature.contains(Feature::ENABLE_FLOW_CONTROL) {
            cfg.flow_control = true;
        }
        let qid = self.next_qid.fetch_add(1, Ordering::Relaxed);
        let q = Queue::create(Arc::clone(&self.provider), qid, cfg)?;
        self.queues.insert(qid, Arc::clone(&q));
        Ok(q)
    }

    pub fn queue_destroy(&self, qid: u32) -> UrpcResult<()> {
        self.check_init()?;
        if self.channel_table.owner_of(qid).is_some() {
            return Err(UrpcError::State("queue still sits in a channel"));
        }
        let (_, q) = self.queues.remove(&qid).ok_or(UrpcError::BadHandle)?;
        q.destroy()
    }

    pub fn queue_get(&self, qid: u32) -> Option<Arc<Queue>> {
        self.queues.get(&qid).map(|q| Arc::clone(q.value()))
    }

    /// Offer a queue to attaching peers (server side).
    pub fn server_queue_register(&self, q: Arc<Queue>) {
        self.server_queues
            .lock()
            .expect("server queues lock poisoned")
            .push(q);
    }

    pub fn register_rx_handler(&self, qid: u32, handler: RxHandler) {
        self.rx_handlers.insert(qid, handler);
    }

    /// Register the function called when a REQ with this id arrives.
    pub fn register_function(&self, function: u64, handler: FunctionHandler) {
        self.functions.insert(function, handler);
    }

    /* ---------------- channels ---------------- */

    pub fn channel_create(&self) -> UrpcResult<Arc<Channel>> {
        self.check_init()?;
        let ch = self.channel_table.create(InstanceKey::default());
        self.wheel
            .pool_add(ch.chid(), self.cfg.timers_per_channel, false);
        Ok(ch)
    }

    pub fn channel_destroy(&self, chid: u32) -> UrpcResult<()> {
        self.check_init()?;
        self.wheel.pool_delete(chid, false);
        self.channel_table.remove(chid)
    }

    pub fn channel_get(&self, chid: u32) -> Option<Arc<Channel>> {
        self.channel_table.get(chid)
    }

    pub fn channel_queue_add(&self, chid: u32, qid: u32) -> UrpcResult<()> {
        self.check_init()?;
        let q = self.queue_get(qid).ok_or(UrpcError::BadHandle)?;
        self.channel_table.queue_add_local(chid, q)
    }

    /* ---------------- control-plane workflows ---------------- */

    async fn workflow_conn(
        &self,
        addr: SocketAddr,
    ) -> Result<(Arc<CtlConnection>, Arc<crate::transport::client::ClientConnectEntry>)>
    {
        let entry = self
            .connect_table
            .get_or_connect(addr, self.cfg.ssl.as_ref(), self.cfg.io_timeout, &self.cancel)
            .await?;
        let conn = entry
            .conn()
            .ok_or_else(|| anyhow::anyhow!("no live side-band connection"))?;
        Ok((conn, entry))
    }

    fn new_task(
        &self,
        workflow: WorkflowType,
        chid: u32,
        timeout_ms: u32,
    ) -> UrpcResult<Arc<TaskCtx>> {
        let task_id = self.tasks.alloc_task_id();
        self.tasks
            .create_task(self.local_key, task_id, workflow, chid, timeout_ms, false)
    }

    async fn run_client_task<F, T>(
        self: &Arc<Self>,
        task: Arc<TaskCtx>,
        conn: Arc<CtlConnection>,
        timeout_ms: u32,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = Duration::from_millis(timeout_ms.max(1) as u64);
        let result = tokio::select! {
            _ = task.cancel.cancelled() => Err(anyhow::anyhow!("task canceled")),
            r = tokio::time::timeout(deadline, fut) => match r {
                Ok(inner) => inner,
                Err(_) => Err(UrpcError::Timeout.into()),
            },
        };
        if result.is_err() && task.outer_step() > 0 {
            // the peer may hold half-built state; tell it to cancel
            task.is_notify.store(true, Ordering::Release);
            if !task.is_send_cancel_msg.swap(true, Ordering::AcqRel) {
                let mut head = CtlHead::new(
                    crate::models::control::CTL_VERSION_MAX,
                    CtlOpcode::TaskCancel,
                    task.channel_id,
                    0,
                );
                head.task_id.set(task.task_id);
                head.set_error(ErrCode::Canceled as i32 as i16);
                if let Err(e) = conn.send_msg(&head, &[]).await {
                    debug!("cancel notify failed: {e}");
                }
            }
        }
        self.tasks.put(&task);
        result
    }

    /// Attach `chid` to the server at `addr`. Completion is reported both by
    /// the returned future and as a `ChannelAttach` async event.
    pub async fn channel_server_attach(
        self: &Arc<Self>,
        chid: u32,
        addr: SocketAddr,
        timeout_ms: u32,
    ) -> Result<AttachStatus> {
        self.check_init()?;
        let channel = self.channel_get(chid).ok_or(UrpcError::BadHandle)?;
        let result = self.attach_inner(&channel, addr, timeout_ms).await;
        let err_code = match &result {
            Ok(_) => ErrCode::Success,
            Err(e) => match e.downcast_ref::<UrpcError>() {
                Some(UrpcError::Timeout) => ErrCode::Timeout,
                Some(ue) => ue.err_code(),
                None => ErrCode::TransportErr,
            },
        };
        self.events.notify(AsyncEvent {
            channel_id: chid,
            event_type: AsyncEventType::ChannelAttach,
            err_code,
            l_qh: 0,
            r_qh: 0,
            ctx: 0,
        });
        result
    }

    async fn attach_inner(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        addr: SocketAddr,
        timeout_ms: u32,
    ) -> Result<AttachStatus> {
        let (conn, entry) = self.workflow_conn(addr).await?;
        let task = self.new_task(WorkflowType::ClientAttachServer, channel.chid(), timeout_ms)?;
        let mut ctx = AttachCtx::new(
            self.control_ctx(),
            Arc::clone(&conn),
            Arc::clone(&task),
            Arc::clone(channel),
            Duration::from_millis(timeout_ms.max(1) as u64),
        );
        let run = run_attach(start_attach(), &mut ctx);
        let status = self
            .run_client_task(task, Arc::clone(&conn), timeout_ms, run)
            .await?;
        channel.set_attach_addr(addr);
        entry.set_server_chid(status.server_chid);
        entry.track_channel(channel.chid());
        debug!(
            chid = channel.chid(),
            server_chid = status.server_chid,
            "channel attached"
        );
        Ok(status)
    }

    pub async fn channel_server_detach(
        self: &Arc<Self>,
        chid: u32,
        timeout_ms: u32,
    ) -> Result<()> {
        self.check_init()?;
        let channel = self.channel_get(chid).ok_or(UrpcError::BadHandle)?;
        let addr = channel
            .attach_addr()
            .ok_or(UrpcError::State("channel was never attached"))?;
        let (conn, entry) = self.workflow_conn(addr).await?;
        let task = self.new_task(WorkflowType::ClientDetachServer, chid, timeout_ms)?;
        let mut ctx = AttachCtx::new(
            self.control_ctx(),
            Arc::clone(&conn),
            Arc::clone(&task),
            Arc::clone(&channel),
            Duration::from_millis(timeout_ms.max(1) as u64),
        );
        let run = run_detach(start_detach(), &mut ctx);
        let result = self
            .run_client_task(task, Arc::clone(&conn), timeout_ms, run)
            .await;
        entry.untrack_channel(chid);
        self.connect_table.release(&entry);
        self.events.notify(AsyncEvent {
            channel_id: chid,
            event_type: AsyncEventType::ChannelDetach,
            err_code: if result.is_ok() {
                ErrCode::Success
            } else {
                ErrCode::Fail
            },
            l_qh: 0,
            r_qh: 0,
            ctx: 0,
        });
        result
    }

    /// Re-exchange and re-pair the channel's queues with the server.
    pub async fn channel_refresh(
        self: &Arc<Self>,
        chid: u32,
        timeout_ms: u32,
    ) -> Result<usize> {
        self.check_init()?;
        let channel = self.channel_get(chid).ok_or(UrpcError::BadHandle)?;
        let addr = channel
            .attach_addr()
            .ok_or(UrpcError::State("channel was never attached"))?;
        let (conn, _entry) = self.workflow_conn(addr).await?;
        let task = self.new_task(WorkflowType::ClientRefreshServer, chid, timeout_ms)?;
        let mut ctx = AttachCtx::new(
            self.control_ctx(),
            Arc::clone(&conn),
            Arc::clone(&task),
            Arc::clone(&channel),
            Duration::from_millis(timeout_ms.max(1) as u64),
        );
        let run = async {
            let frame = ctx
                .round_trip(CtlOpcode::QueueInfoRefresh, &[], true)
                .await?;
            let reply = crate::models::handshake::AttachMsgV1::deserialize(&frame.payload)?;
            let Some(server_msg) = reply.chmsgs.first() else {
                bail!("refresh reply carries no channel message");
            };
            let peer_eid = server_msg.chinfo.key.eid;
            let mut paired = 0usize;
            for info in &server_msg.qinfos {
                let binding = crate::channel::binding_from_info(peer_eid, info);
                ctx.ctl.channel_table.queue_add_remote(chid, binding)?;
            }
            for (q, info) in ctx
                .channel
                .local_queues()
                .iter()
                .zip(server_msg.qinfos.iter())
            {
                let binding = crate::channel::binding_from_info(peer_eid, info);
                q.bind_peer(binding)?;
                paired += 1;
            }
            ctx.finish();
            Ok(paired)
        };
        let paired = self
            .run_client_task(task, Arc::clone(&conn), timeout_ms, run)
            .await?;
        self.events.notify(AsyncEvent {
            channel_id: chid,
            event_type: AsyncEventType::ChannelRefresh,
            err_code: ErrCode::Success,
            l_qh: 0,
            r_qh: 0,
            ctx: 0,
        });
        Ok(paired)
    }

    /// Queue add/rm/pair/unpair, dispatched as an async control task.
    pub async fn channel_queue_op(
        self: &Arc<Self>,
        chid: u32,
        op: QueueOpStates,
        timeout_ms: u32,
    ) -> Result<crate::state_machine::queue_states::QueueOpStatus> {
        self.check_init()?;
        let channel = self.channel_get(chid).ok_or(UrpcError::BadHandle)?;
        let addr = channel
            .attach_addr()
            .ok_or(UrpcError::State("channel was never attached"))?;
        let (conn, _entry) = self.workflow_conn(addr).await?;
        let (workflow, event_type) = match &op {
            QueueOpStates::AddLocal(_) => {
                (WorkflowType::ChannelAddLocalQueue, AsyncEventType::QueueAdd)
            },
            QueueOpStates::AddRemote(_) => {
                (WorkflowType::ChannelAddRemoteQueue, AsyncEventType::QueueAdd)
            },
            QueueOpStates::Remove(r) if r.remote => {
                (WorkflowType::ChannelRmRemoteQueue, AsyncEventType::QueueRm)
            },
            QueueOpStates::Remove(_) => {
                (WorkflowType::ChannelRmLocalQueue, AsyncEventType::QueueRm)
            },
            QueueOpStates::Pair(_) => {
                (WorkflowType::ChannelPairQueue, AsyncEventType::QueuePair)
            },
            QueueOpStates::Unpair(_) => {
                (WorkflowType::ChannelUnpairQueue, AsyncEventType::QueueUnpair)
            },
        };
        let task = self.new_task(workflow, chid, timeout_ms)?;
        let mut ctx = AttachCtx::new(
            self.control_ctx(),
            Arc::clone(&conn),
            Arc::clone(&task),
            Arc::clone(&channel),
            Duration::from_millis(timeout_ms.max(1) as u64),
        );
        let run = run_queue_op(op, &mut ctx);
        let result = self
            .run_client_task(task, Arc::clone(&conn), timeout_ms, run)
            .await;
        let (err_code, l_qh, r_qh) = match &result {
            Ok(st) => (ErrCode::Success, st.l_qid as u64, st.r_qid as u64),
            Err(_) => (ErrCode::Fail, 0, 0),
        };
        self.events.notify(AsyncEvent {
            channel_id: chid,
            event_type,
            err_code,
            l_qh,
            r_qh,
            ctx: 0,
        });
        result
    }

    pub async fn queue_add_local(
        self: &Arc<Self>,
        chid: u32,
        qid: u32,
        timeout_ms: u32,
    ) -> Result<()> {
        self.channel_queue_add(chid, qid)?;
        self.channel_queue_op(chid, QueueOpStates::AddLocal(AddLocal { qid }), timeout_ms)
            .await
            .map(|_| ())
    }

    pub async fn queue_add_remote(
        self: &Arc<Self>,
        chid: u32,
        timeout_ms: u32,
    ) -> Result<u32> {
        self.channel_queue_op(chid, QueueOpStates::AddRemote(AddRemote), timeout_ms)
            .await
            .map(|st| st.r_qid)
    }

    pub async fn queue_rm(
        self: &Arc<Self>,
        chid: u32,
        qid: u32,
        remote: bool,
        timeout_ms: u32,
    ) -> Result<()> {
        self.channel_queue_op(
            chid,
            QueueOpStates::Remove(Remove { qid, remote }),
            timeout_ms,
        )
        .await
        .map(|_| ())
    }

    pub async fn queue_pair(
        self: &Arc<Self>,
        chid: u32,
        l_qid: u32,
        r_qid: u32,
        timeout_ms: u32,
    ) -> Result<()> {
        self.channel_queue_op(chid, QueueOpStates::Pair(Pair { l_qid, r_qid }), timeout_ms)
            .await
            .map(|_| ())
    }

    pub async fn queue_unpair(
        self: &Arc<Self>,
        chid: u32,
        l_qid: u32,
        r_qid: u32,
        timeout_ms: u32,
    ) -> Result<()> {
        self.channel_queue_op(
            chid,
            QueueOpStates::Unpair(Unpair { l_qid, r_qid }),
            timeout_ms,
        )
        .await
        .map(|_| ())
    }

    /* ---------------- data plane ---------------- */

    pub fn next_req_id(&self) -> u32 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Poll a queue and run the registered RX handler plus the function
    /// dispatch for inbound requests.
    pub fn queue_poll(&self, qid: u32, dir: IoDirection, max: usize) -> UrpcResult<usize> {
        let q = self.queue_get(qid).ok_or(UrpcError::BadHandle)?;
        let comps = q.poll(dir, max);
        let n = comps.len();
        for comp in &comps {
            if comp.dir == IoDirection::Rx {
                if let Some(handler) = self.rx_handlers.get(&comp.owner_qid) {
                    handler.value()(&q, comp);
                } else {
                    self.dispatch_request(&q, comp);
                }
            }
        }
        Ok(n)
    }

    /// Start periodic keepalive over one of the channel's paired queues.
    /// Three consecutive unanswered probes raise `KeepaliveLost`.
    pub fn keepalive_start(
        self: &Arc<Self>,
        chid: u32,
        l_qid: u32,
        period_ms: u32,
    ) -> UrpcResult<()> {
        let channel = self.channel_get(chid).ok_or(UrpcError::BadHandle)?;
        let q = channel.local_queue(l_qid).ok_or(UrpcError::BadHandle)?;
        let timer = self.wheel.create(chid, false)?;
        let events = Arc::clone(&self.events);
        let misses = Arc::new(AtomicU32::new(0));
        self.keepalive_misses.insert(chid, Arc::clone(&misses));
        let server_chid = channel.mapped_chid();
        self.wheel.start(
            timer,
            period_ms.max(1),
            move || {
                let missed = misses.fetch_add(1, Ordering::AcqRel) + 1;
                if missed > 3 {
                    events.notify(AsyncEvent {
                        channel_id: chid,
                        event_type: AsyncEventType::KeepaliveLost,
                        err_code: ErrCode::Timeout,
                        l_qh: l_qid as u64,
                        r_qh: 0,
                        ctx: 0,
                    });
                    return;
                }
                let head = crate::models::keepalive::KeepaliveHead::new(
                    false,
                    l_qid as u16,
                    server_chid,
                );
                let mut buf = [0u8; crate::models::common::KEEPALIVE_HEAD_LEN];
                if head.to_wire_bytes(&mut buf).is_ok()
                    && let Err(e) = q.tx_post(&TxMsg {
                        data: &buf,
                        user_ctx: u64::MAX,
                    })
                {
                    debug!(qid = q.qid(), "keepalive post failed: {e}");
                }
            },
            true,
        )?;
        channel.set_keepalive_attr(period_ms);
        Ok(())
    }

    /// Credit an answered keepalive probe; called from the RX path when a
    /// keepalive response head arrives.
    pub fn keepalive_rsp_received(&self, chid: u32) {
        if let Some(misses) = self.keepalive_misses.get(&chid) {
            misses.value().store(0, Ordering::Release);
        }
    }

    /// Default RX path: decode the head, call the registered function and
    /// send the response back over the same queue.
    fn dispatch_request(&self, q: &Arc<Queue>, comp: &QueueCompletion) {
        if comp.byte_len < REQ_HEAD_LEN as u32 {
            return;
        }
        let mut payload = q.rx_payload(comp);
        let parsed = match Msg::from_wire_bytes(&mut payload) {
            Ok(m) => m,
            Err(e) => {
                debug!("undecodable frame on queue {}: {e}", q.qid());
                return;
            },
        };
        let Msg::ReqHead(req) = parsed else {
            return; // responses are consumed by the caller's poll loop
        };
        let function = req.function();
        let req_id = req.req_id.get();
        let client_channel = req.client_channel();
        let wants_ack = req.flags.ack();
        let body_off = REQ_HEAD_LEN
            + req.flags.arg_dma_count() as usize * crate::models::request::ARG_DMA_LEN;
        let body = payload.get(body_off..).unwrap_or(&[]);

        let (status, reply) = match self.functions.get(&function) {
            Some(f) => f.value()(body),
            None if function == KEEPALIVE_FUNCTION_ID => (MsgStatus::Success, Vec::new()),
            None => (MsgStatus::FunctionErr, Vec::new()),
        };

        let rsp = RspHeadBuilder::new(status, client_channel, wants_ack)
            .req_id(req_id)
            .response_total_size(RSP_HEAD_LEN as u32 + reply.len() as u32)
            .header;
        let mut out = vec![0u8; RSP_HEAD_LEN + reply.len()];
        if rsp.to_wire_bytes(&mut out[..RSP_HEAD_LEN]).is_err() {
            return;
        }
        out[RSP_HEAD_LEN..].copy_from_slice(&reply);
        if let Err(e) = q.tx_post(&TxMsg {
            data: &out,
            user_ctx: req_id as u64,
        }) {
            warn!(qid = q.qid(), "response post failed: {e}");
        }
    }
}
