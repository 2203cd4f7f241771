// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Task contexts and the engine table.
//!
//! A task is one asynchronous workflow instance, keyed by
//! `(instance_key, task_id)`. Its `ref_cnt` counts outstanding callback
//! references; destruction is deferred until the count hits zero so a
//! cancellation racing a completion can never free live state. A task is a
//! member of exactly one list at a time.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    errors::{ErrCode, UrpcError, UrpcResult},
    models::handshake::InstanceKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowType {
    ClientAttachServer,
    ClientDetachServer,
    ClientRefreshServer,
    ChannelAddLocalQueue,
    ChannelAddRemoteQueue,
    ChannelRmLocalQueue,
    ChannelRmRemoteQueue,
    ChannelPairQueue,
    ChannelUnpairQueue,
    HandleAttachReq,
    HandleDetachReq,
    HandleAddQueueReq,
    HandleRmQueueReq,
    HandlePairQueueReq,
    HandleUnpairQueueReq,
    ReleaseResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskListType {
    Unknown,
    /// Schedulable: nothing in flight.
    Ready,
    /// Waiting on transport I/O.
    Active,
    /// A driver is inside the step function right now.
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    PendingSend,
    Sending,
    PendingRecv,
    Recving,
    Importing,
    StepComplete,
}

#[derive(Debug)]
pub struct TaskCtx {
    pub task_id: i32,
    pub key: InstanceKey,
    pub workflow_type: WorkflowType,
    pub timeout_ms: u32,
    pub is_server: bool,
    pub channel_id: u32,
    outer_step: AtomicU32,
    inner_step: AtomicU32,
    list_type: Mutex<TaskListType>,
    task_state: Mutex<TaskState>,
    ref_cnt: AtomicU32,
    result: Mutex<ErrCode>,
    /// Tell the peer to cancel when this task dies.
    pub is_notify: AtomicBool,
    pub is_user_canceled: AtomicBool,
    pub is_send_cancel_msg: AtomicBool,
    pub cancel: CancellationToken,
}

impl TaskCtx {
    pub fn outer_step(&self) -> u32 {
        self.outer_step.load(Ordering::Acquire)
    }

    pub fn enter_step(&self) -> u32 {
        self.outer_step.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn inner_step(&self) -> u32 {
        self.inner_step.load(Ordering::Acquire)
    }

    pub fn bump_inner(&self) -> u32 {
        self.inner_step.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_inner(&self) {
        self.inner_step.store(0, Ordering::Release);
    }

    pub fn list_type(&self) -> TaskListType {
        *self.list_type.lock().expect("list lock poisoned")
    }

    pub fn move_list(&self, next: TaskListType) {
        *self.list_type.lock().expect("list lock poisoned") = next;
    }

    pub fn task_state(&self) -> TaskState {
        *self.task_state.lock().expect("state lock poisoned")
    }

    pub fn set_task_state(&self, next: TaskState) {
        *self.task_state.lock().expect("state lock poisoned") = next;
    }

    pub fn result(&self) -> ErrCode {
        *self.result.lock().expect("result lock poisoned")
    }

    pub fn set_result(&self, code: ErrCode) {
        *self.result.lock().expect("result lock poisoned") = code;
    }

    pub fn hold(&self) -> u32 {
        self.ref_cnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn refs(&self) -> u32 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    /// Mark the task canceled by the user or a dying TCP. The actual
    /// release happens when the last reference is put back.
    pub fn user_cancel(&self) {
        self.is_user_canceled.store(true, Ordering::Release);
        self.set_result(ErrCode::ForceExit);
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
pub struct TaskEngine {
    table: DashMap<(InstanceKey, i32), Arc<TaskCtx>>,
    next_task_id: AtomicI32,
}

impl TaskEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn alloc_task_id(&self) -> i32 {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        if id < 0 {
            self.next_task_id.store(1, Ordering::Relaxed);
            1
        } else {
            id
        }
    }

    pub fn create_task(
        &self,
        key: InstanceKey,
        task_id: i32,
        workflow_type: WorkflowType,
        channel_id: u32,
        timeout_ms: u32,
        is_server: bool,
    ) -> UrpcResult<Arc<TaskCtx>> {
        let task = Arc::new(TaskCtx {
            task_id,
            key,
            workflow_type,
            timeout_ms,
            is_server,
            channel_id,
            outer_step: AtomicU32::new(0),
            inner_step: AtomicU32::new(0),
            list_type: Mutex::new(TaskListType::Ready),
            task_state: Mutex::new(TaskState::PendingSend),
            ref_cnt: AtomicU32::new(1),
            result: Mutex::new(ErrCode::Success),
            is_notify: AtomicBool::new(false),
            is_user_canceled: AtomicBool::new(false),
            is_send_cancel_msg: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        match self.table.entry((key, task_id)) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(UrpcError::State("task id already in use"))
            },
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Arc::clone(&task));
                debug!(task_id, ?workflow_type, "task created");
                Ok(task)
            },
        }
    }

    pub fn get(&self, key: &InstanceKey, task_id: i32) -> Option<Arc<TaskCtx>> {
        self.table
            .get(&(*key, task_id))
            .map(|t| Arc::clone(t.value()))
    }

    /// Put one reference back; the table entry goes away with the last one.
    pub fn put(&self, task: &Arc<TaskCtx>) {
        if task.ref_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.table.remove(&(task.key, task.task_id));
            debug!(task_id = task.task_id, "task released");
        }
    }

    /// A task can die immediately only when no one else holds it and it has
    /// no transport I/O in flight.
    pub fn can_stop_immediately(&self, task: &TaskCtx) -> bool {
        task.refs() <= 1 && task.list_type() != TaskListType::Active
    }

    pub fn cancel_all_for(&self, key: &InstanceKey) {
        for entry in self.table.iter() {
            if entry.key().0 == *key {
                entry.value().user_cancel();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
