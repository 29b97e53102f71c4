// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task object and its suspension contract.
//!
//! A `Task` wraps a boxed, type-erased future. Its output is recovered through [`JoinHandle`],
//! which downcasts the `Box<dyn Any>` back to the concrete type. Nothing here is shared across
//! threads or needs to avoid an allocation per spawn, so a plain downcast is enough; no per-type
//! vtable is needed.

use crate::error::Failure;
use crate::id::{GroupId, TaskId};
use crate::reactor::Watch;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Any>, Failure>>>>;

/// What a `Waiting` task is suspended on. At most one at a time.
#[derive(Debug, Clone)]
pub(crate) enum PendingWakeup {
    Yield,
    Sleep,
    Io(Watch),
    JoinGroup(GroupId),
    AwaitTask(TaskId),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum StateTag {
    Ready,
    Waiting,
    DoneOk,
    DoneErr,
}

pub(crate) struct TaskSlot {
    pub(crate) id: TaskId,
    pub(crate) name: &'static str,
    state: Cell<StateTag>,
    pending: RefCell<Option<PendingWakeup>>,
    cancel_pending: Cell<bool>,
    future: RefCell<Option<BoxFuture>>,
    pub(crate) owning_group: Cell<Option<GroupId>>,
    result: RefCell<Option<Result<Box<dyn Any>, Failure>>>,
    /// Waker of whatever task is currently `await_task`-ing this one.
    join_waker: RefCell<Option<Waker>>,
}

impl TaskSlot {
    pub(crate) fn new(id: TaskId, name: &'static str, future: BoxFuture) -> Self {
        Self {
            id,
            name,
            state: Cell::new(StateTag::Ready),
            pending: RefCell::new(None),
            cancel_pending: Cell::new(false),
            future: RefCell::new(Some(future)),
            owning_group: Cell::new(None),
            result: RefCell::new(None),
            join_waker: RefCell::new(None),
        }
    }

    pub(crate) fn state(&self) -> StateTag {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: StateTag) {
        self.state.set(state);
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state.get(), StateTag::DoneOk | StateTag::DoneErr)
    }

    pub(crate) fn cancel_pending(&self) -> bool {
        self.cancel_pending.get()
    }

    pub(crate) fn set_cancel_pending(&self) {
        self.cancel_pending.set(true);
    }

    pub(crate) fn pending(&self) -> Option<PendingWakeup> {
        self.pending.borrow().clone()
    }

    pub(crate) fn set_pending(&self, p: PendingWakeup) {
        *self.pending.borrow_mut() = Some(p);
    }

    pub(crate) fn clear_pending(&self) {
        *self.pending.borrow_mut() = None;
    }

    /// Takes the boxed future out for polling, so the poll call itself never runs while this
    /// slot's `RefCell` is borrowed (a nested spawn touching the same slot would otherwise
    /// panic on a double borrow).
    pub(crate) fn take_future(&self) -> Option<BoxFuture> {
        self.future.borrow_mut().take()
    }

    pub(crate) fn put_future_back(&self, fut: BoxFuture) {
        *self.future.borrow_mut() = Some(fut);
    }

    pub(crate) fn set_result(&self, result: Result<Box<dyn Any>, Failure>) {
        *self.result.borrow_mut() = Some(result);
    }

    /// Takes the stored result's failure, if any, leaving an `Ok` result behind isn't
    /// meaningful once taken twice; used once by whichever single reader owns this task
    /// (its group, or its `JoinHandle`).
    pub(crate) fn take_result(&self) -> Option<Result<Box<dyn Any>, Failure>> {
        self.result.borrow_mut().take()
    }

    pub(crate) fn set_join_waker(&self, waker: Waker) {
        *self.join_waker.borrow_mut() = Some(waker);
    }

    pub(crate) fn take_join_waker(&self) -> Option<Waker> {
        self.join_waker.borrow_mut().take()
    }
}

/// A reference to a spawned task's eventual output.
///
/// Awaiting a `JoinHandle` is how a task waits on another task: it resumes once the referenced
/// task reaches a terminal state.
pub struct JoinHandle<T> {
    pub(crate) id: TaskId,
    pub(crate) loop_rc: crate::executor::LoopHandle,
    pub(crate) _marker: std::marker::PhantomData<T>,
}

impl<T: 'static> Future for JoinHandle<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.loop_rc.clone().poll_join(self.id, cx)
    }
}
