// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The event loop: the scheduler that owns the ready queue, timer heap and I/O watches, and
//! drives tasks to completion.

use crate::builder::RuntimeConfig;
use crate::error::{Failure, RunError};
use crate::group::GroupRec;
use crate::id::{GroupId, IdGen, TaskId};
use crate::reactor::{Poller, Watch};
use crate::task::{BoxFuture, JoinHandle, PendingWakeup, StateTag, TaskSlot};
use crate::waker::waker_for;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Instant;

thread_local! {
    static CURRENT: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
    static CURRENT_TASK: std::cell::Cell<Option<TaskId>> = const { std::cell::Cell::new(None) };
}

/// A reference-counted handle to the loop's state, cheap to clone and shared between every
/// task and every leaf future spawned on it.
#[derive(Clone)]
pub(crate) struct LoopHandle(pub(crate) Rc<LoopInner>);

impl std::ops::Deref for LoopHandle {
    type Target = LoopInner;
    fn deref(&self) -> &LoopInner {
        &self.0
    }
}

pub(crate) struct LoopInner {
    tasks: RefCell<HashMap<TaskId, Rc<TaskSlot>>>,
    groups: RefCell<HashMap<GroupId, GroupRec>>,
    ready_queue: RefCell<VecDeque<TaskId>>,
    /// Tasks already in `ready_queue`, so a waker firing twice doesn't double-enqueue one.
    queued: RefCell<HashSet<TaskId>>,
    /// Tasks that called `yield_now`; appended to the ready queue's tail only once the
    /// current iteration's I/O- and timer-driven wakeups have already been appended.
    yielded: RefCell<Vec<TaskId>>,
    timers: RefCell<crate::timer::TimerHeap>,
    poller: RefCell<Poller>,
    /// The `Watch` each waiting task currently holds, so `request_cancel` can deregister it.
    watches: RefCell<HashMap<TaskId, Watch>>,
    ids: RefCell<IdGen>,
    group_ids: RefCell<IdGen>,
    root: TaskId,
}

/// Bootstraps the loop with `computation` as the root task; blocks the calling thread until
/// it is terminal.
pub fn run<F>(computation: F) -> Result<F::Output, RunError>
where
    F: Future + 'static,
    F::Output: 'static,
{
    run_with(RuntimeConfig::default(), computation)
}

/// As [`run`], but with an explicit [`RuntimeConfig`].
pub fn run_with<F>(config: RuntimeConfig, computation: F) -> Result<F::Output, RunError>
where
    F: Future + 'static,
    F::Output: 'static,
{
    if CURRENT.with(|c| c.borrow().is_some()) {
        return Err(RunError::Misuse("run() called re-entrantly"));
    }

    let span = tracing::info_span!("event_loop", name = config.root_span_name);
    let _enter = span.enter();

    let poller = Poller::new().map_err(|e| RunError::Misuse(Box::leak(
        format!("failed to create readiness poller: {e}").into_boxed_str(),
    )))?;

    // The root task draws its id from the same generator spawned children use, so the first
    // `spawn()` can never collide with (and silently overwrite) the root's slot.
    let mut ids = IdGen::default();
    let root_id = TaskId(ids.next());

    let inner = Rc::new(LoopInner {
        tasks: RefCell::new(HashMap::with_capacity(config.ready_queue_capacity)),
        groups: RefCell::new(HashMap::new()),
        ready_queue: RefCell::new(VecDeque::with_capacity(config.ready_queue_capacity)),
        queued: RefCell::new(HashSet::new()),
        yielded: RefCell::new(Vec::new()),
        timers: RefCell::new(crate::timer::TimerHeap::with_capacity(config.timer_capacity)),
        poller: RefCell::new(poller),
        watches: RefCell::new(HashMap::new()),
        ids: RefCell::new(ids),
        group_ids: RefCell::new(IdGen::default()),
        root: root_id,
    });
    let handle = LoopHandle(inner);

    let boxed: BoxFuture = Box::pin(async move { Ok(Box::new(computation.await) as Box<dyn Any>) });
    let root = Rc::new(TaskSlot::new(handle.root, config.root_span_name, boxed));
    handle.tasks.borrow_mut().insert(handle.root, root);
    handle.schedule(handle.root);

    CURRENT.with(|c| *c.borrow_mut() = Some(handle.clone()));
    let result = handle.drive();
    CURRENT.with(|c| *c.borrow_mut() = None);

    let root_slot = handle.tasks.borrow_mut().remove(&handle.root);
    result?;
    let root_slot = root_slot.expect("root task always present until removed here");
    match root_slot
        .take_result()
        .expect("root task reached a terminal state before drive() returned")
    {
        Ok(value) => Ok(*value
            .downcast::<F::Output>()
            .expect("root task output type matches F::Output")),
        Err(failure) => Err(RunError::Failed(failure)),
    }
}

impl LoopInner {
    /// Marks `task` ready and appends it to the tail of the ready queue, unless it is already
    /// queued or already terminal.
    pub(crate) fn schedule(&self, task: TaskId) {
        let Some(slot) = self.tasks.borrow().get(&task).cloned() else {
            return;
        };
        if slot.is_terminal() {
            return;
        }
        if self.queued.borrow_mut().insert(task) {
            slot.set_state(StateTag::Ready);
            slot.clear_pending();
            self.ready_queue.borrow_mut().push_back(task);
        }
    }

    /// As `schedule`, but at the head of the queue. Cancellation injections are delivered
    /// promptly, ahead of anything already ready this iteration.
    fn schedule_front(&self, task: TaskId) {
        let Some(slot) = self.tasks.borrow().get(&task).cloned() else {
            return;
        };
        if slot.is_terminal() {
            return;
        }
        if self.queued.borrow_mut().insert(task) {
            slot.set_state(StateTag::Ready);
            slot.clear_pending();
            self.ready_queue.borrow_mut().push_front(task);
        }
    }

    pub(crate) fn defer_yield(&self, task: TaskId) {
        self.yielded.borrow_mut().push(task);
        if let Some(slot) = self.tasks.borrow().get(&task) {
            slot.set_pending(PendingWakeup::Yield);
        }
    }

    pub(crate) fn register_sleep(&self, task: TaskId, deadline: Instant) {
        self.timers.borrow_mut().insert(task, deadline);
        if let Some(slot) = self.tasks.borrow().get(&task) {
            slot.set_pending(PendingWakeup::Sleep);
        }
    }

    pub(crate) fn register_io(&self, task: TaskId, watch: Watch) -> std::io::Result<()> {
        self.poller.borrow_mut().add_watch(task, watch)?;
        self.watches.borrow_mut().insert(task, watch);
        if let Some(slot) = self.tasks.borrow().get(&task) {
            slot.set_pending(PendingWakeup::Io(watch));
        }
        Ok(())
    }

    pub(crate) fn register_join_group(&self, task: TaskId, group: GroupId) {
        if let Some(slot) = self.tasks.borrow().get(&task) {
            slot.set_pending(PendingWakeup::JoinGroup(group));
        }
    }

    pub(crate) fn register_await_task(&self, waiter: TaskId, target: TaskId) {
        if let Some(slot) = self.tasks.borrow().get(&waiter) {
            slot.set_pending(PendingWakeup::AwaitTask(target));
        }
    }

    fn set_waiting(&self, task: TaskId) {
        if let Some(slot) = self.tasks.borrow().get(&task) {
            slot.set_state(StateTag::Waiting);
        }
    }

    /// Requests cancellation of `task`. If the task is currently waiting, it is unregistered
    /// from its wakeup source and moved to the head of the ready queue so the cancellation is
    /// delivered promptly.
    pub(crate) fn request_cancel(&self, task: TaskId) {
        let Some(slot) = self.tasks.borrow().get(&task).cloned() else {
            return;
        };
        if slot.is_terminal() {
            return; // cancelling an already-done task is a no-op
        }
        slot.set_cancel_pending();
        if slot.state() != StateTag::Waiting {
            return; // observed at the next suspension point once it runs
        }
        match slot.pending() {
            Some(PendingWakeup::Sleep) => self.timers.borrow_mut().remove(task),
            Some(PendingWakeup::Io(watch)) => {
                let _ = self.poller.borrow_mut().remove_watch(watch);
                self.watches.borrow_mut().remove(&task);
            }
            Some(PendingWakeup::AwaitTask(target)) => {
                if let Some(target_slot) = self.tasks.borrow().get(&target) {
                    let _ = target_slot.take_join_waker();
                }
            }
            Some(PendingWakeup::JoinGroup(_)) | Some(PendingWakeup::Yield) | None => {}
        }
        self.schedule_front(task);
    }

    /// Polls `task`'s future once, advancing it through at most one suspension point.
    fn poll_task(&self, task: TaskId) {
        let Some(slot) = self.tasks.borrow().get(&task).cloned() else {
            return;
        };
        let Some(mut fut) = slot.take_future() else {
            return; // already completed and had its future consumed
        };

        let span = tracing::debug_span!("task", id = slot.id.0, name = slot.name);
        let _enter = span.enter();

        let waker = waker_for(task);
        let mut cx = Context::from_waker(&waker);
        CURRENT_TASK.with(|c| c.set(Some(task)));
        let polled = fut.as_mut().poll(&mut cx);
        CURRENT_TASK.with(|c| c.set(None));
        match polled {
            Poll::Pending => {
                // The leaf future is responsible for having registered a wakeup source
                // before returning Pending (`register_sleep`/`register_io`/... or
                // `defer_yield`). Put the future back for the next poll.
                slot.put_future_back(fut);
                self.set_waiting(task);
                tracing::trace!(task = task.0, "suspended");
            }
            Poll::Ready(result) => {
                let ok = result.is_ok();
                slot.set_state(if ok { StateTag::DoneOk } else { StateTag::DoneErr });
                if let Err(failure) = &result {
                    tracing::trace!(task = task.0, cancelled = failure.is_cancelled(), "done (err)");
                } else {
                    tracing::trace!(task = task.0, "done (ok)");
                }
                slot.set_result(result);
                if let Some(group_id) = slot.owning_group.get() {
                    crate::group::on_child_terminal(self, group_id, task);
                }
                if let Some(waker) = slot.take_join_waker() {
                    waker.wake();
                }
            }
        }
    }

    /// Runs the main loop until the root task is terminal.
    fn drive(&self) -> Result<(), RunError> {
        loop {
            loop {
                // The `pop_front()` call must end its borrow before `poll_task` runs: polling
                // a task can itself schedule others (spawns, wakers), which need to borrow
                // `ready_queue` too.
                let next = self.ready_queue.borrow_mut().pop_front();
                let Some(task) = next else { break };
                self.queued.borrow_mut().remove(&task);
                self.poll_task(task);
            }

            // Yields enqueue at the tail, behind everything made ready this iteration by I/O
            // or timers, so a yielding task can never starve others.
            let deferred: Vec<_> = self.yielded.borrow_mut().drain(..).collect();
            for task in deferred {
                self.schedule(task);
            }
            if !self.ready_queue.borrow().is_empty() {
                continue;
            }

            if self.tasks.borrow().get(&self.root).map(|s| s.is_terminal()) == Some(true) {
                return Ok(());
            }

            if self.ready_queue.borrow().is_empty()
                && self.timers.borrow().is_empty()
                && self.watches.borrow().is_empty()
            {
                tracing::error!("deadlock: no ready tasks, timers or I/O watches");
                return Err(RunError::Deadlock);
            }

            let timeout = self.timers.borrow().next_deadline().map(|deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            let ready_by_io = self
                .poller
                .borrow_mut()
                .wait(timeout)
                .map_err(|e| RunError::Misuse(Box::leak(
                    format!("readiness poll failed: {e}").into_boxed_str(),
                )))?;
            for task in ready_by_io {
                if let Some(watch) = self.watches.borrow_mut().remove(&task) {
                    let _ = self.poller.borrow_mut().remove_watch(watch);
                }
                self.schedule(task);
            }

            let due = self.timers.borrow_mut().pop_due(Instant::now());
            for task in due {
                self.schedule(task);
            }
        }
    }

    /// Spawns `future` as a new task, optionally owned by `group`.
    pub(crate) fn spawn_raw<T: 'static>(
        self: &Rc<Self>,
        name: &'static str,
        owning_group: Option<GroupId>,
        future: impl Future<Output = Result<T, Failure>> + 'static,
    ) -> (TaskId, JoinHandle<T>) {
        let id = TaskId(self.ids.borrow_mut().next());
        let boxed: BoxFuture = Box::pin(async move {
            future.await.map(|v| Box::new(v) as Box<dyn Any>)
        });
        let slot = Rc::new(TaskSlot::new(id, name, boxed));
        slot.owning_group.set(owning_group);
        self.tasks.borrow_mut().insert(id, slot);
        self.schedule(id);

        let handle = JoinHandle {
            id,
            loop_rc: LoopHandle(self.clone()),
            _marker: std::marker::PhantomData,
        };
        (id, handle)
    }

    pub(crate) fn poll_join<T: 'static>(
        &self,
        task: TaskId,
        cx: &mut Context<'_>,
    ) -> Poll<Result<T, Failure>> {
        let Some(slot) = self.tasks.borrow().get(&task).cloned() else {
            return Poll::Ready(Err(Failure::Cancelled));
        };
        if slot.is_terminal() {
            return Poll::Ready(match slot.take_result() {
                Some(Ok(v)) => Ok(*v.downcast::<T>().expect("JoinHandle<T> type matches")),
                Some(Err(f)) => Err(f),
                None => Err(Failure::Cancelled), // already taken by something else
            });
        }
        if let Some(waiter) = crate::executor::current_task() {
            self.register_await_task(waiter, task);
        }
        slot.set_join_waker(cx.waker().clone());
        Poll::Pending
    }

    pub(crate) fn alloc_group_id(&self) -> GroupId {
        GroupId(self.group_ids.borrow_mut().next())
    }

    pub(crate) fn groups(&self) -> &RefCell<HashMap<GroupId, GroupRec>> {
        &self.groups
    }

    pub(crate) fn tasks(&self) -> &RefCell<HashMap<TaskId, Rc<TaskSlot>>> {
        &self.tasks
    }
}

/// Looks up the loop current on this thread and schedules `task` on it. Called from a task's
/// `Waker`, which is why this lives next to `drive`/`schedule` rather than on `LoopHandle`
/// directly. Wakers only ever carry a bare `TaskId`, not a loop reference.
pub(crate) fn wake_from_any_thread_on_this_one(task: TaskId) {
    CURRENT.with(|c| {
        if let Some(handle) = c.borrow().as_ref() {
            handle.schedule(task);
        }
    });
}

/// Returns the loop current on this thread, if any (used by leaf futures in `primitives.rs`).
pub(crate) fn current() -> Option<LoopHandle> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Returns the id of the task currently being polled on this thread, if any.
pub(crate) fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(|c| c.get())
}
