// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured concurrency: a scoped owner of child tasks.
//!
//! A `TaskGroup` ties the lifetime of every task it spawns to the scope that opened it.
//! Closing the group waits for all children to finish and re-raises the first
//! non-cancellation failure among them, fanning out cancellation to the rest the moment one
//! is observed.

use crate::error::Failure;
use crate::executor::{current, current_task, LoopHandle};
use crate::id::{GroupId, TaskId};
use crate::task::{JoinHandle, PendingWakeup};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub(crate) struct GroupRec {
    pub(crate) parent: TaskId,
    pub(crate) children: HashSet<TaskId>,
    pub(crate) first_failure: Option<Failure>,
    pub(crate) cancelling: bool,
    pub(crate) closing: bool,
}

impl GroupRec {
    fn new(parent: TaskId) -> Self {
        Self {
            parent,
            children: HashSet::new(),
            first_failure: None,
            cancelling: false,
            closing: false,
        }
    }
}

/// Opens a task group bound to the currently running task. Panics outside one. Like the
/// contract it wraps, there is no sensible recovery from calling this off the loop.
pub fn task_group() -> TaskGroup {
    TaskGroup::open()
}

/// A scoped owner of child tasks.
///
/// Must be closed with [`TaskGroup::close`] before the scope that opened it exits; there is
/// no implicit close on drop. Rust has no async `Drop`, so the close must be awaited
/// explicitly rather than running automatically when the scope exits.
pub struct TaskGroup {
    id: GroupId,
    loop_rc: LoopHandle,
}

impl TaskGroup {
    fn open() -> Self {
        let loop_handle = current().expect("task_group() used outside a running event loop");
        let parent = current_task().expect("task_group() used outside a running task");
        let id = loop_handle.alloc_group_id();
        loop_handle.groups().borrow_mut().insert(id, GroupRec::new(parent));
        tracing::trace!(group = id.0, parent = parent.0, "group opened");
        TaskGroup { id, loop_rc: loop_handle }
    }

    /// Spawns `computation` as a child of this group, in `ready` state.
    ///
    /// Permitted before and after cancellation has started, and before the group has begun
    /// to close. Panics if the group has already begun `close()`; spawning past the scope
    /// boundary is a misuse the type system can't otherwise catch.
    pub fn spawn<T, F>(&self, name: &'static str, computation: F) -> JoinHandle<T>
    where
        F: Future<Output = Result<T, Failure>> + 'static,
        T: 'static,
    {
        {
            let groups = self.loop_rc.groups().borrow();
            let rec = groups.get(&self.id).expect("group alive for as long as its TaskGroup");
            assert!(!rec.closing, "spawn() on a task group that has already begun close()");
        }
        let (task_id, handle) = self.loop_rc.0.spawn_raw(name, Some(self.id), computation);
        self.loop_rc
            .groups()
            .borrow_mut()
            .get_mut(&self.id)
            .expect("group alive for as long as its TaskGroup")
            .children
            .insert(task_id);
        handle
    }

    /// Waits for every child to reach a terminal state, then re-raises the first
    /// non-cancellation failure observed among them, if any.
    pub async fn close(self) -> Result<(), Failure> {
        CloseGroup { group: self.id, loop_rc: self.loop_rc.clone() }.await
    }
}

struct CloseGroup {
    group: GroupId,
    loop_rc: LoopHandle,
}

impl Future for CloseGroup {
    type Output = Result<(), Failure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = current_task().expect("close() polled outside its own task");

        let (children_empty, parent) = {
            let mut groups = self.loop_rc.groups().borrow_mut();
            let rec = groups.get_mut(&self.group).expect("group alive until close() resolves");
            rec.closing = true;
            (rec.children.is_empty(), rec.parent)
        };
        debug_assert_eq!(parent, task, "close() must be awaited by the task that opened the group");
        self.loop_rc.register_join_group(task, self.group);

        let cancelled = self
            .loop_rc
            .tasks()
            .borrow()
            .get(&task)
            .map(|slot| slot.cancel_pending())
            .unwrap_or(false);
        if cancelled && !children_empty {
            cancel_remaining_children(&self.loop_rc, self.group);
        }

        if !children_empty {
            return Poll::Pending;
        }

        let rec = self
            .loop_rc
            .groups()
            .borrow_mut()
            .remove(&self.group)
            .expect("group alive until close() resolves");
        if cancelled {
            return Poll::Ready(Err(Failure::Cancelled));
        }
        match rec.first_failure {
            Some(failure) => Poll::Ready(Err(failure)),
            None => Poll::Ready(Ok(())),
        }
    }
}

fn cancel_remaining_children(loop_rc: &LoopHandle, group: GroupId) {
    let children: Vec<TaskId> = loop_rc
        .groups()
        .borrow()
        .get(&group)
        .map(|rec| rec.children.iter().copied().collect())
        .unwrap_or_default();
    for child in children {
        loop_rc.request_cancel(child);
    }
}

/// Called by the event loop when a task owned by `group` reaches a terminal state.
///
/// Peeks the task's result to update the group's bookkeeping, restoring it afterwards unless
/// it becomes the group's recorded `first_failure`, in which case the value is taken so
/// `close()` can re-raise it; a [`JoinHandle`] awaited on that particular child afterwards
/// observes `Cancelled` instead of the original failure, a simplification this runtime accepts
/// since a group failure already supersedes any individual child result.
pub(crate) fn on_child_terminal(
    loop_inner: &crate::executor::LoopInner,
    group: GroupId,
    child: TaskId,
) {
    let Some(slot) = loop_inner.tasks().borrow().get(&child).cloned() else {
        return;
    };
    let Some(result) = slot.take_result() else {
        return;
    };
    let is_fresh_failure = matches!(&result, Err(f) if !f.is_cancelled());

    let mut groups = loop_inner.groups().borrow_mut();
    let Some(rec) = groups.get_mut(&group) else {
        drop(groups);
        slot.set_result(result);
        return;
    };
    rec.children.remove(&child);
    let became_empty = rec.children.is_empty();
    let closing = rec.closing;
    let parent = rec.parent;
    let should_record = is_fresh_failure && rec.first_failure.is_none();

    if should_record {
        rec.first_failure = Some(match result {
            Err(f) => f,
            Ok(_) => unreachable!("is_fresh_failure implies Err"),
        });
        rec.cancelling = true;
    } else {
        slot.set_result(result);
    }
    let siblings: Vec<TaskId> = rec.children.iter().copied().collect();
    drop(groups);

    if should_record {
        tracing::debug!(group = group.0, child = child.0, "fan-out cancellation");
        for sibling in siblings {
            loop_inner.request_cancel(sibling);
        }
        let parent_is_closing_here = loop_inner
            .tasks()
            .borrow()
            .get(&parent)
            .map(|p| matches!(p.pending(), Some(PendingWakeup::JoinGroup(g)) if g == group))
            .unwrap_or(false);
        if !parent_is_closing_here {
            loop_inner.request_cancel(parent);
        }
    }

    if became_empty && closing {
        loop_inner.schedule(parent);
    }
}
