// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `Waker` every task is polled with.
//!
//! Unlike a general-purpose executor's waker, ours never outlives the thread it was created
//! on and never needs to be shared across an allocation boundary, so it carries nothing but
//! the waking task's id packed into the `RawWaker` data pointer. No refcounting, no heap
//! allocation, no drop glue.

use crate::executor::wake_from_any_thread_on_this_one;
use crate::id::TaskId;
use std::task::{RawWaker, RawWakerVTable, Waker};

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);

pub(crate) fn waker_for(task: TaskId) -> Waker {
    let raw = RawWaker::new(task.0 as *const (), &VTABLE);
    // Safety: `VTABLE`'s functions only ever reinterpret the data pointer as a `TaskId`,
    // never dereference it, so the pointer need not be valid as a pointer.
    unsafe { Waker::from_raw(raw) }
}

fn task_id_of(data: *const ()) -> TaskId {
    TaskId(data as u64)
}

unsafe fn clone(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake(data: *const ()) {
    wake_from_any_thread_on_this_one(task_id_of(data));
}

unsafe fn wake_by_ref(data: *const ()) {
    wake_from_any_thread_on_this_one(task_id_of(data));
}

unsafe fn drop(_data: *const ()) {}
