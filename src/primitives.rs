// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Suspension primitives: the only operations that may yield control back to the loop. Each is
//! a leaf future that registers itself with the current loop on first poll and checks
//! `cancel_pending` on every poll, the single place cancellation is observed.

use crate::error::Failure;
use crate::executor::{current, current_task};
use crate::group::task_group;
use crate::reactor::Watch;
use mio::Interest;
use std::future::Future;
use std::io::Read as _;
use std::mem::ManuallyDrop;
use std::os::unix::io::{FromRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

fn this_task() -> crate::id::TaskId {
    current_task().expect("suspension primitive used outside a running task")
}

fn this_loop() -> crate::executor::LoopHandle {
    current().expect("suspension primitive used outside a running event loop")
}

/// Returns control to the scheduler once; resumes on the next loop iteration, after anything
/// already made ready this one.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Result<(), Failure>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = this_task();
        let loop_rc = this_loop();
        if loop_rc
            .tasks()
            .borrow()
            .get(&task)
            .map(|s| s.cancel_pending())
            .unwrap_or(false)
        {
            return Poll::Ready(Err(Failure::Cancelled));
        }
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        self.yielded = true;
        loop_rc.defer_yield(task);
        Poll::Pending
    }
}

/// Suspends for at least `duration`; raises [`Failure::Cancelled`] if cancelled first.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep { duration, deadline: None }
}

pub struct Sleep {
    duration: Duration,
    deadline: Option<Instant>,
}

impl Future for Sleep {
    type Output = Result<(), Failure>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = this_task();
        let loop_rc = this_loop();
        if loop_rc
            .tasks()
            .borrow()
            .get(&task)
            .map(|s| s.cancel_pending())
            .unwrap_or(false)
        {
            return Poll::Ready(Err(Failure::Cancelled));
        }
        let duration = self.duration;
        let deadline = *self.deadline.get_or_insert_with(|| Instant::now() + duration);
        if Instant::now() >= deadline {
            return Poll::Ready(Ok(()));
        }
        loop_rc.register_sleep(task, deadline);
        Poll::Pending
    }
}

/// Suspends until `fd` is readable, then performs a single non-blocking read of up to `n`
/// bytes and returns whatever was read, possibly fewer bytes, possibly empty on EOF.
/// The caller keeps ownership of `fd`; it is never closed here.
pub fn read(fd: RawFd, n: usize) -> Read {
    Read { fd, max: n, registered: false }
}

pub struct Read {
    fd: RawFd,
    max: usize,
    registered: bool,
}

impl Future for Read {
    type Output = Result<Vec<u8>, Failure>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = this_task();
        let loop_rc = this_loop();
        if loop_rc
            .tasks()
            .borrow()
            .get(&task)
            .map(|s| s.cancel_pending())
            .unwrap_or(false)
        {
            return Poll::Ready(Err(Failure::Cancelled));
        }

        if !self.registered {
            self.registered = true;
            let watch = Watch { fd: self.fd, interest: Interest::READABLE };
            if let Err(e) = loop_rc.register_io(task, watch) {
                return Poll::Ready(Err(Failure::user(e)));
            }
            return Poll::Pending;
        }

        // Safety: `ManuallyDrop` prevents `File`'s destructor from closing a descriptor we
        // don't own; `fd` is guaranteed open by the caller for the duration of this await.
        let file = unsafe { std::fs::File::from_raw_fd(self.fd) };
        let mut file = ManuallyDrop::new(file);
        let mut buf = vec![0u8; self.max];
        match file.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Poll::Ready(Ok(buf))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let watch = Watch { fd: self.fd, interest: Interest::READABLE };
                if let Err(e) = loop_rc.register_io(task, watch) {
                    return Poll::Ready(Err(Failure::user(e)));
                }
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(Failure::user(e))),
        }
    }
}

/// Opens a group, spawns one child per computation, closes the group, and returns the results
/// in input order. An empty input returns an empty result immediately.
pub async fn gather<T, F, I>(computations: I) -> Result<Vec<T>, Failure>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, Failure>> + 'static,
    T: 'static,
{
    let group = task_group();
    let handles: Vec<_> = computations
        .into_iter()
        .map(|computation| group.spawn("gather-child", computation))
        .collect();
    group.close().await?;

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await?);
    }
    Ok(results)
}
