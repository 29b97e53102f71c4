// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A thin wrapper over the OS readiness mechanism.
//!
//! `mio` already abstracts epoll/kqueue/IOCP behind one `Poll`/`Registry` pair, so the wrapper
//! here is just bookkeeping: turn `(RawFd, TaskId)` watches into `mio::Token`s and turn
//! `mio::Events` back into the `TaskId`s that should be woken.

use crate::id::TaskId;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A single outstanding registration: at most one per `(fd, direction)` per task.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Watch {
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
        })
    }

    /// Registers `task`'s interest in `watch`. Watches are level-triggered semantically: if
    /// the fd is already ready, the next `wait` call returns it immediately.
    pub(crate) fn add_watch(&mut self, task: TaskId, watch: Watch) -> io::Result<()> {
        self.poll.registry().register(
            &mut SourceFd(&watch.fd),
            Token(usize::try_from(task.0).expect("task id fits in usize")),
            watch.interest.add(Interest::READABLE),
        )
    }

    pub(crate) fn remove_watch(&mut self, watch: Watch) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&watch.fd))
    }

    /// Blocks for at most `timeout` (or indefinitely if `None`), returning the tasks whose
    /// watched descriptors became ready.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<TaskId>> {
        self.events.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // A signal interrupted the blocking wait; treat as "nothing ready yet" so the
            // loop just re-evaluates its deadline and polls again.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|ev| TaskId(ev.token().0 as u64))
            .collect())
    }
}
