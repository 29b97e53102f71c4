// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::error::Error as StdError;
use std::fmt;

/// Marker error delivered at a task's next suspension point once it has been cancelled.
///
/// Distinguishable from all user failures via `Failure::Cancelled` / `downcast_ref`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("task was cancelled")
    }
}

impl StdError for CancelledError {}

/// The payload carried by a task that reached `done-err`.
///
/// A sum type rather than a trait object hierarchy so a [`crate::group::TaskGroup`]'s
/// `first_failure` slot has one concrete type to store regardless of which child failed.
#[derive(Debug)]
pub enum Failure {
    /// The task observed a cancellation at one of its suspension points.
    Cancelled,
    /// An ordinary failure raised by user code.
    User(Box<dyn StdError + Send + Sync>),
}

impl Failure {
    pub fn user<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        Failure::User(Box::new(err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Failure::Cancelled)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Cancelled => f.write_str("cancelled"),
            Failure::User(err) => write!(f, "{err}"),
        }
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Failure::Cancelled => None,
            Failure::User(err) => Some(err.as_ref()),
        }
    }
}

impl From<CancelledError> for Failure {
    fn from(_: CancelledError) -> Self {
        Failure::Cancelled
    }
}

/// Returned by [`crate::run`].
#[derive(Debug)]
pub enum RunError {
    /// The root task reached `done-err`, either cancelled or with a user failure.
    Failed(Failure),
    /// The loop had no ready tasks, no timers and no I/O watches but the root had not
    /// terminated.
    Deadlock,
    /// The core was used in a way its contract forbids: re-entrant `run`, `task_group()`
    /// called outside a running task, or a spawn into a group that has already closed.
    Misuse(&'static str),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Failed(failure) => write!(f, "root task failed: {failure}"),
            RunError::Deadlock => f.write_str("deadlock: no ready tasks, timers or I/O watches"),
            RunError::Misuse(msg) => write!(f, "misuse: {msg}"),
        }
    }
}

impl StdError for RunError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RunError::Failed(failure) => Some(failure),
            RunError::Deadlock | RunError::Misuse(_) => None,
        }
    }
}
