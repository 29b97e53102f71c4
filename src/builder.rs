// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime configuration. The core has no persistent state and no configuration file; this is
//! purely in-process sizing and naming knobs for the loop `run` constructs.

use crate::error::RunError;
use crate::executor::run_with;
use std::future::Future;

/// Settings for a single [`run`](crate::run) invocation.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) ready_queue_capacity: usize,
    pub(crate) timer_capacity: usize,
    pub(crate) root_span_name: &'static str,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ready_queue_capacity: 16,
            timer_capacity: 16,
            root_span_name: "root",
        }
    }
}

/// Builds a [`RuntimeConfig`], or runs a root computation directly with it.
#[derive(Debug, Clone, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial capacity of the ready queue and task table; a hint, not a limit.
    pub fn ready_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.ready_queue_capacity = capacity;
        self
    }

    /// Initial capacity of the timer heap; a hint, not a limit.
    pub fn timer_capacity(mut self, capacity: usize) -> Self {
        self.config.timer_capacity = capacity;
        self
    }

    /// Name attached to the root task's tracing span.
    pub fn root_span_name(mut self, name: &'static str) -> Self {
        self.config.root_span_name = name;
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }

    /// Bootstraps the loop with this configuration and `computation` as the root task.
    pub fn run<F>(self, computation: F) -> Result<F::Output, RunError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        run_with(self.config, computation)
    }
}
