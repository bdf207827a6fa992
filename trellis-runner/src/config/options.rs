// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::MaxParallelThreads;
use crate::message_bus::MessageBusKind;

/// Options for a single run.
///
/// Unset options fall back to the assembly's own behavior, and then to built-in defaults.
/// Usually obtained from [`TrellisProfile::execution_options`](super::TrellisProfile::execution_options).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Run collections one at a time on the calling thread.
    pub disable_parallelization: Option<bool>,

    /// The maximum number of collections in flight.
    pub max_parallel_threads: Option<MaxParallelThreads>,

    /// Stop the run after the first failed test.
    pub stop_on_fail: bool,

    /// How messages are delivered to the sink.
    pub message_bus: MessageBusKind,

    /// The name of the collection orderer to use.
    pub collection_orderer: Option<String>,

    /// The name of the test case orderer to use, unless a class or collection sets its own.
    pub case_orderer: Option<String>,
}

impl ExecutionOptions {
    /// Options with every setting left to the assembly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `disable_parallelization`.
    pub fn with_disable_parallelization(mut self, disable: bool) -> Self {
        self.disable_parallelization = Some(disable);
        self
    }

    /// Sets `max_parallel_threads`.
    pub fn with_max_parallel_threads(mut self, threads: MaxParallelThreads) -> Self {
        self.max_parallel_threads = Some(threads);
        self
    }

    /// Sets `stop_on_fail`.
    pub fn with_stop_on_fail(mut self, stop_on_fail: bool) -> Self {
        self.stop_on_fail = stop_on_fail;
        self
    }

    /// Sets the message bus kind.
    pub fn with_message_bus(mut self, kind: MessageBusKind) -> Self {
        self.message_bus = kind;
        self
    }

    /// Sets the collection orderer name.
    pub fn with_collection_orderer(mut self, name: impl Into<String>) -> Self {
        self.collection_orderer = Some(name.into());
        self
    }

    /// Sets the case orderer name.
    pub fn with_case_orderer(mut self, name: impl Into<String>) -> Self {
        self.case_orderer = Some(name.into());
        self
    }

    /// Resolves whether parallelization is disabled, given the assembly's setting.
    pub fn effective_disable_parallelization(&self, assembly: Option<bool>) -> bool {
        self.disable_parallelization.or(assembly).unwrap_or(false)
    }

    /// Resolves the thread setting, given the assembly's setting.
    pub fn effective_max_parallel_threads(
        &self,
        assembly: Option<MaxParallelThreads>,
    ) -> MaxParallelThreads {
        self.max_parallel_threads.or(assembly).unwrap_or_default()
    }
}
