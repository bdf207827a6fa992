// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::stopwatch::{StopwatchStart, stopwatch};
use std::{future::Future, time::Duration};

/// Measures the time spent in a sequence of operations.
///
/// Every call to [`aggregate`](Self::aggregate) or [`aggregate_async`](Self::aggregate_async)
/// adds the elapsed time of the operation to the running total, including operations that
/// return an error or panic.
#[derive(Clone, Debug, Default)]
pub struct ExecutionTimer {
    total: Duration,
}

impl ExecutionTimer {
    /// Creates a new timer with a total of zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The total time spent in operations so far.
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Runs `op`, adding its elapsed time to the total.
    pub fn aggregate<T>(&mut self, op: impl FnOnce() -> T) -> T {
        let _guard = TimerGuard::new(&mut self.total);
        op()
    }

    /// Awaits `fut`, adding its elapsed time to the total.
    pub async fn aggregate_async<F: Future>(&mut self, fut: F) -> F::Output {
        let _guard = TimerGuard::new(&mut self.total);
        fut.await
    }
}

/// Adds the elapsed time on drop, so that unwinding still records it.
struct TimerGuard<'a> {
    total: &'a mut Duration,
    start: StopwatchStart,
}

impl<'a> TimerGuard<'a> {
    fn new(total: &'a mut Duration) -> Self {
        Self {
            total,
            start: stopwatch(),
        }
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        *self.total += self.start.snapshot().duration;
    }
}
