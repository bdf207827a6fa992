// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::CapturedError;
use futures::FutureExt;
use std::{
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
};

/// Collects failures from independent operations without unwinding the caller.
///
/// Captured errors are kept in the order they were captured. Nothing is ever rethrown
/// automatically: the owner calls [`to_error`](Self::to_error) when it wants to report.
#[derive(Clone, Debug, Default)]
pub struct ExceptionAggregator {
    errors: Vec<CapturedError>,
}

impl ExceptionAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an aggregator for a child operation, seeded with the errors of `parent`.
    ///
    /// Failures that happened while setting up the parent are then visible to (and fail) every
    /// child. Errors added to the child are not visible to the parent.
    pub fn from_parent(parent: &ExceptionAggregator) -> Self {
        parent.clone()
    }

    /// Adds an error.
    pub fn add(&mut self, error: impl Into<CapturedError>) {
        self.errors.push(error.into());
    }

    /// Appends the errors of `other`, keeping their capture order.
    pub fn aggregate(&mut self, other: &ExceptionAggregator) {
        self.errors.extend(other.errors.iter().cloned());
    }

    /// Runs `op`, capturing an error it returns or a panic.
    ///
    /// Returns `None` if the operation failed.
    pub fn run<T, E>(&mut self, op: impl FnOnce() -> Result<T, E>) -> Option<T>
    where
        E: Into<CapturedError>,
    {
        match catch_unwind(AssertUnwindSafe(op)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                self.add(error);
                None
            }
            Err(payload) => {
                self.add(CapturedError::from_panic(payload));
                None
            }
        }
    }

    /// Awaits `fut`, capturing an error it returns or a panic.
    ///
    /// Returns `None` if the future failed.
    pub async fn run_async<T, E, F>(&mut self, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<CapturedError>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                self.add(error);
                None
            }
            Err(payload) => {
                self.add(CapturedError::from_panic(payload));
                None
            }
        }
    }

    /// Removes all captured errors.
    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// Returns true if any errors were captured.
    pub fn has_exceptions(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The captured errors, in capture order.
    pub fn errors(&self) -> &[CapturedError] {
        &self.errors
    }

    /// Combines the captured errors into one.
    ///
    /// Returns `None` if nothing was captured, the error itself if exactly one was, and a
    /// combined error otherwise.
    pub fn to_error(&self) -> Option<CapturedError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(CapturedError::multiple(self.errors.clone()))
        }
    }
}
