// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::TrellisExitCode;
use serde::{Deserialize, Serialize};
use std::{
    iter::Sum,
    ops::{Add, AddAssign},
    time::Duration,
};

/// Counters describing everything that ran under a node.
///
/// Summaries combine associatively: adding the summaries of two disjoint sets of tests produces
/// the summary of their union, so a node's summary is the sum of its children's.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunSummary {
    /// The number of tests that ran (including skipped tests).
    pub total: usize,

    /// The number of tests that failed.
    pub failed: usize,

    /// The number of tests that were skipped.
    pub skipped: usize,

    /// The time spent running the tests.
    #[serde(with = "humantime_serde")]
    pub time: Duration,
}

impl RunSummary {
    /// A summary for a single test that passed.
    pub fn passed(time: Duration) -> Self {
        Self {
            total: 1,
            time,
            ..Self::default()
        }
    }

    /// A summary for a single test that failed.
    pub fn failed(time: Duration) -> Self {
        Self {
            total: 1,
            failed: 1,
            time,
            ..Self::default()
        }
    }

    /// A summary for a single skipped test.
    pub fn skipped() -> Self {
        Self {
            total: 1,
            skipped: 1,
            ..Self::default()
        }
    }

    /// Adds `other` into this summary.
    pub fn aggregate(&mut self, other: RunSummary) {
        self.total += other.total;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.time += other.time;
    }

    /// The number of tests that passed.
    pub fn passed_count(&self) -> usize {
        self.total.saturating_sub(self.failed + self.skipped)
    }

    /// Returns true if no test failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// The exit code a host should use for a run with this summary.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            TrellisExitCode::TEST_RUN_FAILED
        } else if self.total == 0 {
            TrellisExitCode::NO_TESTS_RUN
        } else {
            TrellisExitCode::OK
        }
    }
}

impl Add for RunSummary {
    type Output = RunSummary;

    fn add(mut self, rhs: RunSummary) -> Self::Output {
        self.aggregate(rhs);
        self
    }
}

impl AddAssign for RunSummary {
    fn add_assign(&mut self, rhs: RunSummary) {
        self.aggregate(rhs);
    }
}

impl Sum for RunSummary {
    fn sum<I: Iterator<Item = RunSummary>>(iter: I) -> Self {
        iter.fold(RunSummary::default(), Add::add)
    }
}
