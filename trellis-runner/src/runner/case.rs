// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    ClassContext, TestRunner,
    lifecycle::{NodeRunner, run_lifecycle},
};
use crate::{
    aggregator::{CapturedError, ExceptionAggregator},
    errors::TheoryDataError,
    fixture::{DisposalTracker, ResolvedConstructor},
    list::{Test, TestCase, TestCaseKind, TheoryData},
};
use std::sync::Arc;
use tracing::debug;
use trellis_metadata::{ErrorMetadata, MessageKind, NodeIds, RunSummary};

/// Runs the tests of one case: a single test for facts and data rows, one test per row for
/// theories.
pub(super) struct CaseRunner<'a> {
    cx: &'a ClassContext<'a>,
    ids: NodeIds,
    case: Arc<TestCase>,
    aggregator: ExceptionAggregator,
    constructor: Option<&'a ResolvedConstructor>,
    row_teardowns: DisposalTracker,
}

impl<'a> CaseRunner<'a> {
    pub(super) fn new(
        cx: &'a ClassContext<'a>,
        method_ids: &NodeIds,
        parent_aggregator: &ExceptionAggregator,
        constructor: Option<&'a ResolvedConstructor>,
        case: Arc<TestCase>,
    ) -> Self {
        Self {
            cx,
            ids: method_ids.with_test_case(case.unique_id()),
            case,
            aggregator: ExceptionAggregator::from_parent(parent_aggregator),
            constructor,
            row_teardowns: DisposalTracker::new(),
        }
    }

    pub(super) fn run(mut self) -> RunSummary {
        run_lifecycle(self.cx.collection.assembly, &mut self)
    }

    fn run_test(&self, test: Test) -> RunSummary {
        TestRunner::new(
            self.cx,
            &self.ids,
            ExceptionAggregator::from_parent(&self.aggregator),
            self.constructor,
            test,
        )
        .run()
    }

    /// Reports a single failed test for the case without running anything.
    fn run_failing(&self, error: CapturedError) -> RunSummary {
        let mut aggregator = ExceptionAggregator::from_parent(&self.aggregator);
        aggregator.add(error);
        TestRunner::new(
            self.cx,
            &self.ids,
            aggregator,
            self.constructor,
            Test::for_case(&self.case),
        )
        .run()
    }

    fn run_theory(&mut self, data: &TheoryData) -> RunSummary {
        let mut discovery = ExceptionAggregator::new();
        let rows = discovery.run(|| data.enumerate());
        let rows = match rows {
            Some(rows) if rows.is_empty() => {
                let error = TheoryDataError::NoData {
                    test_method: self.case.method().qualified_name(),
                };
                return self.run_failing(CapturedError::new(error));
            }
            Some(rows) => rows,
            None => {
                let error = discovery
                    .to_error()
                    .unwrap_or_else(|| CapturedError::msg("theory data enumeration failed"));
                return self.run_failing(error);
            }
        };

        debug!(case = self.case.display_name(), rows = rows.len(), "enumerated theory data");
        let tests: Vec<_> = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| {
                let (arguments, display_name, skip_reason, teardown) = row.into_parts();
                self.row_teardowns.add(teardown);
                Test::for_row(&self.case, index, arguments, display_name, skip_reason)
            })
            .collect();

        let mut summary = RunSummary::default();
        for test in tests {
            if self.cx.collection.assembly.is_cancelled() {
                break;
            }
            summary += self.run_test(test);
        }
        summary
    }
}

impl NodeRunner for CaseRunner<'_> {
    fn ids(&self) -> &NodeIds {
        &self.ids
    }

    fn aggregator(&mut self) -> &mut ExceptionAggregator {
        &mut self.aggregator
    }

    fn starting_message(&self) -> MessageKind {
        MessageKind::CaseStarting {
            display_name: self.case.display_name().to_owned(),
            skip_reason: self.case.skip_reason().map(str::to_owned),
            traits: self.case.traits().clone(),
        }
    }

    fn finished_message(&self, summary: RunSummary) -> MessageKind {
        MessageKind::CaseFinished { summary }
    }

    fn cleanup_failure_message(&self, error: ErrorMetadata) -> MessageKind {
        MessageKind::CaseCleanupFailure { error }
    }

    fn run_children(&mut self) -> RunSummary {
        let case = self.case.clone();
        match case.kind() {
            TestCaseKind::Theory(data) if case.skip_reason().is_none() => self.run_theory(data),
            TestCaseKind::ExecutionError { message } => {
                self.run_failing(CapturedError::msg(message))
            }
            TestCaseKind::Fact | TestCaseKind::DataRow { .. } | TestCaseKind::Theory(_) => {
                self.run_test(Test::for_case(&case))
            }
        }
    }

    fn before_finished(&mut self) {
        self.row_teardowns.dispose_all(&mut self.aggregator);
    }
}
