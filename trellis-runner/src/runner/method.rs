// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    CaseRunner, ClassContext,
    lifecycle::{NodeRunner, run_lifecycle},
};
use crate::{
    aggregator::ExceptionAggregator,
    fixture::ResolvedConstructor,
    list::{TestCase, TestMethod},
};
use std::sync::Arc;
use trellis_metadata::{ErrorMetadata, MessageKind, NodeIds, RunSummary};

/// Runs the cases of one method, sequentially.
pub(super) struct MethodRunner<'a> {
    cx: &'a ClassContext<'a>,
    ids: NodeIds,
    method: Arc<TestMethod>,
    cases: Vec<Arc<TestCase>>,
    aggregator: ExceptionAggregator,
    constructor: Option<&'a ResolvedConstructor>,
}

impl<'a> MethodRunner<'a> {
    pub(super) fn new(
        cx: &'a ClassContext<'a>,
        parent_aggregator: &ExceptionAggregator,
        constructor: Option<&'a ResolvedConstructor>,
        method: Arc<TestMethod>,
        cases: Vec<Arc<TestCase>>,
    ) -> Self {
        Self {
            cx,
            ids: cx.ids.with_method(method.unique_id()),
            method,
            cases,
            aggregator: ExceptionAggregator::from_parent(parent_aggregator),
            constructor,
        }
    }

    pub(super) fn run(mut self) -> RunSummary {
        run_lifecycle(self.cx.collection.assembly, &mut self)
    }
}

impl NodeRunner for MethodRunner<'_> {
    fn ids(&self) -> &NodeIds {
        &self.ids
    }

    fn aggregator(&mut self) -> &mut ExceptionAggregator {
        &mut self.aggregator
    }

    fn starting_message(&self) -> MessageKind {
        MessageKind::MethodStarting {
            method_name: self.method.name().to_owned(),
        }
    }

    fn finished_message(&self, summary: RunSummary) -> MessageKind {
        MessageKind::MethodFinished { summary }
    }

    fn cleanup_failure_message(&self, error: ErrorMetadata) -> MessageKind {
        MessageKind::MethodCleanupFailure { error }
    }

    fn run_children(&mut self) -> RunSummary {
        let mut summary = RunSummary::default();
        for case in &self.cases {
            if self.cx.collection.assembly.is_cancelled() {
                break;
            }
            summary += CaseRunner::new(
                self.cx,
                &self.ids,
                &self.aggregator,
                self.constructor,
                case.clone(),
            )
            .run();
        }
        summary
    }
}
