// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    ClassContext, CollectionContext, MethodRunner,
    lifecycle::{NodeRunner, run_lifecycle},
};
use crate::{
    aggregator::ExceptionAggregator,
    fixture::{DisposalTracker, FixtureKind, FixtureMap, ResolvedConstructor, construct_fixtures},
    list::{TestCase, TestClass, TestMethod},
};
use indexmap::IndexMap;
use std::sync::Arc;
use trellis_metadata::{ErrorMetadata, MessageKind, NodeIds, RunSummary};

/// Runs the methods of one class around the class's fixtures.
pub(super) struct ClassRunner<'a> {
    cx: &'a CollectionContext<'a>,
    ids: NodeIds,
    class: Arc<TestClass>,
    cases: Vec<Arc<TestCase>>,
    aggregator: ExceptionAggregator,
    fixtures: FixtureMap,
    disposal: DisposalTracker,
    constructor: Option<ResolvedConstructor>,
}

impl<'a> ClassRunner<'a> {
    pub(super) fn new(
        cx: &'a CollectionContext<'a>,
        parent_aggregator: &ExceptionAggregator,
        class: Arc<TestClass>,
        cases: Vec<Arc<TestCase>>,
    ) -> Self {
        Self {
            cx,
            ids: cx.ids.with_class(class.unique_id()),
            class,
            cases,
            aggregator: ExceptionAggregator::from_parent(parent_aggregator),
            fixtures: FixtureMap::new(),
            disposal: DisposalTracker::new(),
            constructor: None,
        }
    }

    pub(super) fn run(mut self) -> RunSummary {
        run_lifecycle(self.cx.assembly, &mut self)
    }

    /// The case orderer: the class's own, then the collection's, then the run's, then the
    /// assembly's.
    fn case_orderer(&self) -> Option<&str> {
        self.class
            .case_orderer()
            .or_else(|| {
                self.class
                    .collection()
                    .definition()
                    .and_then(|definition| definition.case_orderer())
            })
            .or(self.cx.assembly.options().case_orderer.as_deref())
            .or_else(|| self.class.collection().assembly().case_orderer())
    }
}

impl NodeRunner for ClassRunner<'_> {
    fn ids(&self) -> &NodeIds {
        &self.ids
    }

    fn aggregator(&mut self) -> &mut ExceptionAggregator {
        &mut self.aggregator
    }

    fn starting_message(&self) -> MessageKind {
        MessageKind::ClassStarting {
            class_name: self.class.name().to_owned(),
        }
    }

    fn finished_message(&self, summary: RunSummary) -> MessageKind {
        MessageKind::ClassFinished { summary }
    }

    fn cleanup_failure_message(&self, error: ErrorMetadata) -> MessageKind {
        MessageKind::ClassCleanupFailure { error }
    }

    fn after_starting(&mut self) {
        let diagnostics = self.cx.assembly.diagnostics(&self.ids);
        construct_fixtures(
            self.class.fixtures(),
            FixtureKind::Class,
            &[self.cx.fixtures],
            &diagnostics,
            &mut self.fixtures,
            &mut self.disposal,
            &mut self.aggregator,
        );

        if let Some(constructor) = self.class.constructor() {
            match constructor.resolve(
                FixtureKind::TestClass,
                &[&self.fixtures, self.cx.fixtures],
                &diagnostics,
            ) {
                Ok(resolved) => self.constructor = Some(resolved),
                Err(err) => self.aggregator.add(err),
            }
        }
    }

    fn run_children(&mut self) -> RunSummary {
        let ordered = self.cx.assembly.orderers().order_cases(
            self.case_orderer(),
            self.cases.clone(),
            &self.cx.assembly.diagnostics(&self.ids),
        );

        let mut methods: IndexMap<&str, (&Arc<TestMethod>, Vec<Arc<TestCase>>)> =
            IndexMap::new();
        for case in &ordered {
            let method = case.method();
            methods
                .entry(method.unique_id())
                .or_insert_with(|| (method, Vec::new()))
                .1
                .push(case.clone());
        }

        let class_cx = ClassContext {
            collection: self.cx,
            ids: self.ids.clone(),
            fixtures: &self.fixtures,
        };

        let mut summary = RunSummary::default();
        for (method, cases) in methods.into_values() {
            if self.cx.assembly.is_cancelled() {
                break;
            }
            summary += MethodRunner::new(
                &class_cx,
                &self.aggregator,
                self.constructor.as_ref(),
                method.clone(),
                cases,
            )
            .run();
        }
        summary
    }

    fn before_finished(&mut self) {
        self.disposal.dispose_all(&mut self.aggregator);
    }
}
