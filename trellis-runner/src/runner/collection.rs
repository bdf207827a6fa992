// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    AssemblyContext, ClassRunner, CollectionContext,
    lifecycle::{NodeRunner, run_lifecycle},
};
use crate::{
    aggregator::ExceptionAggregator,
    fixture::{DisposalTracker, FixtureKind, FixtureMap, construct_fixtures},
    list::{TestCase, TestClass, TestCollection},
};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::info_span;
use trellis_metadata::{ErrorMetadata, MessageKind, NodeIds, RunSummary};

/// Runs the classes of one collection, sequentially, around the collection's fixtures.
pub(super) struct CollectionRunner<'a> {
    cx: &'a AssemblyContext,
    ids: NodeIds,
    collection: Arc<TestCollection>,
    cases: Vec<Arc<TestCase>>,
    aggregator: ExceptionAggregator,
    fixtures: FixtureMap,
    disposal: DisposalTracker,
}

impl<'a> CollectionRunner<'a> {
    pub(super) fn new(
        cx: &'a AssemblyContext,
        parent_ids: &NodeIds,
        parent_aggregator: &ExceptionAggregator,
        collection: Arc<TestCollection>,
        cases: Vec<Arc<TestCase>>,
    ) -> Self {
        Self {
            cx,
            ids: parent_ids.with_collection(collection.unique_id()),
            collection,
            cases,
            aggregator: ExceptionAggregator::from_parent(parent_aggregator),
            fixtures: FixtureMap::new(),
            disposal: DisposalTracker::new(),
        }
    }

    pub(super) fn run(mut self) -> RunSummary {
        let span = info_span!("collection", name = self.collection.display_name());
        let _enter = span.enter();
        run_lifecycle(self.cx, &mut self)
    }
}

impl NodeRunner for CollectionRunner<'_> {
    fn ids(&self) -> &NodeIds {
        &self.ids
    }

    fn aggregator(&mut self) -> &mut ExceptionAggregator {
        &mut self.aggregator
    }

    fn starting_message(&self) -> MessageKind {
        MessageKind::CollectionStarting {
            display_name: self.collection.display_name().to_owned(),
            definition: self
                .collection
                .definition()
                .map(|definition| definition.type_name().to_owned()),
        }
    }

    fn finished_message(&self, summary: RunSummary) -> MessageKind {
        MessageKind::CollectionFinished { summary }
    }

    fn cleanup_failure_message(&self, error: ErrorMetadata) -> MessageKind {
        MessageKind::CollectionCleanupFailure { error }
    }

    fn after_starting(&mut self) {
        if let Some(definition) = self.collection.definition() {
            construct_fixtures(
                definition.fixtures(),
                FixtureKind::Collection,
                &[],
                &self.cx.diagnostics(&self.ids),
                &mut self.fixtures,
                &mut self.disposal,
                &mut self.aggregator,
            );
        }
    }

    fn run_children(&mut self) -> RunSummary {
        let mut classes: IndexMap<&str, (&Arc<TestClass>, Vec<Arc<TestCase>>)> = IndexMap::new();
        for case in &self.cases {
            let class = case.class();
            classes
                .entry(class.unique_id())
                .or_insert_with(|| (class, Vec::new()))
                .1
                .push(case.clone());
        }

        let collection_cx = CollectionContext {
            assembly: self.cx,
            ids: self.ids.clone(),
            fixtures: &self.fixtures,
        };

        let mut summary = RunSummary::default();
        for (class, cases) in classes.into_values() {
            if self.cx.is_cancelled() {
                break;
            }
            summary += ClassRunner::new(&collection_cx, &self.aggregator, class.clone(), cases).run();
        }
        summary
    }

    fn before_finished(&mut self) {
        self.disposal.dispose_all(&mut self.aggregator);
    }
}
