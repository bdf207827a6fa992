// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    AssemblyContext, CollectionRunner,
    lifecycle::{NodeRunner, run_lifecycle},
};
use crate::{
    aggregator::ExceptionAggregator,
    config::ExecutionOptions,
    errors::RunError,
    list::{TestAssembly, TestCase, TestCollection, TestDiscoverer},
    message_bus::new_message_bus,
    order::OrdererRegistry,
    reporter::MessageSink,
    scheduler::{ConcurrencyLimit, MaxConcurrencyScheduler},
    time::{StopwatchStart, stopwatch},
};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info, info_span};
use trellis_metadata::{ErrorMetadata, MessageKind, NodeIds, RunSummary};

/// Runs every test case of an assembly and reports what happens to a [`MessageSink`].
#[derive(Debug)]
pub struct TestAssemblyRunner {
    assembly: Arc<TestAssembly>,
    cases: Vec<Arc<TestCase>>,
    options: ExecutionOptions,
    orderers: OrdererRegistry,
}

impl TestAssemblyRunner {
    /// Creates a runner for `cases`, which must all belong to `assembly`.
    pub fn new(
        assembly: Arc<TestAssembly>,
        cases: Vec<Arc<TestCase>>,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            assembly,
            cases,
            options,
            orderers: OrdererRegistry::new(),
        }
    }

    /// Creates a runner for the cases supplied by `discoverer`.
    pub fn from_discoverer(
        assembly: Arc<TestAssembly>,
        discoverer: &dyn TestDiscoverer,
        options: ExecutionOptions,
    ) -> Self {
        Self::new(assembly, discoverer.discover(), options)
    }

    /// Uses `orderers` to resolve orderer names.
    pub fn with_orderers(mut self, orderers: OrdererRegistry) -> Self {
        self.orderers = orderers;
        self
    }

    /// Runs the assembly, returning its summary.
    ///
    /// Test failures are reported through messages, not as errors. An error is returned only if
    /// the engine itself could not run.
    pub fn run(self, sink: impl MessageSink + 'static) -> Result<RunSummary, RunError> {
        let Self {
            assembly,
            cases,
            options,
            orderers,
        } = self;

        let behavior = assembly.behavior();
        let parallel_limit = if options
            .effective_disable_parallelization(behavior.disable_parallelization)
        {
            None
        } else {
            Some(
                options
                    .effective_max_parallel_threads(behavior.max_parallel_threads)
                    .compute(),
            )
        };

        let span = info_span!("assembly", name = assembly.name());
        let _enter = span.enter();
        info!(
            cases = cases.len(),
            parallel = ?parallel_limit.map(|limit| limit.to_string()),
            "running assembly"
        );

        let bus = new_message_bus(options.message_bus, sink, options.stop_on_fail)?;
        let scheduler = parallel_limit
            .map(MaxConcurrencyScheduler::new)
            .transpose()?;
        let cx = AssemblyContext::new(bus.clone(), Arc::new(orderers), Arc::new(options));

        let mut runner = AssemblyRunner {
            cx: cx.clone(),
            ids: NodeIds::for_assembly(assembly.unique_id()),
            assembly,
            cases,
            aggregator: ExceptionAggregator::new(),
            parallel_limit,
            scheduler,
            stopwatch: stopwatch(),
        };
        let summary = run_lifecycle(&cx, &mut runner);
        drop(runner);

        bus.shutdown()?;
        info!(
            total = summary.total,
            failed = summary.failed,
            skipped = summary.skipped,
            "assembly finished"
        );
        Ok(summary)
    }
}

struct AssemblyRunner {
    cx: AssemblyContext,
    ids: NodeIds,
    assembly: Arc<TestAssembly>,
    cases: Vec<Arc<TestCase>>,
    aggregator: ExceptionAggregator,
    parallel_limit: Option<ConcurrencyLimit>,
    scheduler: Option<MaxConcurrencyScheduler>,
    stopwatch: StopwatchStart,
}

impl AssemblyRunner {
    fn test_environment(&self) -> String {
        let mode = match self.parallel_limit {
            Some(limit) => format!("parallel ({limit} threads)"),
            None => "non-parallel".to_owned(),
        };
        format!("{}-bit trellis [{mode}]", usize::BITS)
    }

    /// Groups cases by collection, keeping the order in which collections are first seen.
    fn collections(&self) -> Vec<(Arc<TestCollection>, Vec<Arc<TestCase>>)> {
        let mut groups: IndexMap<&str, (Arc<TestCollection>, Vec<Arc<TestCase>>)> =
            IndexMap::new();
        for case in &self.cases {
            let collection = case.collection();
            groups
                .entry(collection.unique_id())
                .or_insert_with(|| (collection.clone(), Vec::new()))
                .1
                .push(case.clone());
        }

        let mut by_id: IndexMap<String, Vec<Arc<TestCase>>> = IndexMap::new();
        let mut collections = Vec::with_capacity(groups.len());
        for (id, (collection, cases)) in groups {
            by_id.insert(id.to_owned(), cases);
            collections.push(collection);
        }

        let orderer = self
            .cx
            .options()
            .collection_orderer
            .as_deref()
            .or(self.assembly.collection_orderer());
        let ordered = self.cx.orderers().order_collections(
            orderer,
            collections,
            &self.cx.diagnostics(&self.ids),
        );

        ordered
            .into_iter()
            .map(|collection| {
                let cases = by_id
                    .swap_remove(collection.unique_id())
                    .unwrap_or_default();
                (collection, cases)
            })
            .collect()
    }
}

impl NodeRunner for AssemblyRunner {
    fn ids(&self) -> &NodeIds {
        &self.ids
    }

    fn aggregator(&mut self) -> &mut ExceptionAggregator {
        &mut self.aggregator
    }

    fn starting_message(&self) -> MessageKind {
        MessageKind::AssemblyStarting {
            assembly_name: self.assembly.name().to_owned(),
            assembly_path: self.assembly.path().map(|path| path.to_string()),
            config_file_path: self.assembly.config_file().map(|path| path.to_string()),
            test_environment: self.test_environment(),
            start_time: self.stopwatch.start_time().fixed_offset(),
        }
    }

    fn finished_message(&self, summary: RunSummary) -> MessageKind {
        MessageKind::AssemblyFinished { summary }
    }

    fn cleanup_failure_message(&self, error: ErrorMetadata) -> MessageKind {
        MessageKind::AssemblyCleanupFailure { error }
    }

    fn run_children(&mut self) -> RunSummary {
        let collections = self.collections();

        let Some(scheduler) = &self.scheduler else {
            let mut summary = RunSummary::default();
            for (collection, cases) in collections {
                if self.cx.is_cancelled() {
                    break;
                }
                summary +=
                    CollectionRunner::new(&self.cx, &self.ids, &self.aggregator, collection, cases)
                        .run();
            }
            return summary;
        };

        let (sender, receiver) = crossbeam_channel::unbounded();
        for (collection, cases) in collections {
            let sender = sender.clone();
            let cx = self.cx.clone();
            let ids = self.ids.clone();
            let parent = self.aggregator.clone();
            scheduler.post(move || {
                // Collections that have not started by the time the run is cancelled are skipped.
                if cx.is_cancelled() {
                    debug!(collection = collection.display_name(), "skipped after cancellation");
                    return;
                }
                let summary = CollectionRunner::new(&cx, &ids, &parent, collection, cases).run();
                _ = sender.send(summary);
            });
        }
        drop(sender);

        // Ends once every posted collection has either sent its summary or been dropped.
        receiver.iter().sum()
    }

    fn before_finished(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            if let Err(err) = scheduler.shutdown() {
                self.aggregator.add(err);
            }
        }
    }

    fn finish_summary(&self, mut summary: RunSummary) -> RunSummary {
        summary.time = self.stopwatch.snapshot().duration;
        summary
    }
}
