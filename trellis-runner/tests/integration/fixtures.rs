// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use color_eyre::eyre::{Result, ensure, eyre};
use std::{collections::HashMap, sync::Arc, thread, time::Duration};
use trellis_metadata::{LifecyclePhase, Message, MessageKind, NodeLevel, RunSummary};
use trellis_runner::{
    aggregator::{CapturedError, TestResult},
    config::ExecutionOptions,
    list::{
        CollectionDefinition, TestAssembly, TestBody, TestCase, TestClass, TestCollection, TestMethod,
    },
    message_bus::MessageBusKind,
    reporter::{MessageSink, RecordingSink},
    runner::{TestAssemblyRunner, TestContext},
};

/// Builds a test tree one node at a time.
#[derive(Clone, Debug)]
pub(crate) struct TreeBuilder {
    assembly: Arc<TestAssembly>,
    cases: Vec<Arc<TestCase>>,
}

impl TreeBuilder {
    pub(crate) fn new() -> Self {
        Self::with_assembly(TestAssembly::new("sample-tests"))
    }

    pub(crate) fn with_assembly(assembly: TestAssembly) -> Self {
        Self {
            assembly: Arc::new(assembly),
            cases: Vec::new(),
        }
    }

    pub(crate) fn collection(&self, name: &str) -> Arc<TestCollection> {
        Arc::new(TestCollection::new(&self.assembly, name, None))
    }

    pub(crate) fn defined_collection(
        &self,
        name: &str,
        definition: CollectionDefinition,
    ) -> Arc<TestCollection> {
        Arc::new(TestCollection::new(&self.assembly, name, Some(definition)))
    }

    pub(crate) fn add(&mut self, case: TestCase) -> Arc<TestCase> {
        let case = Arc::new(case);
        self.cases.push(case.clone());
        case
    }

    /// Adds a fact running `body`.
    pub(crate) fn fact(
        &mut self,
        class: &Arc<TestClass>,
        name: &str,
        body: impl Fn(&TestContext) -> TestResult + Send + Sync + 'static,
    ) -> Arc<TestCase> {
        let method = Arc::new(TestMethod::new(class, name, TestBody::new(body)));
        self.add(TestCase::fact(&method))
    }

    pub(crate) fn passing(&mut self, class: &Arc<TestClass>, name: &str) -> Arc<TestCase> {
        self.fact(class, name, |_| Ok(()))
    }

    pub(crate) fn failing(
        &mut self,
        class: &Arc<TestClass>,
        name: &str,
        message: &'static str,
    ) -> Arc<TestCase> {
        self.fact(class, name, move |_| Err(CapturedError::msg(message)))
    }

    pub(crate) fn into_parts(self) -> (Arc<TestAssembly>, Vec<Arc<TestCase>>) {
        (self.assembly, self.cases)
    }

    pub(crate) fn run(self, options: ExecutionOptions) -> Result<RunResult> {
        self.run_with(RecordingSink::new(), options)
    }

    pub(crate) fn run_with(self, sink: RecordingSink, options: ExecutionOptions) -> Result<RunResult> {
        let runner = TestAssemblyRunner::new(self.assembly, self.cases, options);
        let summary = runner.run(sink.clone())?;
        Ok(RunResult {
            summary,
            messages: sink.messages(),
        })
    }

    /// Like [`Self::run_with`], but the sink takes a while with every message so that an
    /// asynchronous bus falls behind the runners.
    pub(crate) fn run_with_slow_sink(
        self,
        sink: RecordingSink,
        options: ExecutionOptions,
    ) -> Result<RunResult> {
        let runner = TestAssemblyRunner::new(self.assembly, self.cases, options);
        let mut slow = sink.clone();
        let summary = runner.run(move |message: &Message| {
            thread::sleep(SLOW_SINK_DELAY);
            slow.on_message(message)
        })?;
        Ok(RunResult {
            summary,
            messages: sink.messages(),
        })
    }
}

const SLOW_SINK_DELAY: Duration = Duration::from_millis(20);

pub(crate) fn class(collection: &Arc<TestCollection>, name: &str) -> Arc<TestClass> {
    Arc::new(TestClass::new(collection, name))
}

/// Options for a serial run with synchronous delivery, so message order is deterministic.
pub(crate) fn serial_options() -> ExecutionOptions {
    serial_options_with(MessageBusKind::Synchronous)
}

pub(crate) fn serial_options_with(message_bus: MessageBusKind) -> ExecutionOptions {
    ExecutionOptions::new()
        .with_disable_parallelization(true)
        .with_message_bus(message_bus)
        .with_collection_orderer("declaration")
        .with_case_orderer("declaration")
}

#[derive(Debug)]
pub(crate) struct RunResult {
    pub(crate) summary: RunSummary,
    pub(crate) messages: Vec<Message>,
}

impl RunResult {
    pub(crate) fn count(&self, f: impl Fn(&MessageKind) -> bool) -> usize {
        self.messages.iter().filter(|m| f(&m.kind)).count()
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.messages.iter().map(|m| m.kind.name()).collect()
    }

    pub(crate) fn failures(&self) -> Vec<(String, Vec<String>)> {
        let mut names = HashMap::new();
        let mut out = Vec::new();
        for message in &self.messages {
            match &message.kind {
                MessageKind::TestStarting { display_name } => {
                    names.insert(message.ids.node_id().to_owned(), display_name.clone());
                }
                MessageKind::TestFailed { error, .. } => {
                    let name = names
                        .get(message.ids.node_id())
                        .cloned()
                        .unwrap_or_default();
                    out.push((name, error.messages.clone()));
                }
                _ => {}
            }
        }
        out
    }

    pub(crate) fn assembly_finished(&self) -> Option<RunSummary> {
        self.messages.iter().find_map(|m| match &m.kind {
            MessageKind::AssemblyFinished { summary } => Some(*summary),
            _ => None,
        })
    }

    /// Checks the structural guarantees of a message stream: every node that starts also
    /// finishes, a node starts before its children and finishes after them, and every finished
    /// summary adds up the summaries of its children.
    pub(crate) fn check_structure(&self) -> Result<()> {
        let mut starts = HashMap::new();
        let mut finishes = HashMap::new();
        for (index, message) in self.messages.iter().enumerate() {
            let Some((level, phase)) = message.lifecycle() else {
                continue;
            };
            let key = (level, message.ids.clone());
            match phase {
                LifecyclePhase::Starting => {
                    ensure!(
                        starts.insert(key, index).is_none(),
                        "{level:?} started twice at index {index}"
                    );
                }
                LifecyclePhase::Finished => {
                    ensure!(
                        finishes.insert(key, index).is_none(),
                        "{level:?} finished twice at index {index}"
                    );
                }
                LifecyclePhase::CleanupFailure => {}
            }
        }

        ensure!(
            starts.len() == finishes.len(),
            "{} nodes started but {} finished",
            starts.len(),
            finishes.len()
        );

        for ((level, ids), &start) in &starts {
            let finish = *finishes
                .get(&(*level, ids.clone()))
                .ok_or_else(|| eyre!("{level:?} {} never finished", ids.node_id()))?;
            ensure!(start < finish, "{level:?} finished before it started");

            if let Some(parent) = ids.parent() {
                let parent_level = parent.level();
                let parent_start = starts
                    .get(&(parent_level, parent.clone()))
                    .ok_or_else(|| eyre!("parent of {level:?} never started"))?;
                let parent_finish = finishes[&(parent_level, parent)];
                ensure!(
                    *parent_start < start && finish < parent_finish,
                    "{level:?} is not nested within its parent"
                );
            }
        }

        // Sum the children's summaries into each parent.
        let mut sums: HashMap<_, RunSummary> = HashMap::new();
        for message in &self.messages {
            let Some(parent) = message.ids.parent() else {
                continue;
            };
            let contribution = match &message.kind {
                MessageKind::TestPassed { .. } => RunSummary {
                    total: 1,
                    ..RunSummary::default()
                },
                MessageKind::TestFailed { .. } => RunSummary {
                    total: 1,
                    failed: 1,
                    ..RunSummary::default()
                },
                MessageKind::TestSkipped { .. } => RunSummary {
                    total: 1,
                    skipped: 1,
                    ..RunSummary::default()
                },
                MessageKind::CollectionFinished { summary }
                | MessageKind::ClassFinished { summary }
                | MessageKind::MethodFinished { summary }
                | MessageKind::CaseFinished { summary } => *summary,
                _ => continue,
            };
            let sum = sums.entry(parent.node_id().to_owned()).or_default();
            sum.total += contribution.total;
            sum.failed += contribution.failed;
            sum.skipped += contribution.skipped;
        }

        for message in &self.messages {
            let Some(summary) = message.summary() else {
                continue;
            };
            let Some((level, LifecyclePhase::Finished)) = message.lifecycle() else {
                continue;
            };
            if level == NodeLevel::Test {
                continue;
            }
            let sum = sums.get(message.ids.node_id()).copied().unwrap_or_default();
            ensure!(
                (summary.total, summary.failed, summary.skipped)
                    == (sum.total, sum.failed, sum.skipped),
                "{level:?} summary {summary:?} does not add up its children ({sum:?})"
            );
        }

        Ok(())
    }
}
