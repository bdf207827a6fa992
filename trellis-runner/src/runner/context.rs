// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::ExecutionOptions,
    fixture::{FixtureMap, FixtureValue},
    list::{Test, TestArgument},
    message_bus::{DiagnosticSender, MessageBus},
    order::OrdererRegistry,
};
use std::{
    any::Any,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use trellis_metadata::{Message, MessageKind, NodeIds};

/// A cancellation flag shared by every runner of a run.
#[derive(Clone, Debug, Default)]
pub(crate) struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// State shared by every runner of a run.
#[derive(Clone)]
pub(crate) struct AssemblyContext {
    bus: Arc<dyn MessageBus>,
    cancellation: CancellationToken,
    orderers: Arc<OrdererRegistry>,
    options: Arc<ExecutionOptions>,
}

impl AssemblyContext {
    pub(crate) fn new(
        bus: Arc<dyn MessageBus>,
        orderers: Arc<OrdererRegistry>,
        options: Arc<ExecutionOptions>,
    ) -> Self {
        Self {
            bus,
            cancellation: CancellationToken::default(),
            orderers,
            options,
        }
    }

    /// Queues a message, cancelling the run if the bus says to stop.
    pub(crate) fn queue(&self, ids: &NodeIds, kind: MessageKind) -> bool {
        let keep_going = self.bus.queue_message(Message::new(ids.clone(), kind));
        if !keep_going {
            self.cancellation.cancel();
        }
        keep_going
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) fn diagnostics(&self, ids: &NodeIds) -> DiagnosticSender {
        DiagnosticSender::new(self.bus.clone(), ids.clone())
    }

    pub(crate) fn orderers(&self) -> &OrdererRegistry {
        &self.orderers
    }

    pub(crate) fn options(&self) -> &ExecutionOptions {
        &self.options
    }
}

impl fmt::Debug for AssemblyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssemblyContext")
            .field("cancellation", &self.cancellation)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Fixtures available to the classes of a collection.
#[derive(Clone, Debug)]
pub(crate) struct CollectionContext<'a> {
    pub(crate) assembly: &'a AssemblyContext,
    pub(crate) ids: NodeIds,
    pub(crate) fixtures: &'a FixtureMap,
}

/// Fixtures available to the tests of a class.
#[derive(Clone, Debug)]
pub(crate) struct ClassContext<'a> {
    pub(crate) collection: &'a CollectionContext<'a>,
    pub(crate) ids: NodeIds,
    pub(crate) fixtures: &'a FixtureMap,
}

/// What a running test can see: its arguments, its class instance, the fixtures of its class
/// and collection, and a way to report output.
#[derive(Clone)]
pub struct TestContext {
    test: Arc<Test>,
    ids: NodeIds,
    assembly: AssemblyContext,
    collection_fixtures: FixtureMap,
    class_fixtures: FixtureMap,
    instance: Option<FixtureValue>,
}

impl TestContext {
    pub(crate) fn new(
        test: Arc<Test>,
        ids: NodeIds,
        class: &ClassContext<'_>,
        instance: Option<FixtureValue>,
    ) -> Self {
        Self {
            test,
            ids,
            assembly: class.collection.assembly.clone(),
            collection_fixtures: class.collection.fixtures.clone(),
            class_fixtures: class.fixtures.clone(),
            instance,
        }
    }

    /// The test being run.
    pub fn test(&self) -> &Test {
        &self.test
    }

    /// The arguments passed to the test.
    pub fn arguments(&self) -> &[TestArgument] {
        self.test.arguments()
    }

    /// The argument at `index`, if it is of type `T`.
    pub fn argument<T: Any>(&self, index: usize) -> Option<&T> {
        self.test.arguments().get(index)?.downcast_ref::<T>()
    }

    /// The test-class instance, if the class has a constructor and it is of type `T`.
    pub fn instance<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.instance.clone()?.downcast::<T>().ok()
    }

    /// The collection fixture of type `T`.
    pub fn collection_fixture<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.collection_fixtures.get::<T>()
    }

    /// The class fixture of type `T`.
    pub fn class_fixture<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.class_fixtures.get::<T>()
    }

    /// Writes a line of output.
    ///
    /// The line is reported immediately as a `TestOutput` message and is attached to the test's
    /// result.
    pub fn write_line(&self, line: impl Into<String>) {
        let line = line.into();
        self.test.append_output(&line);
        self.assembly.queue(
            &self.ids,
            MessageKind::TestOutput {
                output: format!("{line}\n"),
            },
        );
    }

    /// Returns true once the run has been asked to stop.
    pub fn is_cancellation_requested(&self) -> bool {
        self.assembly.is_cancelled()
    }

    /// A sender for diagnostic messages attributed to this test.
    pub fn diagnostics(&self) -> DiagnosticSender {
        self.assembly.diagnostics(&self.ids)
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("test", &self.test.display_name())
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}
