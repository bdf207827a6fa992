// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures: values constructed once and shared by a group of tests.
//!
//! Collection fixtures are shared by every test in a collection, class fixtures by every test in
//! a class. The test-class constructor, which builds one instance per test, follows the same
//! rules. A definition must have exactly one constructor, and every constructor parameter must
//! be satisfied by a fixture that is already available (or be a [`DiagnosticSender`]).
//!
//! Fixtures are shared across threads as `Arc<T>`. The engine adds no locking around them: a
//! fixture that is mutated by tests must synchronize internally.

use crate::{
    aggregator::{CapturedError, ExceptionAggregator, TestResult},
    errors::FixtureConstructionError,
    message_bus::DiagnosticSender,
};
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::{
    any::{Any, TypeId},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

/// A type-erased fixture value.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// What is being constructed from a [`FixtureDefinition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FixtureKind {
    /// A fixture shared by every test in a collection.
    Collection,

    /// A fixture shared by every test in a class.
    Class,

    /// The per-test instance of a test class.
    TestClass,
}

impl fmt::Display for FixtureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection => write!(f, "Collection fixture"),
            Self::Class => write!(f, "Class fixture"),
            Self::TestClass => write!(f, "Test class"),
        }
    }
}

/// A constructor parameter, identified by type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameter {
    type_id: TypeId,
    type_name: &'static str,
    name: String,
}

impl Parameter {
    /// A parameter of type `T` with the given name.
    pub fn of<T: Any>(name: impl Into<String>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.type_name, self.name)
    }
}

type SyncTeardownFn = Box<dyn FnOnce() -> TestResult + Send>;
type AsyncTeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, TestResult> + Send>;

/// How to tear down a fixture, a test-class instance or a theory data row.
///
/// A teardown may have an asynchronous part, a synchronous part, or both. The asynchronous part
/// always runs first.
#[derive(Default)]
pub struct Teardown {
    async_part: Option<AsyncTeardownFn>,
    sync_part: Option<SyncTeardownFn>,
}

impl Teardown {
    /// A teardown that does nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the synchronous part of the teardown.
    pub fn with_sync(mut self, f: impl FnOnce() -> TestResult + Send + 'static) -> Self {
        self.sync_part = Some(Box::new(f));
        self
    }

    /// Sets the asynchronous part of the teardown.
    pub fn with_async<F>(mut self, f: impl FnOnce() -> F + Send + 'static) -> Self
    where
        F: Future<Output = TestResult> + Send + 'static,
    {
        self.async_part = Some(Box::new(move || Box::pin(f())));
        self
    }

    /// Returns true if there is nothing to tear down.
    pub fn is_empty(&self) -> bool {
        self.async_part.is_none() && self.sync_part.is_none()
    }

    /// Runs both parts, async first, capturing failures into `aggregator`.
    pub(crate) fn run(self, aggregator: &mut ExceptionAggregator) {
        let Teardown {
            async_part,
            sync_part,
        } = self;
        if let Some(async_part) = async_part {
            run_async_part(async_part, aggregator);
        }
        if let Some(sync_part) = sync_part {
            aggregator.run(sync_part);
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("async", &self.async_part.is_some())
            .field("sync", &self.sync_part.is_some())
            .finish()
    }
}

fn run_async_part(async_part: AsyncTeardownFn, aggregator: &mut ExceptionAggregator) {
    // Creating the future runs user code too.
    if let Some(fut) = aggregator.run(|| Ok::<_, CapturedError>(async_part())) {
        futures::executor::block_on(aggregator.run_async(fut));
    }
}

/// Tracks teardowns and runs them in reverse order of acquisition.
///
/// Every asynchronous teardown runs (and completes) before any synchronous teardown runs.
#[derive(Debug, Default)]
pub struct DisposalTracker {
    teardowns: Vec<Teardown>,
}

impl DisposalTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a teardown.
    pub fn add(&mut self, teardown: Teardown) {
        if !teardown.is_empty() {
            self.teardowns.push(teardown);
        }
    }

    /// The number of tracked teardowns.
    pub fn len(&self) -> usize {
        self.teardowns.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.teardowns.is_empty()
    }

    /// Runs every tracked teardown, capturing failures into `aggregator`.
    pub fn dispose_all(&mut self, aggregator: &mut ExceptionAggregator) {
        let mut sync_parts = Vec::with_capacity(self.teardowns.len());
        for teardown in self.teardowns.drain(..).rev() {
            if let Some(async_part) = teardown.async_part {
                run_async_part(async_part, aggregator);
            }
            sync_parts.extend(teardown.sync_part);
        }
        for sync_part in sync_parts {
            aggregator.run(sync_part);
        }
    }
}

/// A constructed fixture: its value and how to tear it down.
#[derive(Debug)]
pub struct Fixture {
    value: DebugIgnore<FixtureValue>,
    teardown: Teardown,
}

impl Fixture {
    /// Wraps a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wraps a value that is already shared, for example with its own teardown closure.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            value: DebugIgnore(value as FixtureValue),
            teardown: Teardown::new(),
        }
    }

    /// Sets the teardown for this fixture.
    pub fn with_teardown(mut self, teardown: Teardown) -> Self {
        self.teardown = teardown;
        self
    }

    /// The fixture's value.
    pub fn value(&self) -> &FixtureValue {
        &self.value
    }

    pub(crate) fn into_parts(self) -> (FixtureValue, Teardown) {
        (self.value.0, self.teardown)
    }
}

type BuildFn = Arc<dyn Fn(&FixtureArgs) -> TestResult<Fixture> + Send + Sync>;

/// One way to construct a fixture.
#[derive(Clone, Debug)]
pub struct FixtureConstructor {
    parameters: Vec<Parameter>,
    build: DebugIgnore<BuildFn>,
}

/// Describes how to construct a fixture of type `T`.
#[derive(Clone, Debug)]
pub struct FixtureDefinition {
    type_id: TypeId,
    type_name: &'static str,
    constructors: Vec<FixtureConstructor>,
}

impl FixtureDefinition {
    /// A definition for type `T`, with no constructors yet.
    pub fn new<T: Any + Send + Sync>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            constructors: Vec::new(),
        }
    }

    /// A definition for type `T` with a single constructor that takes no parameters.
    pub fn from_fn<T, F>(build: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> TestResult<T> + Send + Sync + 'static,
    {
        Self::new::<T>().with_constructor(Vec::new(), move |_| build().map(Fixture::new))
    }

    /// Adds a constructor.
    ///
    /// `build` receives the resolved parameters in the order given.
    pub fn with_constructor(
        mut self,
        parameters: Vec<Parameter>,
        build: impl Fn(&FixtureArgs) -> TestResult<Fixture> + Send + Sync + 'static,
    ) -> Self {
        self.constructors.push(FixtureConstructor {
            parameters,
            build: DebugIgnore(Arc::new(build) as BuildFn),
        });
        self
    }

    /// The type this definition constructs.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The name of the type this definition constructs.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Selects the single constructor and resolves its parameters against `available`.
    pub(crate) fn resolve(
        &self,
        kind: FixtureKind,
        available: &[&FixtureMap],
        diagnostics: &DiagnosticSender,
    ) -> Result<ResolvedConstructor, FixtureConstructionError> {
        let [constructor] = self.constructors.as_slice() else {
            return Err(FixtureConstructionError::MultipleConstructors {
                kind,
                type_name: self.type_name.to_owned(),
            });
        };

        let mut values = Vec::with_capacity(constructor.parameters.len());
        let mut unresolved = Vec::new();
        for parameter in &constructor.parameters {
            if parameter.type_id == TypeId::of::<DiagnosticSender>() {
                values.push(Arc::new(diagnostics.clone()) as FixtureValue);
            } else if let Some(value) = available.iter().find_map(|m| m.get_value(parameter.type_id))
            {
                values.push(value.clone());
            } else {
                unresolved.push(parameter.to_string());
            }
        }

        if !unresolved.is_empty() {
            return Err(FixtureConstructionError::UnresolvedArguments {
                kind,
                type_name: self.type_name.to_owned(),
                arguments: unresolved,
            });
        }

        Ok(ResolvedConstructor {
            kind,
            type_name: self.type_name,
            build: constructor.build.clone(),
            args: FixtureArgs {
                values: DebugIgnore(values),
                diagnostics: diagnostics.clone(),
            },
        })
    }

    /// Resolves and invokes the constructor.
    pub(crate) fn construct(
        &self,
        kind: FixtureKind,
        available: &[&FixtureMap],
        diagnostics: &DiagnosticSender,
    ) -> TestResult<Fixture> {
        self.resolve(kind, available, diagnostics)?.invoke()
    }
}

/// A constructor whose parameters were resolved, ready to be invoked.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedConstructor {
    kind: FixtureKind,
    type_name: &'static str,
    build: DebugIgnore<BuildFn>,
    args: FixtureArgs,
}

impl ResolvedConstructor {
    /// Invokes the constructor.
    ///
    /// Failures, including panics, are wrapped in [`FixtureConstructionError::ConstructorFailed`].
    pub(crate) fn invoke(&self) -> TestResult<Fixture> {
        let res = match catch_unwind(AssertUnwindSafe(|| (self.build.0)(&self.args))) {
            Ok(res) => res,
            Err(payload) => Err(CapturedError::from_panic(payload)),
        };
        res.map_err(|err| {
            tracing::debug!(kind = %self.kind, type_name = self.type_name, "construction failed: {err}");
            CapturedError::new(FixtureConstructionError::ConstructorFailed {
                kind: self.kind,
                type_name: self.type_name.to_owned(),
            })
            .with_inner(err)
        })
    }
}

/// The resolved arguments passed to a constructor.
#[derive(Clone, Debug)]
pub struct FixtureArgs {
    values: DebugIgnore<Vec<FixtureValue>>,
    diagnostics: DiagnosticSender,
}

impl FixtureArgs {
    /// The argument at `index`, if it is of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, index: usize) -> Option<Arc<T>> {
        self.values.get(index)?.clone().downcast::<T>().ok()
    }

    /// The number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the constructor takes no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// A sender for diagnostic messages.
    pub fn diagnostics(&self) -> &DiagnosticSender {
        &self.diagnostics
    }
}

/// Constructed fixtures, keyed by type.
#[derive(Clone, Debug, Default)]
pub struct FixtureMap {
    values: DebugIgnore<IndexMap<TypeId, FixtureValue>>,
}

impl FixtureMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The fixture of type `T`, if one was constructed.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get_value(TypeId::of::<T>())?
            .clone()
            .downcast::<T>()
            .ok()
    }

    /// The number of fixtures.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no fixtures.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn insert(&mut self, type_id: TypeId, value: FixtureValue) {
        self.values.insert(type_id, value);
    }

    fn get_value(&self, type_id: TypeId) -> Option<&FixtureValue> {
        self.values.get(&type_id)
    }
}

/// Constructs every fixture in `definitions` in order, registering each one in `fixtures` and
/// its teardown in `tracker`.
///
/// A fixture may depend on fixtures in `parents` and on fixtures earlier in `definitions`.
/// Failures are captured into `aggregator`.
pub(crate) fn construct_fixtures(
    definitions: &[FixtureDefinition],
    kind: FixtureKind,
    parents: &[&FixtureMap],
    diagnostics: &DiagnosticSender,
    fixtures: &mut FixtureMap,
    tracker: &mut DisposalTracker,
    aggregator: &mut ExceptionAggregator,
) {
    for definition in definitions {
        let mut available = Vec::with_capacity(parents.len() + 1);
        available.push(&*fixtures);
        available.extend_from_slice(parents);

        if let Some(fixture) =
            aggregator.run(|| definition.construct(kind, &available, diagnostics))
        {
            let (value, teardown) = fixture.into_parts();
            fixtures.insert(definition.type_id(), value);
            tracker.add(teardown);
        }
    }
}
