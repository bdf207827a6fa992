// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::unique_id;
use crate::{
    aggregator::TestResult,
    config::MaxParallelThreads,
    fixture::{FixtureDefinition, Teardown},
    runner::TestContext,
};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use itertools::Itertools;
use smol_str::SmolStr;
use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use swrite::{SWrite, swrite};

/// Supplies the test cases for a run.
///
/// Discovery happens outside the engine: implementations produce fully-built cases, with every
/// ancestor attached, in declaration order.
pub trait TestDiscoverer {
    /// Returns every test case to run.
    fn discover(&self) -> Vec<Arc<TestCase>>;
}

impl TestDiscoverer for Vec<Arc<TestCase>> {
    fn discover(&self) -> Vec<Arc<TestCase>> {
        self.clone()
    }
}

/// How an assembly's collections may be run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectionBehavior {
    /// If true, collections run one at a time on the calling thread.
    pub disable_parallelization: Option<bool>,

    /// The maximum number of collections in flight.
    pub max_parallel_threads: Option<MaxParallelThreads>,
}

/// The unit under test.
#[derive(Clone, Debug)]
pub struct TestAssembly {
    name: String,
    path: Option<Utf8PathBuf>,
    config_file: Option<Utf8PathBuf>,
    unique_id: String,
    behavior: CollectionBehavior,
    collection_orderer: Option<String>,
    case_orderer: Option<String>,
    hooks: Vec<BeforeAfterHook>,
}

impl TestAssembly {
    /// Creates an assembly with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let unique_id = unique_id::for_assembly(&name, None, None);
        Self {
            name,
            path: None,
            config_file: None,
            unique_id,
            behavior: CollectionBehavior::default(),
            collection_orderer: None,
            case_orderer: None,
            hooks: Vec::new(),
        }
    }

    /// Sets the path to the assembly.
    pub fn with_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.path = Some(path.into());
        self.recompute_id();
        self
    }

    /// Sets the path to the config file used for the assembly.
    pub fn with_config_file(mut self, config_file: impl Into<Utf8PathBuf>) -> Self {
        self.config_file = Some(config_file.into());
        self.recompute_id();
        self
    }

    /// Sets how collections may be run.
    pub fn with_behavior(mut self, behavior: CollectionBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Sets the name of the collection orderer.
    pub fn with_collection_orderer(mut self, name: impl Into<String>) -> Self {
        self.collection_orderer = Some(name.into());
        self
    }

    /// Sets the name of the default case orderer.
    pub fn with_case_orderer(mut self, name: impl Into<String>) -> Self {
        self.case_orderer = Some(name.into());
        self
    }

    /// Adds a hook that runs around every test in the assembly.
    pub fn with_before_after(mut self, hook: BeforeAfterHook) -> Self {
        self.hooks.push(hook);
        self
    }

    fn recompute_id(&mut self) {
        self.unique_id = unique_id::for_assembly(
            &self.name,
            self.path.as_deref().map(Utf8Path::as_str),
            self.config_file.as_deref().map(Utf8Path::as_str),
        );
    }

    /// The assembly's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path to the assembly, if known.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// The config file used for the assembly, if any.
    pub fn config_file(&self) -> Option<&Utf8Path> {
        self.config_file.as_deref()
    }

    /// The assembly's unique ID.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// How collections may be run.
    pub fn behavior(&self) -> CollectionBehavior {
        self.behavior
    }

    /// The name of the collection orderer, if set.
    pub fn collection_orderer(&self) -> Option<&str> {
        self.collection_orderer.as_deref()
    }

    /// The name of the default case orderer, if set.
    pub fn case_orderer(&self) -> Option<&str> {
        self.case_orderer.as_deref()
    }

    /// Hooks that run around every test.
    pub fn hooks(&self) -> &[BeforeAfterHook] {
        &self.hooks
    }
}

/// The type that defines a collection: its fixtures and case orderer.
#[derive(Clone, Debug)]
pub struct CollectionDefinition {
    type_name: String,
    fixtures: Vec<FixtureDefinition>,
    case_orderer: Option<String>,
}

impl CollectionDefinition {
    /// Creates a definition with the given type name.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fixtures: Vec::new(),
            case_orderer: None,
        }
    }

    /// Adds a collection fixture. Fixtures are constructed in the order they are added.
    pub fn with_fixture(mut self, fixture: FixtureDefinition) -> Self {
        self.fixtures.push(fixture);
        self
    }

    /// Sets the case orderer for every class in the collection.
    pub fn with_case_orderer(mut self, name: impl Into<String>) -> Self {
        self.case_orderer = Some(name.into());
        self
    }

    /// The definition's type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The collection fixtures.
    pub fn fixtures(&self) -> &[FixtureDefinition] {
        &self.fixtures
    }

    /// The case orderer, if set.
    pub fn case_orderer(&self) -> Option<&str> {
        self.case_orderer.as_deref()
    }
}

/// A group of test classes that share collection fixtures and never run in parallel with each
/// other.
#[derive(Clone, Debug)]
pub struct TestCollection {
    assembly: Arc<TestAssembly>,
    display_name: String,
    definition: Option<CollectionDefinition>,
    unique_id: String,
}

impl TestCollection {
    /// Creates a collection.
    pub fn new(
        assembly: &Arc<TestAssembly>,
        display_name: impl Into<String>,
        definition: Option<CollectionDefinition>,
    ) -> Self {
        let display_name = display_name.into();
        let unique_id = unique_id::for_collection(
            assembly.unique_id(),
            &display_name,
            definition.as_ref().map(|d| d.type_name()),
        );
        Self {
            assembly: assembly.clone(),
            display_name,
            definition,
            unique_id,
        }
    }

    /// The assembly this collection belongs to.
    pub fn assembly(&self) -> &Arc<TestAssembly> {
        &self.assembly
    }

    /// The collection's display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The collection definition, if any.
    pub fn definition(&self) -> Option<&CollectionDefinition> {
        self.definition.as_ref()
    }

    /// The collection's unique ID.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }
}

/// A class under test.
#[derive(Clone, Debug)]
pub struct TestClass {
    collection: Arc<TestCollection>,
    name: String,
    unique_id: String,
    constructor: Option<FixtureDefinition>,
    fixtures: Vec<FixtureDefinition>,
    case_orderer: Option<String>,
    hooks: Vec<BeforeAfterHook>,
}

impl TestClass {
    /// Creates a class.
    pub fn new(collection: &Arc<TestCollection>, name: impl Into<String>) -> Self {
        let name = name.into();
        let unique_id = unique_id::for_class(collection.unique_id(), &name);
        Self {
            collection: collection.clone(),
            name,
            unique_id,
            constructor: None,
            fixtures: Vec::new(),
            case_orderer: None,
            hooks: Vec::new(),
        }
    }

    /// Sets how the per-test instance of this class is constructed.
    pub fn with_constructor(mut self, constructor: FixtureDefinition) -> Self {
        self.constructor = Some(constructor);
        self
    }

    /// Adds a class fixture. Fixtures are constructed in the order they are added.
    pub fn with_class_fixture(mut self, fixture: FixtureDefinition) -> Self {
        self.fixtures.push(fixture);
        self
    }

    /// Sets the case orderer for this class.
    pub fn with_case_orderer(mut self, name: impl Into<String>) -> Self {
        self.case_orderer = Some(name.into());
        self
    }

    /// Adds a hook that runs around every test in the class.
    pub fn with_before_after(mut self, hook: BeforeAfterHook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// The collection this class belongs to.
    pub fn collection(&self) -> &Arc<TestCollection> {
        &self.collection
    }

    /// The class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The class's unique ID.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// The test-class constructor, if the class has per-test state.
    pub fn constructor(&self) -> Option<&FixtureDefinition> {
        self.constructor.as_ref()
    }

    /// The class fixtures.
    pub fn fixtures(&self) -> &[FixtureDefinition] {
        &self.fixtures
    }

    /// The case orderer, if set.
    pub fn case_orderer(&self) -> Option<&str> {
        self.case_orderer.as_deref()
    }

    /// Hooks that run around every test in the class.
    pub fn hooks(&self) -> &[BeforeAfterHook] {
        &self.hooks
    }
}

/// A method under test.
#[derive(Clone, Debug)]
pub struct TestMethod {
    class: Arc<TestClass>,
    name: String,
    unique_id: String,
    body: TestBody,
    hooks: Vec<BeforeAfterHook>,
}

impl TestMethod {
    /// Creates a method with the given body.
    pub fn new(class: &Arc<TestClass>, name: impl Into<String>, body: TestBody) -> Self {
        let name = name.into();
        let unique_id = unique_id::for_method(class.unique_id(), &name);
        Self {
            class: class.clone(),
            name,
            unique_id,
            body,
            hooks: Vec::new(),
        }
    }

    /// Adds a hook that runs around every test of this method.
    pub fn with_before_after(mut self, hook: BeforeAfterHook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// The class this method belongs to.
    pub fn class(&self) -> &Arc<TestClass> {
        &self.class
    }

    /// The method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The method's unique ID.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// The test body.
    pub fn body(&self) -> &TestBody {
        &self.body
    }

    /// Hooks that run around every test of this method.
    pub fn hooks(&self) -> &[BeforeAfterHook] {
        &self.hooks
    }

    /// The method's name qualified by its class, as `Class.method`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.class.name(), self.name)
    }
}

type SyncBodyFn = Arc<dyn Fn(&TestContext) -> TestResult + Send + Sync>;
type AsyncBodyFn = Arc<dyn Fn(TestContext) -> BoxFuture<'static, TestResult> + Send + Sync>;

/// The code of a test.
#[derive(Clone)]
pub enum TestBody {
    /// A synchronous body.
    Sync(SyncBodyFn),

    /// An asynchronous body, driven to completion on the thread running the test.
    Async(AsyncBodyFn),
}

impl TestBody {
    /// A synchronous body.
    pub fn new(f: impl Fn(&TestContext) -> TestResult + Send + Sync + 'static) -> Self {
        Self::Sync(Arc::new(f))
    }

    /// An asynchronous body.
    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |cx| Box::pin(f(cx))))
    }
}

impl fmt::Debug for TestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("TestBody::Sync"),
            Self::Async(_) => f.write_str("TestBody::Async"),
        }
    }
}

type HookFn = Arc<dyn Fn(&TestContext) -> TestResult + Send + Sync>;

/// Code that runs before and after each test it applies to.
///
/// Before hooks run in order from the assembly down to the method. After hooks run in reverse,
/// and only for hooks whose before part started.
#[derive(Clone, Debug)]
pub struct BeforeAfterHook {
    name: String,
    before: Option<DebugIgnore<HookFn>>,
    after: Option<DebugIgnore<HookFn>>,
}

impl BeforeAfterHook {
    /// A hook with the given name and no code yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: None,
            after: None,
        }
    }

    /// Sets the code that runs before the test.
    pub fn with_before(
        mut self,
        f: impl Fn(&TestContext) -> TestResult + Send + Sync + 'static,
    ) -> Self {
        self.before = Some(DebugIgnore(Arc::new(f) as HookFn));
        self
    }

    /// Sets the code that runs after the test.
    pub fn with_after(
        mut self,
        f: impl Fn(&TestContext) -> TestResult + Send + Sync + 'static,
    ) -> Self {
        self.after = Some(DebugIgnore(Arc::new(f) as HookFn));
        self
    }

    /// The hook's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run_before(&self, cx: &TestContext) -> TestResult {
        match &self.before {
            Some(before) => (before.0)(cx),
            None => Ok(()),
        }
    }

    pub(crate) fn run_after(&self, cx: &TestContext) -> TestResult {
        match &self.after {
            Some(after) => (after.0)(cx),
            None => Ok(()),
        }
    }
}

/// A value passed to a test.
#[derive(Clone)]
pub struct TestArgument {
    value: Arc<dyn Any + Send + Sync>,
    display: String,
}

impl TestArgument {
    /// Wraps a value. The argument is displayed using its `Debug` representation.
    pub fn new<T: fmt::Debug + Any + Send + Sync>(value: T) -> Self {
        let display = format!("{value:?}");
        Self {
            value: Arc::new(value),
            display,
        }
    }

    /// Wraps a value with an explicit display string.
    pub fn with_display<T: Any + Send + Sync>(value: T, display: impl Into<String>) -> Self {
        Self {
            value: Arc::new(value),
            display: display.into(),
        }
    }

    /// How the argument is displayed in test names and unique IDs.
    pub fn display(&self) -> &str {
        &self.display
    }

    /// The value, if it is of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for TestArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TestArgument").field(&self.display).finish()
    }
}

type TheoryDataFn = Arc<dyn Fn() -> TestResult<Vec<DataRow>> + Send + Sync>;

/// A data source enumerated when the test case runs.
#[derive(Clone, Debug)]
pub struct TheoryData {
    source: DebugIgnore<TheoryDataFn>,
}

impl TheoryData {
    /// A data source backed by `f`.
    pub fn new(f: impl Fn() -> TestResult<Vec<DataRow>> + Send + Sync + 'static) -> Self {
        Self {
            source: DebugIgnore(Arc::new(f) as TheoryDataFn),
        }
    }

    pub(crate) fn enumerate(&self) -> TestResult<Vec<DataRow>> {
        (self.source.0)()
    }
}

/// One row of theory data.
#[derive(Debug)]
pub struct DataRow {
    arguments: Vec<TestArgument>,
    display_name: Option<String>,
    skip_reason: Option<String>,
    teardown: Teardown,
}

impl DataRow {
    /// A row with the given arguments.
    pub fn new(arguments: Vec<TestArgument>) -> Self {
        Self {
            arguments,
            display_name: None,
            skip_reason: None,
            teardown: Teardown::new(),
        }
    }

    /// Overrides the display name of the test for this row.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Skips the test for this row.
    pub fn with_skip_reason(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    /// Sets how the row's data is torn down once every row of the case has run.
    pub fn with_teardown(mut self, teardown: Teardown) -> Self {
        self.teardown = teardown;
        self
    }

    pub(crate) fn into_parts(self) -> (Vec<TestArgument>, Option<String>, Option<String>, Teardown) {
        (
            self.arguments,
            self.display_name,
            self.skip_reason,
            self.teardown,
        )
    }
}

/// What a test case runs.
#[derive(Clone, Debug)]
pub enum TestCaseKind {
    /// A test without arguments.
    Fact,

    /// A test with arguments that were known at discovery time.
    DataRow {
        /// The arguments.
        arguments: Vec<TestArgument>,
    },

    /// A test whose data is enumerated when the case runs, producing one test per row.
    Theory(TheoryData),

    /// A discovery-time error, reported as a single failing test.
    ExecutionError {
        /// The error message.
        message: String,
    },
}

/// The unit of scheduling: a method, possibly with arguments.
#[derive(Clone, Debug)]
pub struct TestCase {
    method: Arc<TestMethod>,
    kind: TestCaseKind,
    display_name: String,
    skip_reason: Option<String>,
    traits: BTreeMap<SmolStr, Vec<SmolStr>>,
    generic_bindings: Vec<String>,
    unique_id: String,
}

impl TestCase {
    fn new_impl(method: &Arc<TestMethod>, kind: TestCaseKind) -> Self {
        let display_name = match &kind {
            TestCaseKind::DataRow { arguments } => {
                display_with_arguments(&method.qualified_name(), arguments)
            }
            _ => method.qualified_name(),
        };
        let mut case = Self {
            method: method.clone(),
            kind,
            display_name,
            skip_reason: None,
            traits: BTreeMap::new(),
            generic_bindings: Vec::new(),
            unique_id: String::new(),
        };
        case.recompute_id();
        case
    }

    /// A test without arguments.
    pub fn fact(method: &Arc<TestMethod>) -> Self {
        Self::new_impl(method, TestCaseKind::Fact)
    }

    /// A test with arguments known at discovery time.
    pub fn data_row(method: &Arc<TestMethod>, arguments: Vec<TestArgument>) -> Self {
        Self::new_impl(method, TestCaseKind::DataRow { arguments })
    }

    /// A test whose data is enumerated at run time.
    pub fn theory(method: &Arc<TestMethod>, data: TheoryData) -> Self {
        Self::new_impl(method, TestCaseKind::Theory(data))
    }

    /// A case that reports a discovery-time error as a failing test.
    pub fn execution_error(method: &Arc<TestMethod>, message: impl Into<String>) -> Self {
        Self::new_impl(
            method,
            TestCaseKind::ExecutionError {
                message: message.into(),
            },
        )
    }

    /// Overrides the display name.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Skips every test of the case.
    pub fn with_skip_reason(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    /// Adds a trait (a key-value pair used for filtering and reporting).
    pub fn with_trait(mut self, key: impl Into<SmolStr>, value: impl Into<SmolStr>) -> Self {
        self.traits.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Sets the generic type bindings of the case.
    pub fn with_generic_bindings<I, S>(mut self, bindings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.generic_bindings = bindings.into_iter().map(Into::into).collect();
        self.recompute_id();
        self
    }

    fn recompute_id(&mut self) {
        let arguments = match &self.kind {
            TestCaseKind::DataRow { arguments } => arguments.as_slice(),
            _ => &[],
        };
        self.unique_id = unique_id::for_test_case(
            self.method.unique_id(),
            self.generic_bindings.iter().map(String::as_str),
            arguments.iter().map(TestArgument::display),
        );
    }

    /// The method this case runs.
    pub fn method(&self) -> &Arc<TestMethod> {
        &self.method
    }

    /// The class this case belongs to.
    pub fn class(&self) -> &Arc<TestClass> {
        self.method.class()
    }

    /// The collection this case belongs to.
    pub fn collection(&self) -> &Arc<TestCollection> {
        self.method.class().collection()
    }

    /// The assembly this case belongs to.
    pub fn assembly(&self) -> &Arc<TestAssembly> {
        self.collection().assembly()
    }

    /// What the case runs.
    pub fn kind(&self) -> &TestCaseKind {
        &self.kind
    }

    /// The display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Why the case is skipped, if it is.
    pub fn skip_reason(&self) -> Option<&str> {
        self.skip_reason.as_deref()
    }

    /// The traits of the case.
    pub fn traits(&self) -> &BTreeMap<SmolStr, Vec<SmolStr>> {
        &self.traits
    }

    /// The generic type bindings.
    pub fn generic_bindings(&self) -> &[String] {
        &self.generic_bindings
    }

    /// The case's unique ID.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }
}

fn display_with_arguments(base: &str, arguments: &[TestArgument]) -> String {
    let mut out = base.to_owned();
    swrite!(
        out,
        "({})",
        arguments.iter().map(TestArgument::display).join(", ")
    );
    out
}

/// One invocation of a test case.
#[derive(Debug)]
pub struct Test {
    case: Arc<TestCase>,
    index: usize,
    display_name: String,
    arguments: Vec<TestArgument>,
    skip_reason: Option<String>,
    unique_id: String,
    // Messages written through the test context, in order.
    output: Mutex<String>,
}

impl Test {
    /// The single test of a fact or data row case.
    pub(crate) fn for_case(case: &Arc<TestCase>) -> Self {
        let arguments = match case.kind() {
            TestCaseKind::DataRow { arguments } => arguments.clone(),
            _ => Vec::new(),
        };
        Self::new_impl(
            case,
            0,
            case.display_name().to_owned(),
            arguments,
            case.skip_reason().map(str::to_owned),
        )
    }

    /// The test for a theory data row.
    pub(crate) fn for_row(
        case: &Arc<TestCase>,
        index: usize,
        arguments: Vec<TestArgument>,
        display_name: Option<String>,
        skip_reason: Option<String>,
    ) -> Self {
        let display_name = display_name.unwrap_or_else(|| {
            display_with_arguments(&case.method().qualified_name(), &arguments)
        });
        let skip_reason = skip_reason.or_else(|| case.skip_reason().map(str::to_owned));
        Self::new_impl(case, index, display_name, arguments, skip_reason)
    }

    fn new_impl(
        case: &Arc<TestCase>,
        index: usize,
        display_name: String,
        arguments: Vec<TestArgument>,
        skip_reason: Option<String>,
    ) -> Self {
        Self {
            unique_id: unique_id::for_test(case.unique_id(), index),
            case: case.clone(),
            index,
            display_name,
            arguments,
            skip_reason,
            output: Mutex::new(String::new()),
        }
    }

    /// The case this test belongs to.
    pub fn case(&self) -> &Arc<TestCase> {
        &self.case
    }

    /// The index of this test within its case.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The arguments passed to the test.
    pub fn arguments(&self) -> &[TestArgument] {
        &self.arguments
    }

    /// Why the test is skipped, if it is.
    pub fn skip_reason(&self) -> Option<&str> {
        self.skip_reason.as_deref()
    }

    /// The test's unique ID.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub(crate) fn append_output(&self, line: &str) {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output.push_str(line);
        output.push('\n');
    }

    pub(crate) fn output(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
