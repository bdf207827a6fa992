// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::RunSummary;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::BTreeMap, fmt, time::Duration};

/// A single lifecycle event emitted by the engine.
///
/// A message carries the unique IDs of the node it is about and of every ancestor of that node,
/// so the structure of a run can be reconstructed from a flat stream of messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Message {
    /// The node this message is about.
    pub ids: NodeIds,

    /// What happened.
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl Message {
    /// Creates a new message.
    pub fn new(ids: NodeIds, kind: MessageKind) -> Self {
        Self { ids, kind }
    }

    /// Returns true if this message reports a failed test.
    pub fn is_test_failure(&self) -> bool {
        matches!(self.kind, MessageKind::TestFailed { .. })
    }

    /// If this is a starting, finished or cleanup failure message for a node, returns the level
    /// and phase it describes.
    pub fn lifecycle(&self) -> Option<(NodeLevel, LifecyclePhase)> {
        self.kind.lifecycle()
    }

    /// If this is a finished message for a node, returns the summary it carries.
    pub fn summary(&self) -> Option<&RunSummary> {
        match &self.kind {
            MessageKind::AssemblyFinished { summary }
            | MessageKind::CollectionFinished { summary }
            | MessageKind::ClassFinished { summary }
            | MessageKind::MethodFinished { summary }
            | MessageKind::CaseFinished { summary } => Some(summary),
            _ => None,
        }
    }
}

/// The unique IDs of a node and all of its ancestors.
///
/// Only the assembly ID is always present. The deepest ID that is set identifies the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeIds {
    /// The assembly's unique ID.
    pub assembly: String,

    /// The collection's unique ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    /// The class's unique ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// The method's unique ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// The test case's unique ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case: Option<String>,

    /// The test's unique ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
}

impl NodeIds {
    /// IDs for an assembly.
    pub fn for_assembly(assembly: impl Into<String>) -> Self {
        Self {
            assembly: assembly.into(),
            ..Self::default()
        }
    }

    /// Returns these IDs extended with a collection ID.
    pub fn with_collection(&self, id: impl Into<String>) -> Self {
        Self {
            collection: Some(id.into()),
            ..self.clone()
        }
    }

    /// Returns these IDs extended with a class ID.
    pub fn with_class(&self, id: impl Into<String>) -> Self {
        Self {
            class: Some(id.into()),
            ..self.clone()
        }
    }

    /// Returns these IDs extended with a method ID.
    pub fn with_method(&self, id: impl Into<String>) -> Self {
        Self {
            method: Some(id.into()),
            ..self.clone()
        }
    }

    /// Returns these IDs extended with a test case ID.
    pub fn with_test_case(&self, id: impl Into<String>) -> Self {
        Self {
            test_case: Some(id.into()),
            ..self.clone()
        }
    }

    /// Returns these IDs extended with a test ID.
    pub fn with_test(&self, id: impl Into<String>) -> Self {
        Self {
            test: Some(id.into()),
            ..self.clone()
        }
    }

    /// The level of the deepest ID that is set.
    pub fn level(&self) -> NodeLevel {
        if self.test.is_some() {
            NodeLevel::Test
        } else if self.test_case.is_some() {
            NodeLevel::TestCase
        } else if self.method.is_some() {
            NodeLevel::Method
        } else if self.class.is_some() {
            NodeLevel::Class
        } else if self.collection.is_some() {
            NodeLevel::Collection
        } else {
            NodeLevel::Assembly
        }
    }

    /// The ID of the node these IDs describe.
    pub fn node_id(&self) -> &str {
        self.id_at(self.level()).unwrap_or(&self.assembly)
    }

    /// The ID at the given level, if set.
    pub fn id_at(&self, level: NodeLevel) -> Option<&str> {
        match level {
            NodeLevel::Assembly => Some(&self.assembly),
            NodeLevel::Collection => self.collection.as_deref(),
            NodeLevel::Class => self.class.as_deref(),
            NodeLevel::Method => self.method.as_deref(),
            NodeLevel::TestCase => self.test_case.as_deref(),
            NodeLevel::Test => self.test.as_deref(),
        }
    }

    /// The IDs of the parent node, or `None` for an assembly.
    pub fn parent(&self) -> Option<NodeIds> {
        let mut parent = self.clone();
        match self.level() {
            NodeLevel::Assembly => return None,
            NodeLevel::Collection => parent.collection = None,
            NodeLevel::Class => parent.class = None,
            NodeLevel::Method => parent.method = None,
            NodeLevel::TestCase => parent.test_case = None,
            NodeLevel::Test => parent.test = None,
        }
        Some(parent)
    }
}

/// A level in the test hierarchy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeLevel {
    /// An assembly.
    Assembly,
    /// A test collection.
    Collection,
    /// A test class.
    Class,
    /// A test method.
    Method,
    /// A test case.
    TestCase,
    /// A single test.
    Test,
}

impl fmt::Display for NodeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assembly => write!(f, "assembly"),
            Self::Collection => write!(f, "collection"),
            Self::Class => write!(f, "class"),
            Self::Method => write!(f, "method"),
            Self::TestCase => write!(f, "test case"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// The phase of a node's lifecycle that a message describes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// The node started.
    Starting,
    /// The node's finishing phase failed.
    CleanupFailure,
    /// The node finished.
    Finished,
}

/// The kinds of messages the engine emits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageKind {
    /// An assembly started running.
    #[serde(rename_all = "kebab-case")]
    AssemblyStarting {
        /// The assembly's name.
        assembly_name: String,

        /// The path to the assembly, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assembly_path: Option<String>,

        /// The path to the assembly's configuration file, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config_file_path: Option<String>,

        /// A description of the environment the assembly runs in.
        test_environment: String,

        /// The time at which the assembly started.
        start_time: DateTime<FixedOffset>,
    },

    /// An assembly finished running.
    AssemblyFinished {
        /// Everything that ran in the assembly.
        summary: RunSummary,
    },

    /// An assembly's finishing phase failed.
    AssemblyCleanupFailure {
        /// The failure.
        error: ErrorMetadata,
    },

    /// A collection started running.
    #[serde(rename_all = "kebab-case")]
    CollectionStarting {
        /// The collection's display name.
        display_name: String,

        /// The name of the collection definition type, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        definition: Option<String>,
    },

    /// A collection finished running.
    CollectionFinished {
        /// Everything that ran in the collection.
        summary: RunSummary,
    },

    /// A collection's finishing phase failed.
    CollectionCleanupFailure {
        /// The failure.
        error: ErrorMetadata,
    },

    /// A class started running.
    #[serde(rename_all = "kebab-case")]
    ClassStarting {
        /// The class name.
        class_name: String,
    },

    /// A class finished running.
    ClassFinished {
        /// Everything that ran in the class.
        summary: RunSummary,
    },

    /// A class's finishing phase failed.
    ClassCleanupFailure {
        /// The failure.
        error: ErrorMetadata,
    },

    /// A method started running.
    #[serde(rename_all = "kebab-case")]
    MethodStarting {
        /// The method name.
        method_name: String,
    },

    /// A method finished running.
    MethodFinished {
        /// Everything that ran in the method.
        summary: RunSummary,
    },

    /// A method's finishing phase failed.
    MethodCleanupFailure {
        /// The failure.
        error: ErrorMetadata,
    },

    /// A test case started running.
    #[serde(rename_all = "kebab-case")]
    CaseStarting {
        /// The test case's display name.
        display_name: String,

        /// The reason the test case is skipped, if it is.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<String>,

        /// The test case's traits.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        traits: BTreeMap<SmolStr, Vec<SmolStr>>,
    },

    /// A test case finished running.
    CaseFinished {
        /// Everything that ran in the test case.
        summary: RunSummary,
    },

    /// A test case's finishing phase failed.
    CaseCleanupFailure {
        /// The failure.
        error: ErrorMetadata,
    },

    /// A test started running.
    #[serde(rename_all = "kebab-case")]
    TestStarting {
        /// The test's display name.
        display_name: String,
    },

    /// The test class instance for a test is about to be constructed.
    TestClassConstructionStarting,

    /// The test class instance for a test was constructed (or construction failed).
    TestClassConstructionFinished,

    /// A before-test hook is about to run.
    BeforeTestStarting {
        /// The hook's name.
        hook: String,
    },

    /// A before-test hook finished.
    BeforeTestFinished {
        /// The hook's name.
        hook: String,
    },

    /// An after-test hook is about to run.
    AfterTestStarting {
        /// The hook's name.
        hook: String,
    },

    /// An after-test hook finished.
    AfterTestFinished {
        /// The hook's name.
        hook: String,
    },

    /// The test class instance for a test is about to be torn down.
    TestClassDisposeStarting,

    /// The test class instance for a test was torn down.
    TestClassDisposeFinished,

    /// A test wrote a line of output.
    TestOutput {
        /// The output.
        output: String,
    },

    /// A test passed.
    #[serde(rename_all = "kebab-case")]
    TestPassed {
        /// The time spent running the test.
        #[serde(with = "humantime_serde")]
        execution_time: Duration,

        /// Output captured while running the test.
        #[serde(default)]
        output: String,
    },

    /// A test failed.
    #[serde(rename_all = "kebab-case")]
    TestFailed {
        /// The time spent running the test.
        #[serde(with = "humantime_serde")]
        execution_time: Duration,

        /// Output captured while running the test.
        #[serde(default)]
        output: String,

        /// Why the test failed.
        error: ErrorMetadata,
    },

    /// A test was skipped.
    TestSkipped {
        /// The reason the test was skipped.
        reason: String,
    },

    /// A test finished.
    #[serde(rename_all = "kebab-case")]
    TestFinished {
        /// The time spent running the test.
        #[serde(with = "humantime_serde")]
        execution_time: Duration,

        /// Output captured while running the test.
        #[serde(default)]
        output: String,
    },

    /// A test's finishing phase failed.
    TestCleanupFailure {
        /// The failure.
        error: ErrorMetadata,
    },

    /// A diagnostic message from the engine or from an extension (fixture, orderer).
    Diagnostic {
        /// The message.
        message: String,
    },

    /// An error that is not attributable to a single test, such as a panicking message sink.
    Error {
        /// The error.
        error: ErrorMetadata,
    },
}

impl MessageKind {
    /// The kebab-case name of this message kind, as used in serialized form.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AssemblyStarting { .. } => "assembly-starting",
            Self::AssemblyFinished { .. } => "assembly-finished",
            Self::AssemblyCleanupFailure { .. } => "assembly-cleanup-failure",
            Self::CollectionStarting { .. } => "collection-starting",
            Self::CollectionFinished { .. } => "collection-finished",
            Self::CollectionCleanupFailure { .. } => "collection-cleanup-failure",
            Self::ClassStarting { .. } => "class-starting",
            Self::ClassFinished { .. } => "class-finished",
            Self::ClassCleanupFailure { .. } => "class-cleanup-failure",
            Self::MethodStarting { .. } => "method-starting",
            Self::MethodFinished { .. } => "method-finished",
            Self::MethodCleanupFailure { .. } => "method-cleanup-failure",
            Self::CaseStarting { .. } => "case-starting",
            Self::CaseFinished { .. } => "case-finished",
            Self::CaseCleanupFailure { .. } => "case-cleanup-failure",
            Self::TestStarting { .. } => "test-starting",
            Self::TestClassConstructionStarting => "test-class-construction-starting",
            Self::TestClassConstructionFinished => "test-class-construction-finished",
            Self::BeforeTestStarting { .. } => "before-test-starting",
            Self::BeforeTestFinished { .. } => "before-test-finished",
            Self::AfterTestStarting { .. } => "after-test-starting",
            Self::AfterTestFinished { .. } => "after-test-finished",
            Self::TestClassDisposeStarting => "test-class-dispose-starting",
            Self::TestClassDisposeFinished => "test-class-dispose-finished",
            Self::TestOutput { .. } => "test-output",
            Self::TestPassed { .. } => "test-passed",
            Self::TestFailed { .. } => "test-failed",
            Self::TestSkipped { .. } => "test-skipped",
            Self::TestFinished { .. } => "test-finished",
            Self::TestCleanupFailure { .. } => "test-cleanup-failure",
            Self::Diagnostic { .. } => "diagnostic",
            Self::Error { .. } => "error",
        }
    }

    /// If this message describes the start, finish or cleanup failure of a node, returns the
    /// node's level and the phase.
    pub fn lifecycle(&self) -> Option<(NodeLevel, LifecyclePhase)> {
        use LifecyclePhase::*;

        let res = match self {
            Self::AssemblyStarting { .. } => (NodeLevel::Assembly, Starting),
            Self::AssemblyFinished { .. } => (NodeLevel::Assembly, Finished),
            Self::AssemblyCleanupFailure { .. } => (NodeLevel::Assembly, CleanupFailure),
            Self::CollectionStarting { .. } => (NodeLevel::Collection, Starting),
            Self::CollectionFinished { .. } => (NodeLevel::Collection, Finished),
            Self::CollectionCleanupFailure { .. } => (NodeLevel::Collection, CleanupFailure),
            Self::ClassStarting { .. } => (NodeLevel::Class, Starting),
            Self::ClassFinished { .. } => (NodeLevel::Class, Finished),
            Self::ClassCleanupFailure { .. } => (NodeLevel::Class, CleanupFailure),
            Self::MethodStarting { .. } => (NodeLevel::Method, Starting),
            Self::MethodFinished { .. } => (NodeLevel::Method, Finished),
            Self::MethodCleanupFailure { .. } => (NodeLevel::Method, CleanupFailure),
            Self::CaseStarting { .. } => (NodeLevel::TestCase, Starting),
            Self::CaseFinished { .. } => (NodeLevel::TestCase, Finished),
            Self::CaseCleanupFailure { .. } => (NodeLevel::TestCase, CleanupFailure),
            Self::TestStarting { .. } => (NodeLevel::Test, Starting),
            Self::TestFinished { .. } => (NodeLevel::Test, Finished),
            Self::TestCleanupFailure { .. } => (NodeLevel::Test, CleanupFailure),
            _ => return None,
        };
        Some(res)
    }
}

/// A flattened tree of errors.
///
/// The four vectors are parallel: entry `i` describes one error. `exception_parent_indices[i]` is
/// the index of the error that contains it, or -1 for the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ErrorMetadata {
    /// The type of each error, if known.
    pub exception_types: Vec<Option<String>>,

    /// The message of each error.
    pub messages: Vec<String>,

    /// The stack trace of each error, if one was captured.
    pub stack_traces: Vec<Option<String>>,

    /// The index of each error's parent, or -1 for the root.
    pub exception_parent_indices: Vec<i32>,
}

impl ErrorMetadata {
    /// The number of errors in the tree.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The message of the root error.
    pub fn root_message(&self) -> Option<&str> {
        self.messages.first().map(|s| s.as_str())
    }

    /// The type of the root error.
    pub fn root_type(&self) -> Option<&str> {
        self.exception_types.first().and_then(|t| t.as_deref())
    }

    /// Appends an error whose parent is at `parent_index` (-1 for a root), returning its index.
    pub fn push(
        &mut self,
        exception_type: Option<String>,
        message: String,
        stack_trace: Option<String>,
        parent_index: i32,
    ) -> i32 {
        let index = self.messages.len() as i32;
        self.exception_types.push(exception_type);
        self.messages.push(message);
        self.stack_traces.push(stack_trace);
        self.exception_parent_indices.push(parent_index);
        index
    }
}
