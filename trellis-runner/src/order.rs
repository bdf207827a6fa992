// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordering of collections and test cases.
//!
//! Orderers are looked up by name in an [`OrdererRegistry`]. Whatever goes wrong with a custom
//! orderer (it is unknown, it fails, it panics, or it returns something other than a permutation
//! of its input) is reported as a diagnostic message, and the default orderer is used instead.

use crate::{
    aggregator::{CapturedError, TestResult},
    errors::OrdererError,
    list::{TestCase, TestCollection},
    message_bus::DiagnosticSender,
};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::warn;
use xxhash_rust::xxh64::xxh64;

/// What an orderer orders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrdererKind {
    /// Test collections.
    Collection,

    /// Test cases within a class.
    Case,
}

impl fmt::Display for OrdererKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection => write!(f, "collection"),
            Self::Case => write!(f, "case"),
        }
    }
}

/// Orders the collections of an assembly.
pub trait TestCollectionOrderer: Send + Sync {
    /// Returns a permutation of `collections`.
    fn order_collections(
        &self,
        collections: Vec<Arc<TestCollection>>,
    ) -> TestResult<Vec<Arc<TestCollection>>>;
}

/// Orders the test cases of a class.
pub trait TestCaseOrderer: Send + Sync {
    /// Returns a permutation of `cases`.
    fn order_cases(&self, cases: Vec<Arc<TestCase>>) -> TestResult<Vec<Arc<TestCase>>>;
}

/// Something with a unique ID that can be ordered.
trait Orderable {
    fn unique_id(&self) -> &str;
}

impl Orderable for TestCollection {
    fn unique_id(&self) -> &str {
        TestCollection::unique_id(self)
    }
}

impl Orderable for TestCase {
    fn unique_id(&self) -> &str {
        TestCase::unique_id(self)
    }
}

/// Sorts by the hash of the unique ID, falling back to a shuffle if sorting panics.
fn default_order<T: Orderable>(
    kind: OrdererKind,
    mut items: Vec<Arc<T>>,
    diagnostics: &DiagnosticSender,
) -> Vec<Arc<T>> {
    let sorted = catch_unwind(AssertUnwindSafe(|| {
        items.sort_by_cached_key(|item| {
            let id = item.unique_id();
            (xxh64(id.as_bytes(), 0), id.to_owned())
        })
    }));
    if let Err(payload) = sorted {
        let error = CapturedError::from_panic(payload);
        warn!("default {kind} orderer failed to sort, shuffling instead: {error}");
        items.shuffle(&mut rand::rng());
        diagnostics.send(format!(
            "default {kind} orderer failed to sort ({error}); using a random order"
        ));
    }
    items
}

/// The default orderer: a stable order based on the hash of each unique ID.
#[derive(Clone, Debug)]
pub struct DefaultOrderer {
    diagnostics: DiagnosticSender,
}

impl DefaultOrderer {
    /// Creates the default orderer.
    pub fn new(diagnostics: DiagnosticSender) -> Self {
        Self { diagnostics }
    }
}

impl TestCollectionOrderer for DefaultOrderer {
    fn order_collections(
        &self,
        collections: Vec<Arc<TestCollection>>,
    ) -> TestResult<Vec<Arc<TestCollection>>> {
        Ok(default_order(
            OrdererKind::Collection,
            collections,
            &self.diagnostics,
        ))
    }
}

impl TestCaseOrderer for DefaultOrderer {
    fn order_cases(&self, cases: Vec<Arc<TestCase>>) -> TestResult<Vec<Arc<TestCase>>> {
        Ok(default_order(OrdererKind::Case, cases, &self.diagnostics))
    }
}

/// Keeps items in the order they were discovered.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeclarationOrderer;

impl TestCollectionOrderer for DeclarationOrderer {
    fn order_collections(
        &self,
        collections: Vec<Arc<TestCollection>>,
    ) -> TestResult<Vec<Arc<TestCollection>>> {
        Ok(collections)
    }
}

impl TestCaseOrderer for DeclarationOrderer {
    fn order_cases(&self, cases: Vec<Arc<TestCase>>) -> TestResult<Vec<Arc<TestCase>>> {
        Ok(cases)
    }
}

/// Shuffles items into a different order on every run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomOrderer;

impl TestCollectionOrderer for RandomOrderer {
    fn order_collections(
        &self,
        mut collections: Vec<Arc<TestCollection>>,
    ) -> TestResult<Vec<Arc<TestCollection>>> {
        collections.shuffle(&mut rand::rng());
        Ok(collections)
    }
}

impl TestCaseOrderer for RandomOrderer {
    fn order_cases(&self, mut cases: Vec<Arc<TestCase>>) -> TestResult<Vec<Arc<TestCase>>> {
        cases.shuffle(&mut rand::rng());
        Ok(cases)
    }
}

type Factory<O> = Arc<dyn Fn(&DiagnosticSender) -> TestResult<Box<O>> + Send + Sync>;
type CollectionOrdererFactory = Factory<dyn TestCollectionOrderer>;
type CaseOrdererFactory = Factory<dyn TestCaseOrderer>;

/// Named orderers.
///
/// Every registry knows the built-in orderers `default`, `declaration` and `random`.
#[derive(Clone, Debug)]
pub struct OrdererRegistry {
    collection: DebugIgnore<IndexMap<String, CollectionOrdererFactory>>,
    case: DebugIgnore<IndexMap<String, CaseOrdererFactory>>,
}

impl OrdererRegistry {
    /// The name of the default orderer.
    pub const DEFAULT: &'static str = "default";

    /// The name of the orderer that keeps declaration order.
    pub const DECLARATION: &'static str = "declaration";

    /// The name of the orderer that shuffles.
    pub const RANDOM: &'static str = "random";

    /// Creates a registry with the built-in orderers.
    pub fn new() -> Self {
        let mut registry = Self {
            collection: DebugIgnore(IndexMap::new()),
            case: DebugIgnore(IndexMap::new()),
        };
        registry
            .register_collection_orderer(Self::DEFAULT, |diagnostics| {
                Ok(Box::new(DefaultOrderer::new(diagnostics.clone())))
            })
            .register_collection_orderer(Self::DECLARATION, |_| Ok(Box::new(DeclarationOrderer)))
            .register_collection_orderer(Self::RANDOM, |_| Ok(Box::new(RandomOrderer)))
            .register_case_orderer(Self::DEFAULT, |diagnostics| {
                Ok(Box::new(DefaultOrderer::new(diagnostics.clone())))
            })
            .register_case_orderer(Self::DECLARATION, |_| Ok(Box::new(DeclarationOrderer)))
            .register_case_orderer(Self::RANDOM, |_| Ok(Box::new(RandomOrderer)));
        registry
    }

    /// Registers a collection orderer, replacing any orderer with the same name.
    pub fn register_collection_orderer(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&DiagnosticSender) -> TestResult<Box<dyn TestCollectionOrderer>>
        + Send
        + Sync
        + 'static,
    ) -> &mut Self {
        self.collection
            .insert(name.into(), Arc::new(factory) as CollectionOrdererFactory);
        self
    }

    /// Registers a case orderer, replacing any orderer with the same name.
    pub fn register_case_orderer(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&DiagnosticSender) -> TestResult<Box<dyn TestCaseOrderer>>
        + Send
        + Sync
        + 'static,
    ) -> &mut Self {
        self.case
            .insert(name.into(), Arc::new(factory) as CaseOrdererFactory);
        self
    }

    /// Orders collections with the named orderer, or the default orderer if `name` is `None`.
    pub(crate) fn order_collections(
        &self,
        name: Option<&str>,
        collections: Vec<Arc<TestCollection>>,
        diagnostics: &DiagnosticSender,
    ) -> Vec<Arc<TestCollection>> {
        guarded_order(
            OrdererKind::Collection,
            name,
            &self.collection,
            collections,
            diagnostics,
            |orderer, items| orderer.order_collections(items),
        )
    }

    /// Orders cases with the named orderer, or the default orderer if `name` is `None`.
    pub(crate) fn order_cases(
        &self,
        name: Option<&str>,
        cases: Vec<Arc<TestCase>>,
        diagnostics: &DiagnosticSender,
    ) -> Vec<Arc<TestCase>> {
        guarded_order(
            OrdererKind::Case,
            name,
            &self.case,
            cases,
            diagnostics,
            |orderer, items| orderer.order_cases(items),
        )
    }
}

impl Default for OrdererRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn guarded_order<O, T>(
    kind: OrdererKind,
    name: Option<&str>,
    factories: &IndexMap<String, Factory<O>>,
    items: Vec<Arc<T>>,
    diagnostics: &DiagnosticSender,
    order: impl FnOnce(&O, Vec<Arc<T>>) -> TestResult<Vec<Arc<T>>>,
) -> Vec<Arc<T>>
where
    O: ?Sized,
    T: Orderable,
{
    let name = name.unwrap_or(OrdererRegistry::DEFAULT);
    let fall_back = |items: Vec<Arc<T>>, reason: String| {
        warn!("{reason}; falling back to the default {kind} orderer");
        diagnostics.send(format!(
            "{reason}; falling back to the default {kind} orderer"
        ));
        default_order(kind, items, diagnostics)
    };

    let Some(factory) = factories.get(name) else {
        let err = OrdererError::Unknown {
            kind,
            name: name.to_owned(),
            known: factories.keys().cloned().collect(),
        };
        return fall_back(items, err.to_string());
    };

    let orderer = match catch_unwind(AssertUnwindSafe(|| factory(diagnostics))) {
        Ok(Ok(orderer)) => orderer,
        Ok(Err(err)) => {
            return fall_back(items, format!("failed to create {kind} orderer `{name}`: {err}"));
        }
        Err(payload) => {
            let err = CapturedError::from_panic(payload);
            return fall_back(items, format!("failed to create {kind} orderer `{name}`: {err}"));
        }
    };

    let ordered = match catch_unwind(AssertUnwindSafe(|| order(&*orderer, items.clone()))) {
        Ok(Ok(ordered)) => ordered,
        Ok(Err(err)) => {
            return fall_back(items, format!("{kind} orderer `{name}` failed: {err}"));
        }
        Err(payload) => {
            let err = CapturedError::from_panic(payload);
            return fall_back(items, format!("{kind} orderer `{name}` failed: {err}"));
        }
    };

    if !is_permutation(&items, &ordered) {
        let err = OrdererError::NotAPermutation {
            kind,
            name: name.to_owned(),
            expected: items.len(),
            actual: ordered.len(),
        };
        return fall_back(items, err.to_string());
    }

    ordered
}

fn is_permutation<T: Orderable>(input: &[Arc<T>], output: &[Arc<T>]) -> bool {
    if input.len() != output.len() {
        return false;
    }
    let mut input_ids: Vec<_> = input.iter().map(|item| item.unique_id()).collect();
    let mut output_ids: Vec<_> = output.iter().map(|item| item.unique_id()).collect();
    input_ids.sort_unstable();
    output_ids.sort_unstable();
    input_ids == output_ids
}
