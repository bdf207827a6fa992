// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The hierarchical runner chain.
//!
//! [`TestAssemblyRunner`] is the entry point. Below it, one runner per level (collection, class,
//! method, case and test) emits the level's lifecycle messages and delegates to the level below.
//! Summaries are added up on the way back.

mod assembly;
mod case;
mod class;
mod collection;
mod context;
mod lifecycle;
mod method;

pub use assembly::TestAssemblyRunner;
use case::CaseRunner;
use class::ClassRunner;
use collection::CollectionRunner;
pub(crate) use context::{AssemblyContext, ClassContext, CollectionContext};
pub use context::TestContext;
use method::MethodRunner;
use test::TestRunner;
