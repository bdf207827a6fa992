// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for trellis, a hierarchical test execution engine.
//!
//! A run takes a set of discovered [test cases](list::TestCase), organized as assembly →
//! collection → class → method → case, and runs them with
//! [`TestAssemblyRunner`](runner::TestAssemblyRunner). Collections may run in parallel on a
//! [bounded pool of threads](scheduler::MaxConcurrencyScheduler); everything within a collection
//! runs sequentially. Every step is reported as a [`Message`](trellis_metadata::Message) through
//! a [message bus](message_bus) to a single [sink](reporter::MessageSink).
//!
//! Failures are isolated at the lowest level that can report them: a failing test, fixture,
//! orderer or sink never aborts the run.

pub mod aggregator;
pub mod config;
pub mod errors;
pub mod fixture;
pub mod list;
pub mod message_bus;
pub mod order;
pub mod output;
pub mod reporter;
pub mod runner;
pub mod scheduler;
pub mod time;
