// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test hierarchy, as supplied by discovery.
//!
//! The main data structures in this module are:
//! * [`TestAssembly`], [`TestCollection`], [`TestClass`] and [`TestMethod`] for the hierarchy
//! * [`TestCase`] for the unit of scheduling
//! * [`Test`] for a single invocation of a test case

mod model;
pub mod unique_id;

pub use model::*;
