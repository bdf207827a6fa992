// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Failure isolation.
//!
//! Every level of a run owns an [`ExceptionAggregator`]. Operations that may fail (user code,
//! fixture construction, teardown) are run through the aggregator, which captures errors and
//! panics instead of propagating them. The runner then decides, at well-defined points, whether
//! the captured failures turn into a failed test or a cleanup failure message.

mod captured;
mod imp;

pub(crate) use captured::panic_message;
pub use captured::*;
pub use imp::*;
