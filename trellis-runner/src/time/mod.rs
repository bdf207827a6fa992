// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time tracking for runs and individual operations.

mod stopwatch;
mod timer;

pub(crate) use stopwatch::*;
pub use timer::*;
