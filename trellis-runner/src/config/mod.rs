// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for trellis.
//!
//! Configuration is read from TOML profiles, layered on top of the defaults shipped with the
//! library, and turned into [`ExecutionOptions`] for a run.

mod imp;
mod max_threads;
mod options;

pub use imp::*;
pub use max_threads::*;
pub use options::*;
