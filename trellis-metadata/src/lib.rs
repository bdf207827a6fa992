// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable records produced by the trellis test engine.
//!
//! The engine communicates with its host exclusively through [`Message`] values. They are plain
//! data, so they can be sent across threads, written to a socket or persisted without reference
//! to the engine's in-memory structures.

mod exit_codes;
mod messages;
mod summary;

pub use exit_codes::*;
pub use messages::*;
pub use summary::*;
