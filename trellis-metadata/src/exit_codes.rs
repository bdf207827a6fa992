// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for hosts driving a trellis run.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum TrellisExitCode {}

impl TrellisExitCode {
    /// No errors occurred and every test that ran passed.
    pub const OK: i32 = 0;

    /// No tests were run, but no other errors occurred.
    pub const NO_TESTS_RUN: i32 = 4;

    /// One or more tests failed.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// The engine could not be set up, for example because its configuration failed to parse.
    pub const SETUP_ERROR: i32 = 96;

    /// The engine's own lifecycle failed (a worker thread could not be spawned, or the message
    /// bus was shut down twice).
    pub const ENGINE_ERROR: i32 = 97;
}
