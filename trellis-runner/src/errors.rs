// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by trellis.

use crate::{config::MaxParallelThreads, fixture::FixtureKind, order::OrdererKind};
use camino::Utf8PathBuf;
use config::ConfigError;
use std::io;
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse trellis config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// An error which indicates that a profile was requested but not known to trellis.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurs while parsing a [`MaxParallelThreads`] value from a string.
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized value for max-parallel-threads: {input}\n(expected an integer, {:?} or {:?})",
    MaxParallelThreads::NUM_CPUS,
    MaxParallelThreads::UNLIMITED,
)]
pub struct MaxParallelThreadsParseError {
    input: String,
}

impl MaxParallelThreadsParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while spawning one of the engine's threads.
#[derive(Debug, Error)]
#[error("failed to spawn thread `{thread_name}`")]
pub struct SpawnError {
    thread_name: String,
    #[source]
    err: io::Error,
}

impl SpawnError {
    pub(crate) fn new(thread_name: impl Into<String>, err: io::Error) -> Self {
        Self {
            thread_name: thread_name.into(),
            err,
        }
    }
}

/// An error returned by [`MaxConcurrencyScheduler::shutdown`](crate::scheduler::MaxConcurrencyScheduler::shutdown).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedulerShutdownError {
    /// The scheduler was already shut down.
    #[error("scheduler was already shut down")]
    AlreadyShutDown,
}

/// An error returned while shutting down a message bus.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageBusShutdownError {
    /// The bus was already shut down.
    #[error("message bus was already shut down")]
    AlreadyShutDown,

    /// The dispatch thread panicked outside of message delivery.
    #[error("message bus dispatch thread panicked: {message}")]
    DispatcherPanicked {
        /// The panic message.
        message: String,
    },
}

/// An error that occurs while constructing a fixture or a test class instance.
///
/// These errors are captured into the aggregator of the level that owns the fixture, so every
/// test under that level fails with them.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FixtureConstructionError {
    /// The type does not define exactly one constructor.
    #[error("{kind} type '{type_name}' may only define a single public constructor.")]
    MultipleConstructors {
        /// What was being constructed.
        kind: FixtureKind,
        /// The type being constructed.
        type_name: String,
    },

    /// One or more constructor parameters could not be resolved.
    #[error(
        "{kind} type '{type_name}' had one or more unresolved constructor arguments: {}",
        .arguments.join(", ")
    )]
    UnresolvedArguments {
        /// What was being constructed.
        kind: FixtureKind,
        /// The type being constructed.
        type_name: String,
        /// The unresolved parameters, formatted as `Type name`.
        arguments: Vec<String>,
    },

    /// The constructor itself failed. The failure is attached as an inner error.
    #[error("{kind} type '{type_name}' threw in its constructor")]
    ConstructorFailed {
        /// What was being constructed.
        kind: FixtureKind,
        /// The type being constructed.
        type_name: String,
    },
}

/// An error that occurs while resolving or running a custom orderer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum OrdererError {
    /// No orderer with this name is registered.
    #[error("unknown {kind} orderer `{name}` (known orderers: {})", .known.join(", "))]
    Unknown {
        /// The kind of orderer.
        kind: OrdererKind,
        /// The requested name.
        name: String,
        /// The registered names.
        known: Vec<String>,
    },

    /// The orderer returned something other than a permutation of its input.
    #[error(
        "{kind} orderer `{name}` returned {actual} items that are not a permutation of its {expected} inputs"
    )]
    NotAPermutation {
        /// The kind of orderer.
        kind: OrdererKind,
        /// The orderer's name.
        name: String,
        /// The number of items passed in.
        expected: usize,
        /// The number of items returned.
        actual: usize,
    },
}

/// An error that occurs while enumerating theory data at run time.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TheoryDataError {
    /// The data source produced no rows.
    #[error("No data found for {test_method}")]
    NoData {
        /// The method, as `Class.method`.
        test_method: String,
    },
}

/// An error that aborts a run.
///
/// Only failures of the engine's own lifecycle are reported this way. Failures of tests,
/// fixtures, orderers and sinks are reported through messages instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// An engine thread could not be spawned.
    #[error("error spawning engine thread")]
    Spawn(#[from] SpawnError),

    /// The message bus could not be shut down.
    #[error("error shutting down the message bus")]
    BusShutdown(#[from] MessageBusShutdownError),
}
