// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{errors::MaxParallelThreadsParseError, scheduler::ConcurrencyLimit};
use serde::Deserialize;
use std::{fmt, num::NonZeroUsize, str::FromStr, sync::LazyLock};
use tracing::warn;

/// Gets the number of available CPUs, caching the value.
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Type for the max-parallel-threads config key.
///
/// As an integer, 0 means the number of logical CPUs and a negative value means unlimited.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MaxParallelThreads {
    /// Run as many collections at once as there are logical CPUs.
    #[default]
    NumCpus,

    /// Run at most this many collections at once.
    Count(NonZeroUsize),

    /// Start every collection as soon as it is scheduled.
    Unlimited,
}

impl MaxParallelThreads {
    /// The string form of [`Self::NumCpus`].
    pub const NUM_CPUS: &'static str = "num-cpus";

    /// The string form of [`Self::Unlimited`].
    pub const UNLIMITED: &'static str = "unlimited";

    /// Interprets an integer setting: 0 is the CPU count, negative is unlimited.
    pub fn from_raw(value: i64) -> Self {
        match usize::try_from(value) {
            Ok(0) => Self::NumCpus,
            Ok(n) => Self::Count(NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)),
            Err(_) => Self::Unlimited,
        }
    }

    /// The scheduler limit for this setting, computed at runtime.
    pub fn compute(self) -> ConcurrencyLimit {
        match self {
            Self::NumCpus => ConcurrencyLimit::Limited(
                NonZeroUsize::new(get_num_cpus()).unwrap_or(NonZeroUsize::MIN),
            ),
            Self::Count(n) => ConcurrencyLimit::Limited(n),
            Self::Unlimited => ConcurrencyLimit::Unlimited,
        }
    }
}

impl FromStr for MaxParallelThreads {
    type Err = MaxParallelThreadsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::NUM_CPUS | "default" => Ok(Self::NumCpus),
            Self::UNLIMITED => Ok(Self::Unlimited),
            _ => s
                .parse::<i64>()
                .map(Self::from_raw)
                .map_err(|_| MaxParallelThreadsParseError::new(s)),
        }
    }
}

impl fmt::Display for MaxParallelThreads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NumCpus => write!(f, "{}", Self::NUM_CPUS),
            Self::Count(n) => write!(f, "{n}"),
            Self::Unlimited => write!(f, "{}", Self::UNLIMITED),
        }
    }
}

impl<'de> Deserialize<'de> for MaxParallelThreads {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = MaxParallelThreads;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(
                    formatter,
                    "an integer, the string \"{}\" or the string \"{}\"",
                    MaxParallelThreads::NUM_CPUS,
                    MaxParallelThreads::UNLIMITED,
                )
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v {
                    MaxParallelThreads::NUM_CPUS => Ok(MaxParallelThreads::NumCpus),
                    MaxParallelThreads::UNLIMITED => Ok(MaxParallelThreads::Unlimited),
                    _ => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    )),
                }
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(MaxParallelThreads::from_raw(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(MaxParallelThreads::from_raw(
                    i64::try_from(v).unwrap_or(i64::MAX),
                ))
            }
        }

        deserializer.deserialize_any(V)
    }
}
