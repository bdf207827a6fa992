// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ExecutionOptions, MaxParallelThreads};
use crate::{
    errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound},
    message_bus::MessageBusKind,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::collections::HashMap;

/// Overall configuration for trellis.
///
/// This is the root data structure for trellis configuration. Run settings are managed through
/// [profiles](TrellisProfile), obtained through the [`profile`](Self::profile) method.
#[derive(Clone, Debug)]
pub struct TrellisConfig {
    inner: TrellisConfigImpl,
}

impl TrellisConfig {
    /// The default location of the config within a directory: `.config/trellis.toml`.
    pub const CONFIG_PATH: &'static str = ".config/trellis.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from the given file, or if not specified from `.config/trellis.toml` in
    /// `root`.
    ///
    /// If no config file is specified and `root` doesn't have `.config/trellis.toml`, uses the
    /// default config options.
    pub fn from_sources(
        root: impl AsRef<Utf8Path>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = root.as_ref().join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let inner = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(config_file, kind))?;
        Ok(Self { inner })
    }

    /// Parses config from a TOML string layered on top of the defaults.
    pub fn from_toml_str(
        name: impl Into<Utf8PathBuf>,
        contents: &str,
    ) -> Result<Self, ConfigParseError> {
        let builder =
            Self::make_default_config().add_source(File::from_str(contents, FileFormat::Toml));
        let inner = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(name, kind))?;
        Ok(Self { inner })
    }

    /// Returns the default trellis config.
    pub fn default_config() -> Self {
        let config = Self::make_default_config()
            .build()
            .expect("default config is always valid");

        let inner = config
            .try_deserialize()
            .expect("default config is always valid");
        Self { inner }
    }

    /// Returns the profile with the given name, or an error if a profile was specified but not
    /// found.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<TrellisProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = match name {
            Self::DEFAULT_PROFILE => None,
            other => Some(self.inner.profiles.other.get(other).ok_or_else(|| {
                ProfileNotFound::new(name, self.all_profiles())
            })?),
        };

        Ok(TrellisProfile {
            name: name.to_owned(),
            default_profile: &self.inner.profiles.default,
            custom_profile,
        })
    }

    fn all_profiles(&self) -> impl Iterator<Item = &str> {
        std::iter::once(Self::DEFAULT_PROFILE)
            .chain(self.inner.profiles.other.keys().map(|key| key.as_str()))
    }

    // ---
    // Helper methods
    // ---

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<TrellisConfigImpl, ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|err| ConfigParseErrorKind::BuildError(Box::new(err)))?;

        serde_path_to_error::deserialize(config)
            .map_err(|err| ConfigParseErrorKind::DeserializeError(Box::new(err)))
    }
}

/// A configuration profile. Settings not present in a custom profile are inherited from the
/// default profile.
///
/// Returned by [`TrellisConfig::profile`].
#[derive(Clone, Debug)]
pub struct TrellisProfile<'cfg> {
    name: String,
    default_profile: &'cfg ProfileImpl,
    custom_profile: Option<&'cfg ProfileImpl>,
}

impl TrellisProfile<'_> {
    /// The name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether parallelization across collections is disabled, if configured.
    pub fn disable_parallelization(&self) -> Option<bool> {
        self.custom_profile
            .and_then(|profile| profile.disable_parallelization)
            .or(self.default_profile.disable_parallelization)
    }

    /// The maximum number of collections in flight, if configured.
    pub fn max_parallel_threads(&self) -> Option<MaxParallelThreads> {
        self.custom_profile
            .and_then(|profile| profile.max_parallel_threads)
            .or(self.default_profile.max_parallel_threads)
    }

    /// Whether the run stops after the first failed test.
    pub fn stop_on_fail(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.stop_on_fail)
            .or(self.default_profile.stop_on_fail)
            .unwrap_or(false)
    }

    /// How messages are delivered to the reporter.
    pub fn message_bus(&self) -> MessageBusKind {
        self.custom_profile
            .and_then(|profile| profile.message_bus)
            .or(self.default_profile.message_bus)
            .unwrap_or_default()
    }

    /// The name of the collection orderer, if configured.
    pub fn collection_orderer(&self) -> Option<&str> {
        self.custom_profile
            .and_then(|profile| profile.collection_orderer.as_deref())
            .or(self.default_profile.collection_orderer.as_deref())
    }

    /// The name of the test case orderer, if configured.
    pub fn case_orderer(&self) -> Option<&str> {
        self.custom_profile
            .and_then(|profile| profile.case_orderer.as_deref())
            .or(self.default_profile.case_orderer.as_deref())
    }

    /// Execution options for a run with this profile.
    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            disable_parallelization: self.disable_parallelization(),
            max_parallel_threads: self.max_parallel_threads(),
            stop_on_fail: self.stop_on_fail(),
            message_bus: self.message_bus(),
            collection_orderer: self.collection_orderer().map(|s| s.to_owned()),
            case_orderer: self.case_orderer().map(|s| s.to_owned()),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TrellisConfigImpl {
    #[serde(rename = "profile")]
    profiles: ProfilesImpl,
}

#[derive(Clone, Debug, Deserialize)]
struct ProfilesImpl {
    default: ProfileImpl,
    #[serde(flatten)]
    other: HashMap<String, ProfileImpl>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ProfileImpl {
    #[serde(default)]
    disable_parallelization: Option<bool>,
    #[serde(default)]
    max_parallel_threads: Option<MaxParallelThreads>,
    #[serde(default)]
    stop_on_fail: Option<bool>,
    #[serde(default)]
    message_bus: Option<MessageBusKind>,
    #[serde(default)]
    collection_orderer: Option<String>,
    #[serde(default)]
    case_orderer: Option<String>,
}
