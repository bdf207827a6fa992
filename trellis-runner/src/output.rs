// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logging for hosts of the engine.

use std::sync::Once;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    Layer, filter::Targets, layer::SubscriberExt, util::SubscriberInitExt,
};

/// The environment variable that controls log output, in `tracing_subscriber` targets syntax.
pub const LOG_ENV: &str = "TRELLIS_LOG";

static INIT_LOGGER: Once = Once::new();

/// Installs a global subscriber that writes engine logs to stderr.
///
/// Filtering is controlled by `TRELLIS_LOG` (for example `trellis_runner=debug`), and defaults to
/// `info`. Only the first call has an effect. An invalid filter falls back to the default, with a
/// warning.
pub fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let level_str = std::env::var(LOG_ENV).unwrap_or_default();

        let (targets, parse_error) = if level_str.is_empty() {
            (Targets::new().with_default(LevelFilter::INFO), None)
        } else {
            match level_str.parse::<Targets>() {
                Ok(targets) => (targets, None),
                Err(err) => (Targets::new().with_default(LevelFilter::INFO), Some(err)),
            }
        };

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(targets);

        // Another subscriber may already have been installed by the host.
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            return;
        }

        if let Some(err) = parse_error {
            tracing::warn!("ignoring invalid {LOG_ENV} value `{level_str}`: {err}");
        }
    });
}
