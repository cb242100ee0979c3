//! Gauntlet process-environment adapter.
//!
//! The `harness` crate never reads the environment. This crate is the outer
//! layer that does: it turns `GAUNTLET_*` variables into a
//! [`harness::HarnessConfig`] and installs the tracing subscriber.
//!
//! ## Variables
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `GAUNTLET_DISRUPTORS` | `name[:config]` list separated by `;` | none |
//! | `GAUNTLET_VERBOSE` | log every step at `info` | `false` |
//! | `GAUNTLET_FINAL_RETRIES` | retries for deferred validators | `1` |
//! | `GAUNTLET_LOG_FORMAT` | `compact` or `json` (see [`logging`]) | `compact` |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Everything here is a thin translation; the semantics
//! of each setting live in `harness`.

pub mod logging;

use harness::{ConfigError, DisruptorSelection, HarnessConfig};
use thiserror::Error;

/// Disruptor activation list.
pub const DISRUPTORS_VAR: &str = "GAUNTLET_DISRUPTORS";
/// Verbose step logging.
pub const VERBOSE_VAR: &str = "GAUNTLET_VERBOSE";
/// Finalization retry count.
pub const FINAL_RETRIES_VAR: &str = "GAUNTLET_FINAL_RETRIES";

/// Errors produced while reading the environment.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A variable held a value that could not be parsed.
    #[error("{var}: {source}")]
    Invalid {
        /// Name of the offending variable.
        var: &'static str,
        /// What was wrong with it.
        #[source]
        source: ConfigError,
    },
}

/// Reads the harness configuration from the process environment.
pub fn load() -> Result<HarnessConfig, EnvError> {
    load_from(|name| std::env::var(name).ok())
}

/// Reads the harness configuration through `lookup`.
///
/// Unset and blank variables keep their defaults.
pub fn load_from<F>(lookup: F) -> Result<HarnessConfig, EnvError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = |name: &str| lookup(name).filter(|raw| !raw.trim().is_empty());
    let mut config = HarnessConfig::default();

    if let Some(raw) = value(DISRUPTORS_VAR) {
        config.disruptors = DisruptorSelection::parse_list(&raw).map_err(|source| {
            EnvError::Invalid {
                var: DISRUPTORS_VAR,
                source,
            }
        })?;
    }
    if let Some(raw) = value(VERBOSE_VAR) {
        config.verbose = parse_flag(VERBOSE_VAR, &raw)?;
    }
    if let Some(raw) = value(FINAL_RETRIES_VAR) {
        config.final_retries = raw.trim().parse().map_err(|_| EnvError::Invalid {
            var: FINAL_RETRIES_VAR,
            source: ConfigError::InvalidValue {
                setting: FINAL_RETRIES_VAR.to_string(),
                value: raw.clone(),
            },
        })?;
    }

    tracing::debug!(
        disruptors = config.disruptors.len(),
        verbose = config.verbose,
        final_retries = config.final_retries,
        "harness configuration loaded"
    );
    Ok(config)
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, EnvError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EnvError::Invalid {
            var,
            source: ConfigError::InvalidValue {
                setting: var.to_string(),
                value: raw.to_string(),
            },
        }),
    }
}
