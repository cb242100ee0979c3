//! Harness configuration.
//!
//! [`HarnessConfig`] is passed explicitly to [`crate::Run::root`]. Nothing in
//! this crate reads the process environment; the `environment` crate adapts
//! environment variables into this struct.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Default number of retries for deferred validators at finalization.
pub const DEFAULT_FINAL_RETRIES: u32 = 1;

/// Default spacing between finalization attempts.
pub const DEFAULT_FINAL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Disruptor selection
// ---------------------------------------------------------------------------

/// One `name[:config]` entry of a disruptor activation list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisruptorSelection {
    /// Activation key, matched against [`crate::Disruptor::env_value`].
    pub name: String,
    /// Disruptor-specific configuration string, if any.
    pub config: Option<String>,
}

impl DisruptorSelection {
    /// Creates a selection without configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
        }
    }

    /// Creates a selection carrying a configuration string.
    pub fn with_config(name: impl Into<String>, config: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Some(config.into()),
        }
    }

    /// Parses a single `name[:config]` token.
    ///
    /// The split happens at the first `:`, so configuration strings may
    /// themselves contain colons.
    pub fn parse(token: &str) -> Result<Self, ConfigError> {
        let (name, config) = match token.split_once(':') {
            Some((name, config)) => (name.trim(), Some(config.trim().to_string())),
            None => (token.trim(), None),
        };
        if name.is_empty() {
            return Err(ConfigError::EmptyDisruptorName {
                token: token.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            config,
        })
    }

    /// Parses a semicolon-separated activation list.
    ///
    /// Blank entries are ignored, so `""`, `";"` and `"a;;b;"` are all valid.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, ConfigError> {
        raw.split(';')
            .filter(|token| !token.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl std::fmt::Display for DisruptorSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.config {
            Some(config) => write!(f, "{}:{}", self.name, config),
            None => write!(f, "{}", self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness configuration
// ---------------------------------------------------------------------------

/// Settings fixed for the lifetime of one execution tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Disruptors to activate, in registration order.
    pub disruptors: Vec<DisruptorSelection>,
    /// Log each step at `info` instead of `debug`.
    pub verbose: bool,
    /// How many times deferred validators are retried at finalization.
    pub final_retries: u32,
    /// Spacing between finalization attempts.
    pub final_interval: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            disruptors: Vec::new(),
            verbose: false,
            final_retries: DEFAULT_FINAL_RETRIES,
            final_interval: DEFAULT_FINAL_INTERVAL,
        }
    }
}

impl HarnessConfig {
    /// Replaces the activation list with the parsed form of `raw`.
    pub fn with_disruptors(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.disruptors = DisruptorSelection::parse_list(raw)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_splits_names_and_configs() {
        let parsed = DisruptorSelection::parse_list("edge; upgrade:site=a,version=2 ;;").unwrap();

        assert_eq!(
            parsed,
            vec![
                DisruptorSelection::new("edge"),
                DisruptorSelection::with_config("upgrade", "site=a,version=2"),
            ]
        );
    }

    #[test]
    fn parse_keeps_colons_inside_config() {
        let parsed = DisruptorSelection::parse("proxy:url=http://host:8080").unwrap();

        assert_eq!(parsed.name, "proxy");
        assert_eq!(parsed.config.as_deref(), Some("url=http://host:8080"));
        assert_eq!(parsed.to_string(), "proxy:url=http://host:8080");
    }

    #[test]
    fn parse_rejects_empty_name() {
        let err = DisruptorSelection::parse_list("edge;:x=1").unwrap_err();

        assert_eq!(
            err,
            ConfigError::EmptyDisruptorName {
                token: ":x=1".to_string()
            }
        );
    }

    #[test]
    fn empty_list_is_valid() {
        assert!(DisruptorSelection::parse_list("").unwrap().is_empty());
        assert!(DisruptorSelection::parse_list(" ; ").unwrap().is_empty());
    }

    #[test]
    fn default_config_retries_finalizers_once() {
        let config = HarnessConfig::default();

        assert_eq!(config.final_retries, 1);
        assert!(!config.verbose);
        assert!(config.disruptors.is_empty());
    }
}
