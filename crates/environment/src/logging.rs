//! Tracing subscriber wiring.
//!
//! The harness emits `tracing` spans and events but never installs a
//! subscriber. Test binaries call [`init`] once, before building the first
//! root run.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format selector.
pub const LOG_FORMAT_VAR: &str = "GAUNTLET_LOG_FORMAT";

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line events.
    #[default]
    Compact,
    /// One JSON object per event, with span fields.
    Json,
}

impl LogFormat {
    /// Parses `compact` or `json` (case-insensitive). Anything else is
    /// `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Reads [`LOG_FORMAT_VAR`], falling back to [`LogFormat::Compact`].
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_VAR)
            .ok()
            .and_then(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }
}

/// Installs the global subscriber.
///
/// Reads `RUST_LOG` (default `warn`) and [`LOG_FORMAT_VAR`]. Output goes to
/// stderr. Calling it again, or after another subscriber was installed, is a
/// no-op.
///
/// # Example
/// ```bash
/// RUST_LOG=harness=debug GAUNTLET_LOG_FORMAT=json cargo test -p suite
/// ```
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Installs the global subscriber with an explicit format.
pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Compact => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
