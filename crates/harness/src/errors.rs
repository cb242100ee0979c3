//! Top-level error types for the Gauntlet orchestration core.
//!
//! [`HarnessError`] is the outcome type of every engine operation: step
//! processing, phase execution, retry loops, and finalization. Collaborators
//! (actions, checks, hooks) report their own failures as [`anyhow::Error`];
//! the engine wraps those with enough context to locate the failing unit.
//!
//! The taxonomy is deliberately small:
//!
//! - **Action failures** abort their step and are never retried by the engine.
//! - **Check failures** are retried under a policy and may be rewritten by a
//!   validation-result hook.
//! - **Scope errors** (cancellation, deadline) are returned verbatim from the
//!   retry loop so callers can tell them apart from check failures.
//! - **Configuration errors** are programmer errors and fail immediately.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Cancellation scope errors
// ---------------------------------------------------------------------------

/// Why a [`crate::Scope`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ScopeError {
    /// The scope, or one of the scopes it derives from, was cancelled.
    #[error("scope cancelled")]
    Cancelled,

    /// The scope's deadline passed before the work completed.
    #[error("scope deadline exceeded")]
    DeadlineExceeded,
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Problems found while parsing or applying harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A disruptor selection token had no name (e.g. `";:x=1"`).
    #[error("disruptor selection '{token}' has an empty name")]
    EmptyDisruptorName {
        /// The offending token, as written.
        token: String,
    },

    /// A selection carried `:config` but the disruptor is not configurable.
    #[error("disruptor '{name}' does not accept configuration (got '{config}')")]
    NotConfigurable {
        /// Disruptor activation key.
        name: String,
        /// The configuration string that was supplied.
        config: String,
    },

    /// The disruptor rejected its configuration string.
    #[error("disruptor '{name}' rejected configuration '{config}': {reason}")]
    InvalidDisruptorConfig {
        /// Disruptor activation key.
        name: String,
        /// The configuration string that was supplied.
        config: String,
        /// Reason reported by the disruptor.
        reason: String,
    },

    /// Disruptors were already registered at this root.
    #[error("disruptors are already registered for run '{root}'")]
    DisruptorsAlreadySet {
        /// Id of the root run.
        root: String,
    },

    /// A phase that already ran was rebound to a different run.
    #[error("phase already ran under '{bound}' and cannot be rebound to '{requested}'")]
    PhaseRebound {
        /// Id of the run the phase is bound to.
        bound: String,
        /// Id of the run the caller tried to bind.
        requested: String,
    },

    /// A setting could not be parsed.
    #[error("invalid value '{value}' for {setting}")]
    InvalidValue {
        /// Name of the setting.
        setting: String,
        /// The raw value.
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Errors produced while processing steps, phases, and finalizers.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A step's mutating action failed.
    ///
    /// Never retried by the engine; the step is aborted immediately.
    #[error("{context}: action failed")]
    Action {
        /// Identifies the failing step (run id and step name).
        context: String,
        /// The error reported by the action.
        #[source]
        source: anyhow::Error,
    },

    /// One or more validators failed when none were allowed to.
    #[error("{context}: {} of {total} validators failed: {}", .failures.len(), join_failures(.failures))]
    Validation {
        /// Identifies the failing step.
        context: String,
        /// Number of validators that ran.
        total: usize,
        /// Rendered validator errors, in declaration order.
        failures: Vec<String>,
    },

    /// The step expected every validator to fail but some passed.
    #[error("{context}: expected every validator to fail, but {passed} of {total} passed")]
    UnexpectedSuccess {
        /// Identifies the failing step.
        context: String,
        /// Number of validators that ran.
        total: usize,
        /// Number of validators that succeeded.
        passed: usize,
    },

    /// A sub-step exhausted its retry budget.
    #[error("{context}: substep failed")]
    Substep {
        /// Identifies the parent step.
        context: String,
        /// The sub-step's final error.
        #[source]
        source: Box<HarnessError>,
    },

    /// A lifecycle hook reported an error.
    #[error("disruptor '{disruptor}' {hook} hook failed")]
    Hook {
        /// Activation key of the disruptor.
        disruptor: String,
        /// Which hook failed.
        hook: &'static str,
        /// The error reported by the hook.
        #[source]
        source: anyhow::Error,
    },

    /// Deferred validators failed during finalization.
    #[error("{scope}: {} deferred validations failed: {}", .failures.len(), join_failures(.failures))]
    Finalization {
        /// Id of the run being finalized.
        scope: String,
        /// Rendered failures, one per deferred validation.
        failures: Vec<String>,
    },

    /// Named scopes failed earlier in the tree.
    ///
    /// Each named scope is isolated from its siblings while the tree runs;
    /// their failures surface here once the root is finalized.
    #[error("{} named scopes failed: {}", .scopes.len(), .scopes.join(", "))]
    NamedScopes {
        /// Host paths of the failed scopes, in the order they ended.
        scopes: Vec<String>,
    },

    /// A disruptor replaced or wrapped an outcome.
    #[error("{message}")]
    Disrupted {
        /// Message supplied by the disruptor.
        message: String,
        /// The original outcome, if there was one.
        #[source]
        source: Option<Box<HarnessError>>,
    },

    /// The cancellation scope finished before the work did.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// Invalid configuration; a programmer error.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl HarnessError {
    /// Returns `true` for cancellation and deadline errors.
    pub fn is_scope(&self) -> bool {
        matches!(self, Self::Scope(_))
    }

    /// Wraps `self` with a disruptor message, keeping it as the source.
    pub fn disrupted(self, message: impl Into<String>) -> Self {
        Self::Disrupted {
            message: message.into(),
            source: Some(Box::new(self)),
        }
    }
}

fn join_failures(failures: &[String]) -> String {
    failures.join("; ")
}
