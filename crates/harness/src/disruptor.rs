//! Disruptor hook protocol.
//!
//! A disruptor is an externally supplied policy object. Each one has a stable
//! activation key ([`Disruptor::env_value`]) and may expose any of a closed set
//! of optional capabilities through the `as_*` accessors:
//!
//! | Capability | When the engine calls it |
//! |------------|--------------------------|
//! | [`Configurable`] | at activation, when the selection carries `:config` |
//! | [`Inspector`] | before every step executes |
//! | [`PostMainSetupHook`] | once per root, before the first main steps |
//! | [`PreFinalizerHook`] | once per root, before root finalization |
//! | [`PostSubtestFinalizerHook`] | after each named scope is finalized |
//! | [`ValidationResultHook`] | after every step outcome is computed |
//!
//! Disruptors are called in registration order.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::HarnessError;
use crate::phase::Phase;
use crate::run::Run;
use crate::step::Step;

/// An externally supplied policy object.
pub trait Disruptor: Send + Sync {
    /// Key matched against the activation list.
    fn env_value(&self) -> &str;

    /// Configuration capability.
    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        None
    }

    /// Inspect-and-mutate capability.
    fn as_inspector(&self) -> Option<&dyn Inspector> {
        None
    }

    /// Hook fired once per root before the first main steps.
    fn as_post_main_setup_hook(&self) -> Option<&dyn PostMainSetupHook> {
        None
    }

    /// Hook fired once per root before root finalization.
    fn as_pre_finalizer_hook(&self) -> Option<&dyn PreFinalizerHook> {
        None
    }

    /// Hook fired after a named scope's deferred validators ran.
    fn as_post_subtest_finalizer_hook(&self) -> Option<&dyn PostSubtestFinalizerHook> {
        None
    }

    /// Outcome-rewriting capability.
    fn as_validation_result_hook(&self) -> Option<&dyn ValidationResultHook> {
        None
    }
}

/// Accepts a disruptor-specific configuration string.
pub trait Configurable {
    /// Applies `config` (e.g. `key=value` pairs).
    fn configure(&mut self, config: &str) -> anyhow::Result<()>;
}

/// Mutates a step before it runs.
///
/// May replace `modify`, replace or extend the validators, or set
/// `skip_when`. `phase` is `None` for steps run outside a phase.
pub trait Inspector: Send + Sync {
    /// Inspects and possibly rewrites `step`.
    fn inspect(&self, run: &Run, step: &mut Step, phase: Option<&Phase>);
}

/// Runs once per root, after setup and before the first main steps.
#[async_trait]
pub trait PostMainSetupHook: Send + Sync {
    /// Called with the phase run that is about to start its main steps.
    async fn post_main_setup(&self, run: &Run) -> anyhow::Result<()>;
}

/// Runs once per root, before the root's deferred validators.
#[async_trait]
pub trait PreFinalizerHook: Send + Sync {
    /// Called with the root run.
    async fn pre_finalizer(&self, run: &Run) -> anyhow::Result<()>;
}

/// Runs after a named scope's deferred validators.
#[async_trait]
pub trait PostSubtestFinalizerHook: Send + Sync {
    /// Called with the named run that just finished.
    async fn post_subtest_finalizer(&self, run: &Run) -> anyhow::Result<()>;
}

/// Rewrites a computed step outcome.
///
/// Implementations may pass the outcome through, replace it, wrap it (see
/// [`HarnessError::disrupted`]), or turn a failure into success.
pub trait ValidationResultHook: Send + Sync {
    /// Returns the outcome the engine should report for `step`.
    fn validation_result(
        &self,
        run: &Run,
        step: &Step,
        outcome: Result<(), HarnessError>,
    ) -> Result<(), HarnessError>;
}

// ---------------------------------------------------------------------------
// Dispatch helpers used by the engine
// ---------------------------------------------------------------------------

pub(crate) fn inspect_all(
    disruptors: &[Arc<dyn Disruptor>],
    run: &Run,
    step: &mut Step,
    phase: Option<&Phase>,
) {
    for disruptor in disruptors {
        if let Some(inspector) = disruptor.as_inspector() {
            debug!(run = %run.id(), disruptor = disruptor.env_value(), "inspecting step");
            inspector.inspect(run, step, phase);
        }
    }
}

pub(crate) fn rewrite_outcome(
    disruptors: &[Arc<dyn Disruptor>],
    run: &Run,
    step: &Step,
    mut outcome: Result<(), HarnessError>,
) -> Result<(), HarnessError> {
    for disruptor in disruptors {
        if let Some(hook) = disruptor.as_validation_result_hook() {
            let before = outcome.is_ok();
            outcome = hook.validation_result(run, step, outcome);
            if before != outcome.is_ok() {
                debug!(
                    run = %run.id(),
                    disruptor = disruptor.env_value(),
                    passed = outcome.is_ok(),
                    "disruptor rewrote step outcome"
                );
            }
        }
    }
    outcome
}

pub(crate) async fn fire_post_main_setup(
    disruptors: &[Arc<dyn Disruptor>],
    run: &Run,
) -> Result<(), HarnessError> {
    for disruptor in disruptors {
        if let Some(hook) = disruptor.as_post_main_setup_hook() {
            hook.post_main_setup(run)
                .await
                .map_err(|source| HarnessError::Hook {
                    disruptor: disruptor.env_value().to_string(),
                    hook: "post-main-setup",
                    source,
                })?;
        }
    }
    Ok(())
}

pub(crate) async fn fire_pre_finalizer(
    disruptors: &[Arc<dyn Disruptor>],
    run: &Run,
) -> Result<(), HarnessError> {
    for disruptor in disruptors {
        if let Some(hook) = disruptor.as_pre_finalizer_hook() {
            hook.pre_finalizer(run)
                .await
                .map_err(|source| HarnessError::Hook {
                    disruptor: disruptor.env_value().to_string(),
                    hook: "pre-finalizer",
                    source,
                })?;
        }
    }
    Ok(())
}

pub(crate) async fn fire_post_subtest_finalizer(
    disruptors: &[Arc<dyn Disruptor>],
    run: &Run,
) -> Result<(), HarnessError> {
    for disruptor in disruptors {
        if let Some(hook) = disruptor.as_post_subtest_finalizer_hook() {
            hook.post_subtest_finalizer(run)
                .await
                .map_err(|source| HarnessError::Hook {
                    disruptor: disruptor.env_value().to_string(),
                    hook: "post-subtest-finalizer",
                    source,
                })?;
        }
    }
    Ok(())
}
