//! Phases: Setup, MainSteps, Teardown.
//!
//! A [`Phase`] walks its three step lists in order under one bound [`Run`].
//! Setup actions that expose [`Releasable`](crate::Releasable) push their
//! teardown onto the phase's stack before they execute. Teardown runs the
//! declared teardown steps in order and then drains the stack in reverse,
//! whatever happened before.

use std::sync::Arc;

use tracing::{debug, info, warn, Instrument};

use crate::capability::{teardown_of, Action};
use crate::config::HarnessConfig;
use crate::disruptor::fire_post_main_setup;
use crate::errors::{ConfigError, HarnessError};
use crate::identifiers::RunKind;
use crate::run::Run;
use crate::step::{process, render, Step};
use crate::types::{RecordKind, RecordStatus};

/// An ordered Setup / MainSteps / Teardown triple bound to one run.
#[derive(Default)]
pub struct Phase {
    /// Steps that prepare the system; all run even if one fails.
    pub setup: Vec<Step>,
    /// Steps under test; the first failure stops the list.
    pub main_steps: Vec<Step>,
    /// Steps that always run last, before the teardown stack.
    pub teardown: Vec<Step>,
    run: Option<Run>,
    has_run: bool,
    teardown_stack: Vec<Arc<dyn Action>>,
}

impl Phase {
    /// An empty, unbound phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends setup steps.
    pub fn with_setup(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.setup.extend(steps);
        self
    }

    /// Appends main steps.
    pub fn with_main(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.main_steps.extend(steps);
        self
    }

    /// Appends declared teardown steps.
    pub fn with_teardown(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.teardown.extend(steps);
        self
    }

    /// The run this phase is bound to.
    pub fn bound_run(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    /// Returns `true` once [`Phase::run`] or [`Phase::run_in`] was called.
    pub fn has_run(&self) -> bool {
        self.has_run
    }

    /// Number of teardown actions waiting on the stack.
    pub fn pending_teardown(&self) -> usize {
        self.teardown_stack.len()
    }

    /// Binds the phase to `run`.
    ///
    /// Before the first run the binding may change freely. Afterwards only
    /// the same run is accepted.
    pub fn bind(&mut self, run: Run) -> Result<(), HarnessError> {
        match &self.run {
            Some(bound) if self.has_run && *bound != run => Err(ConfigError::PhaseRebound {
                bound: bound.id(),
                requested: run.id(),
            }
            .into()),
            _ => {
                self.run = Some(run);
                Ok(())
            }
        }
    }

    /// Runs the phase under its bound run, or under a fresh root if unbound.
    pub async fn run(&mut self) -> Result<(), HarnessError> {
        let run = match &self.run {
            Some(run) => run.clone(),
            None => {
                let run = Run::root("phase", HarnessConfig::default()).child(RunKind::Phase);
                self.run = Some(run.clone());
                run
            }
        };
        self.execute(&run).await
    }

    /// Runs the phase as a child of `parent`.
    ///
    /// The first call binds a new phase run under `parent`; later calls must
    /// pass the same parent.
    pub async fn run_in(&mut self, parent: &Run) -> Result<(), HarnessError> {
        let run = match &self.run {
            Some(bound) if bound.parent().as_ref() == Some(parent) => bound.clone(),
            Some(bound) if self.has_run => {
                return Err(ConfigError::PhaseRebound {
                    bound: bound.id(),
                    requested: parent.id(),
                }
                .into())
            }
            _ => {
                let run = parent.child(RunKind::Phase);
                self.run = Some(run.clone());
                run
            }
        };
        self.execute(&run).await
    }

    async fn execute(&mut self, run: &Run) -> Result<(), HarnessError> {
        self.has_run = true;
        if let Some(reason) = run.skip_reason() {
            info!(run = %run.id(), %reason, "phase skipped");
            return Ok(());
        }

        let span = run.span();
        async {
            let outcome = match self.run_setup(run).await {
                Ok(()) => self.run_main(run).await,
                Err(err) => {
                    debug!(run = %run.id(), "setup failed, main steps not started");
                    Err(err)
                }
            };
            self.run_teardown(run).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_setup(&mut self, run: &Run) -> Result<(), HarnessError> {
        let mut first_error = None;
        for step in self.setup.clone() {
            let teardown = step.modify.as_ref().and_then(|action| teardown_of(action.as_ref()));
            if let Some(teardown) = teardown {
                self.teardown_stack.push(teardown);
            }
            let step_run = run.child(RunKind::Step);
            if let Err(err) = process(&step_run, step, Some(&*self)).await {
                warn!(run = %step_run.id(), error = %err, "setup step failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn run_main(&self, run: &Run) -> Result<(), HarnessError> {
        if self.main_steps.is_empty() {
            return Ok(());
        }
        if run.claim_post_main_setup() {
            fire_post_main_setup(&run.disruptors(), run).await?;
        }
        for step in &self.main_steps {
            let step_run = run.child(RunKind::Step);
            process(&step_run, step.clone(), Some(self)).await?;
        }
        Ok(())
    }

    async fn run_teardown(&mut self, run: &Run) {
        for step in self.teardown.clone() {
            let label = step.label().to_string();
            let step_run = run.child(RunKind::Teardown);
            if let Err(err) = process(&step_run, step, Some(&*self)).await {
                teardown_failed(&step_run, &label, &err);
            }
        }
        while let Some(action) = self.teardown_stack.pop() {
            let action_run = run.child(RunKind::Teardown);
            if let Err(source) = action.execute(&action_run).await {
                let err = HarnessError::Action {
                    context: action_run.id(),
                    source,
                };
                teardown_failed(&action_run, "teardown", &err);
            }
        }
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("setup", &self.setup.len())
            .field("main_steps", &self.main_steps.len())
            .field("teardown", &self.teardown.len())
            .field("run", &self.run)
            .field("has_run", &self.has_run)
            .field("teardown_stack", &self.teardown_stack.len())
            .finish()
    }
}

fn teardown_failed(run: &Run, label: &str, err: &HarnessError) {
    warn!(run = %run.id(), step = label, error = %err, "teardown failed");
    run.record(
        label,
        RecordKind::Teardown,
        RecordStatus::Failed {
            message: render(err),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingAction, ScriptedCheck};

    #[tokio::test]
    async fn unbound_phase_creates_its_own_run() {
        let mut phase = Phase::new().with_main([Step::new()]);

        phase.run().await.unwrap();

        let run = phase.bound_run().unwrap();
        assert_eq!(run.kind(), RunKind::Phase);
        assert_eq!(run.id(), "phase.p1");
    }

    #[tokio::test]
    async fn rebinding_after_run_is_a_configuration_error() {
        let root = Run::root("suite", HarnessConfig::default());
        let mut phase = Phase::new();
        phase.bind(root.child(RunKind::Phase)).unwrap();
        phase.run().await.unwrap();

        let same = phase.bound_run().cloned().unwrap();
        phase.bind(same).unwrap();
        let err = phase.bind(root.child(RunKind::Phase)).unwrap_err();

        assert!(matches!(
            err,
            HarnessError::Configuration(ConfigError::PhaseRebound { .. })
        ));
    }

    #[tokio::test]
    async fn run_in_rejects_a_different_parent_after_running() {
        let first = Run::root("first", HarnessConfig::default());
        let second = Run::root("second", HarnessConfig::default());
        let mut phase = Phase::new();

        phase.run_in(&first).await.unwrap();
        phase.run_in(&first).await.unwrap();
        let err = phase.run_in(&second).await.unwrap_err();

        assert!(matches!(
            err,
            HarnessError::Configuration(ConfigError::PhaseRebound { .. })
        ));
    }

    #[tokio::test]
    async fn setup_failure_skips_main_and_keeps_first_error() {
        let main = RecordingAction::new("main");
        let later = RecordingAction::new("later setup");
        let mut phase = Phase::new()
            .with_setup([
                Step::new().with_modify(RecordingAction::failing("first", "boom")),
                Step::new().with_modify(later.clone()),
                Step::new().with_validator(ScriptedCheck::failing("second")),
            ])
            .with_main([Step::new().with_modify(main.clone())]);

        let err = phase.run().await.unwrap_err();

        assert!(matches!(err, HarnessError::Action { .. }));
        assert_eq!(later.calls(), 1);
        assert_eq!(main.calls(), 0);
    }

    #[tokio::test]
    async fn main_steps_stop_at_first_failure() {
        let after = RecordingAction::new("after");
        let mut phase = Phase::new().with_main([
            Step::new().with_validator(ScriptedCheck::failing("down")),
            Step::new().with_modify(after.clone()),
        ]);

        assert!(phase.run().await.is_err());
        assert_eq!(after.calls(), 0);
    }

    #[tokio::test]
    async fn teardown_failures_are_recorded_not_returned() {
        let root = Run::root("suite", HarnessConfig::default());
        let next = RecordingAction::new("next");
        let mut phase = Phase::new().with_teardown([
            Step::new().with_modify(RecordingAction::failing("delete", "still in use")),
            Step::new().with_modify(next.clone()),
        ]);

        phase.run_in(&root).await.unwrap();

        assert_eq!(next.calls(), 1);
        let failures: Vec<_> = root.report().of_kind(RecordKind::Teardown).cloned().collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].status.is_failed());
    }
}
