//! Steps and the single routine that processes them.
//!
//! [`process`] is the only path a step takes, whether it comes from a
//! [`Phase`], a parent step's sub-step list, or [`Run::run_step`]:
//!
//! 1. `skip_when` set: recorded as skipped, `Ok`.
//! 2. Named step: processed under a named child run. Its outcome is recorded
//!    against that scope instead of being returned, and the scope's subfinal
//!    validators are finalized when it ends.
//! 3. Inspectors may rewrite the step; `skip_when` is checked again.
//! 4. `modify` runs once. An error aborts the step.
//! 5. Sub-steps each run this routine under `substep_retry`.
//! 6. Validators run as one retry unit under `validator_retry`.
//! 7. The outcome goes through every validation-result hook.

use std::sync::Arc;

use tracing::{debug, info, Instrument};

use crate::capability::{Action, Check};
use crate::disruptor::{inspect_all, rewrite_outcome};
use crate::errors::HarnessError;
use crate::finalize::DeferredValidation;
use crate::identifiers::RunKind;
use crate::phase::Phase;
use crate::retry::{self, RetryOptions};
use crate::run::Run;
use crate::types::{RecordKind, RecordStatus};
use crate::BoxFuture;

/// The atomic schedulable unit.
///
/// Steps are plain values; the engine clones a step before every attempt so
/// that inspector rewrites never leak into the next retry.
#[derive(Clone, Default)]
pub struct Step {
    /// Name. A non-empty name makes the step a named scope.
    pub name: String,
    /// Free-form documentation.
    pub doc: String,
    /// Mutating action, run once.
    pub modify: Option<Arc<dyn Action>>,
    /// First validator.
    pub validator: Option<Arc<dyn Check>>,
    /// Further validators, run after `validator`.
    pub validators: Vec<Arc<dyn Check>>,
    /// Retry policy for the validators. Empty means a single attempt.
    pub validator_retry: RetryOptions,
    /// Re-run the validators when the root is finalized.
    pub validator_final: bool,
    /// Re-run the validators when the nearest named scope ends.
    pub validator_sub_final: bool,
    /// First sub-step.
    pub substep: Option<Box<Step>>,
    /// Further sub-steps, run after `substep`.
    pub substeps: Vec<Step>,
    /// Retry policy for each sub-step. Empty means a single attempt.
    pub substep_retry: RetryOptions,
    /// Succeed only if every validator fails.
    pub expect_error: bool,
    /// Do nothing.
    pub skip_when: bool,
}

impl Step {
    /// An unnamed, empty step.
    pub fn new() -> Self {
        Self::default()
    }

    /// A named step.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the free-form documentation.
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    /// Sets the mutating action.
    pub fn with_modify(mut self, action: Arc<dyn Action>) -> Self {
        self.modify = Some(action);
        self
    }

    /// Sets the first validator.
    pub fn with_validator(mut self, check: Arc<dyn Check>) -> Self {
        self.validator = Some(check);
        self
    }

    /// Appends further validators.
    pub fn with_validators(mut self, checks: impl IntoIterator<Item = Arc<dyn Check>>) -> Self {
        self.validators.extend(checks);
        self
    }

    /// Sets the validator retry policy.
    pub fn with_validator_retry(mut self, options: RetryOptions) -> Self {
        self.validator_retry = options;
        self
    }

    /// Re-runs the validators at root finalization.
    pub fn validator_final(mut self) -> Self {
        self.validator_final = true;
        self
    }

    /// Re-runs the validators when the nearest named scope ends.
    pub fn validator_sub_final(mut self) -> Self {
        self.validator_sub_final = true;
        self
    }

    /// Sets the first sub-step.
    pub fn with_substep(mut self, step: Step) -> Self {
        self.substep = Some(Box::new(step));
        self
    }

    /// Appends further sub-steps.
    pub fn with_substeps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.substeps.extend(steps);
        self
    }

    /// Sets the retry policy applied to each sub-step.
    pub fn with_substep_retry(mut self, options: RetryOptions) -> Self {
        self.substep_retry = options;
        self
    }

    /// Requires every validator to fail.
    pub fn expect_error(mut self) -> Self {
        self.expect_error = true;
        self
    }

    /// Skips the step when `skip` is true.
    pub fn skip_when(mut self, skip: bool) -> Self {
        self.skip_when = skip;
        self
    }

    /// Returns `true` if the step opens a named scope.
    pub fn is_named(&self) -> bool {
        !self.name.trim().is_empty()
    }

    /// `validator` followed by `validators`.
    pub fn all_validators(&self) -> Vec<Arc<dyn Check>> {
        self.validator
            .iter()
            .chain(self.validators.iter())
            .cloned()
            .collect()
    }

    /// `substep` followed by `substeps`.
    pub fn all_substeps(&self) -> Vec<Step> {
        self.substep
            .iter()
            .map(|step| step.as_ref().clone())
            .chain(self.substeps.iter().cloned())
            .collect()
    }

    /// Name for logs and reports; falls back to `"step"`.
    pub fn label(&self) -> &str {
        if self.is_named() {
            &self.name
        } else {
            "step"
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("modify", &self.modify.is_some())
            .field("validators", &self.all_validators().len())
            .field("substeps", &self.all_substeps().len())
            .field("expect_error", &self.expect_error)
            .field("skip_when", &self.skip_when)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

impl Run {
    /// Processes `step` under this run, outside any phase.
    pub async fn run_step(&self, step: Step) -> Result<(), HarnessError> {
        let run = self.child(RunKind::Step);
        process(&run, step, None).await
    }
}

/// Processes one step under `run`.
pub(crate) fn process<'a>(
    run: &'a Run,
    step: Step,
    phase: Option<&'a Phase>,
) -> BoxFuture<'a, Result<(), HarnessError>> {
    Box::pin(async move {
        if step.skip_when {
            record_skip(run, &step);
            return Ok(());
        }
        if !step.is_named() {
            return execute(run, step, phase).await;
        }

        let named = run.named(&step.name);
        let label = step.name.clone();
        let outcome = execute(&named, step, phase)
            .instrument(named.span())
            .await;
        let finalized = named.finalize_subtree().await;
        let outcome = outcome.and(finalized);

        match &outcome {
            Ok(()) => {
                log_step(&named, &label, "named step passed");
                named.record(&label, RecordKind::Named, RecordStatus::Passed);
            }
            Err(err) => {
                info!(run = %named.id(), step = %label, error = %err, "named step failed");
                named.record(
                    &label,
                    RecordKind::Named,
                    RecordStatus::Failed {
                        message: render(err),
                    },
                );
            }
        }
        Ok(())
    })
}

async fn execute(run: &Run, mut step: Step, phase: Option<&Phase>) -> Result<(), HarnessError> {
    let disruptors = run.disruptors();
    inspect_all(&disruptors, run, &mut step, phase);
    if step.skip_when {
        record_skip(run, &step);
        return Ok(());
    }

    log_step(run, step.label(), "step started");
    let outcome = apply(run, &step, phase).await;
    let outcome = rewrite_outcome(&disruptors, run, &step, outcome);
    match &outcome {
        Ok(()) => log_step(run, step.label(), "step passed"),
        Err(err) => debug!(run = %run.id(), step = step.label(), error = %err, "step failed"),
    }
    outcome
}

async fn apply(run: &Run, step: &Step, phase: Option<&Phase>) -> Result<(), HarnessError> {
    let context = context_of(run, step);

    if let Some(modify) = &step.modify {
        let action_run = run.child(RunKind::Modify);
        modify
            .execute(&action_run)
            .await
            .map_err(|source| HarnessError::Action {
                context: context.clone(),
                source,
            })?;
    }

    let substeps = step.all_substeps();
    if !substeps.is_empty() {
        let options = policy(run, &step.substep_retry);
        for substep in &substeps {
            let outcome = retry::run(&options, move || {
                let sub_run = run.child(RunKind::Substep);
                let substep = substep.clone();
                async move { process(&sub_run, substep, phase).await }
            })
            .await;
            outcome.into_result().map_err(|err| {
                if err.is_scope() {
                    err
                } else {
                    HarnessError::Substep {
                        context: context.clone(),
                        source: Box::new(err),
                    }
                }
            })?;
        }
    }

    let validators = step.all_validators();
    if validators.is_empty() {
        return Ok(());
    }
    if step.validator_final {
        run.defer_final(DeferredValidation::new(run, step));
    }
    if step.validator_sub_final {
        run.defer_sub_final(DeferredValidation::new(run, step));
    }

    let options = policy(run, &step.validator_retry);
    let check_runs = check_runs(run, validators.len());
    let check_runs = check_runs.as_slice();
    let validators = validators.as_slice();
    let expect_error = step.expect_error;
    let context = context.as_str();
    retry::run(&options, move || {
        run_checks(check_runs, validators, expect_error, context)
    })
    .await
    .into_result()
}

/// One validator run per validator, shared by every attempt of a batch.
pub(crate) fn check_runs(run: &Run, count: usize) -> Vec<Run> {
    (0..count).map(|_| run.child(RunKind::Validate)).collect()
}

/// Runs every validator once, each under its own run, and aggregates the
/// results.
///
/// With `expect_error` the batch passes only if no validator passed;
/// otherwise only if none failed. A mixed batch always fails.
pub(crate) async fn run_checks(
    check_runs: &[Run],
    validators: &[Arc<dyn Check>],
    expect_error: bool,
    context: &str,
) -> Result<(), HarnessError> {
    let mut failures = Vec::new();
    for (validator, check_run) in validators.iter().zip(check_runs) {
        if let Err(err) = validator.check(check_run).await {
            failures.push(format!("{err:#}"));
        }
    }

    let total = validators.len();
    let passed = total - failures.len();
    if expect_error {
        if passed == 0 {
            return Ok(());
        }
        return Err(HarnessError::UnexpectedSuccess {
            context: context.to_string(),
            total,
            passed,
        });
    }
    if failures.is_empty() {
        return Ok(());
    }
    Err(HarnessError::Validation {
        context: context.to_string(),
        total,
        failures,
    })
}

/// `configured` (or a single attempt), bounded by the run's scope.
fn policy(run: &Run, configured: &RetryOptions) -> RetryOptions {
    configured
        .or(&RetryOptions::once())
        .max(&RetryOptions::scoped(run.scope()))
}

pub(crate) fn context_of(run: &Run, step: &Step) -> String {
    if step.is_named() {
        format!("{} ({})", run.id(), step.name)
    } else {
        run.id()
    }
}

fn record_skip(run: &Run, step: &Step) {
    log_step(run, step.label(), "step skipped");
    run.record(step.label(), RecordKind::Step, RecordStatus::Skipped);
}

fn log_step(run: &Run, label: &str, message: &'static str) {
    if run.config().verbose {
        info!(run = %run.id(), step = label, "{message}");
    } else {
        debug!(run = %run.id(), step = label, "{message}");
    }
}

/// Renders `err` with its whole source chain.
pub(crate) fn render(err: &HarnessError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
