//! Deferred validators and finalization.
//!
//! Validators flagged `validator_final` are queued at the root; those flagged
//! `validator_sub_final` are queued at the nearest named run. Finalization
//! takes a queue and re-runs every entry as one retry unit, using
//! [`HarnessConfig::final_retries`](crate::HarnessConfig) and
//! [`HarnessConfig::final_interval`](crate::HarnessConfig). Each entry's
//! outcome goes through the validation-result hook chain before it counts.
//!
//! Queues are taken, not copied: finalizing the same scope twice runs its
//! validators once. Entries hold run handles rather than runs so that a
//! queue never keeps its own tree alive.

use std::sync::Arc;

use tracing::{debug, info, Instrument};

use crate::capability::Check;
use crate::disruptor::{
    fire_post_subtest_finalizer, fire_pre_finalizer, rewrite_outcome, Disruptor,
};
use crate::errors::HarnessError;
use crate::identifiers::{RunHandle, RunKind};
use crate::retry::{self, RetryOptions};
use crate::run::Run;
use crate::step::{check_runs, context_of, render, run_checks, Step};
use crate::types::{RecordKind, RecordStatus};

/// A step's validators queued for a later pass.
#[derive(Clone)]
pub struct DeferredValidation {
    handle: RunHandle,
    step: Step,
    validators: Vec<Arc<dyn Check>>,
}

impl DeferredValidation {
    pub(crate) fn new(run: &Run, step: &Step) -> Self {
        Self {
            handle: run.handle(),
            step: step.clone(),
            validators: step.all_validators(),
        }
    }

    /// Handle of the run the validators originally ran under.
    pub fn handle(&self) -> RunHandle {
        self.handle
    }

    /// Returns `true` if both entries re-run the same validator objects.
    pub(crate) fn same_validators(&self, other: &DeferredValidation) -> bool {
        self.step.expect_error == other.step.expect_error
            && self.validators.len() == other.validators.len()
            && self
                .validators
                .iter()
                .zip(&other.validators)
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }

    async fn recheck(
        &self,
        run: &Run,
        check_runs: &[Run],
        disruptors: &[Arc<dyn Disruptor>],
    ) -> Result<(), HarnessError> {
        let context = context_of(run, &self.step);
        let outcome = run_checks(
            check_runs,
            &self.validators,
            self.step.expect_error,
            &context,
        )
        .await;
        rewrite_outcome(disruptors, run, &self.step, outcome)
    }
}

impl std::fmt::Debug for DeferredValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredValidation")
            .field("handle", &self.handle)
            .field("step", &self.step.label())
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl Run {
    /// Finalizes the whole tree.
    ///
    /// Pre-finalizer hooks run first, once per root. Then the root's final
    /// queue and the root's own subfinal queue are re-run. If those pass,
    /// any named scope that failed earlier fails the tree
    /// (see [`Run::outcome`]).
    pub async fn finalize(&self) -> Result<(), HarnessError> {
        let root = self.root_run();
        let disruptors = root.disruptors();
        if root.claim_pre_finalizer() {
            fire_pre_finalizer(&disruptors, &root).await?;
        }

        let mut entries = root.take_final();
        entries.extend(root.take_sub_final(root.handle()));
        run_deferred(&root, &disruptors, entries).await?;
        root.outcome()
    }

    /// Finalizes the nearest named scope, then fires post-subtest hooks.
    pub async fn finalize_subtree(&self) -> Result<(), HarnessError> {
        let owner = self.nearest_named();
        let disruptors = owner.disruptors();
        let entries = owner.take_sub_final(owner.handle());
        let outcome = run_deferred(&owner, &disruptors, entries).await;
        fire_post_subtest_finalizer(&disruptors, &owner).await?;
        outcome
    }
}

async fn run_deferred(
    owner: &Run,
    disruptors: &[Arc<dyn Disruptor>],
    entries: Vec<DeferredValidation>,
) -> Result<(), HarnessError> {
    if entries.is_empty() {
        return Ok(());
    }

    let run = owner.child(RunKind::Finalize);
    let config = run.config();
    let options = RetryOptions::once()
        .with_retries(config.final_retries)
        .with_interval(config.final_interval)
        .with_scope(run.scope());
    let scope = run.id();
    debug!(run = %scope, deferred = entries.len(), "finalizing");

    // validator runs are allocated once and shared by every attempt
    let prepared: Vec<(&DeferredValidation, Run, Vec<Run>)> = entries
        .iter()
        .map(|entry| {
            let origin = owner.at(entry.handle);
            let check_runs = check_runs(&origin, entry.validators.len());
            (entry, origin, check_runs)
        })
        .collect();
    let prepared = prepared.as_slice();
    let label = scope.as_str();
    let outcome = retry::run(&options, move || async move {
        let mut failures = Vec::new();
        for (entry, origin, check_runs) in prepared {
            if let Err(err) = entry.recheck(origin, check_runs, disruptors).await {
                failures.push(render(&err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Finalization {
                scope: label.to_string(),
                failures,
            })
        }
    })
    .instrument(run.span())
    .await
    .into_result();

    match &outcome {
        Ok(()) => {
            info!(run = %scope, "finalization passed");
            run.record("finalize", RecordKind::Finalize, RecordStatus::Passed);
        }
        Err(err) => {
            info!(run = %scope, error = %err, "finalization failed");
            run.record(
                "finalize",
                RecordKind::Finalize,
                RecordStatus::Failed {
                    message: render(err),
                },
            );
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::test_support::ScriptedCheck;

    fn root_with_retries(final_retries: u32) -> Run {
        Run::root(
            "suite",
            HarnessConfig {
                final_retries,
                ..HarnessConfig::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn final_validators_rerun_at_root_finalization() {
        let root = root_with_retries(1);
        let check = ScriptedCheck::passing();
        root.run_step(Step::new().with_validator(check.clone()).validator_final())
            .await
            .unwrap();
        assert_eq!(root.pending_final(), 1);

        root.finalize().await.unwrap();

        assert_eq!(check.calls(), 2);
        assert_eq!(root.pending_final(), 0);
        assert_eq!(root.report().of_kind(RecordKind::Finalize).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finalization_retries_then_fails_with_every_failure() {
        let root = root_with_retries(2);
        let healthy = ScriptedCheck::passing();
        // passes during the step, then fails at every finalization attempt
        let regressed = ScriptedCheck::script([true]);
        root.run_step(Step::new().with_validator(healthy).validator_final())
            .await
            .unwrap();
        root.run_step(Step::new().with_validator(regressed.clone()).validator_final())
            .await
            .unwrap();

        let err = root.finalize().await.unwrap_err();

        match err {
            HarnessError::Finalization { failures, .. } => assert_eq!(failures.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(regressed.calls(), 1 + 3);
        assert!(root.report().has_failures());
    }

    #[tokio::test]
    async fn finalizing_twice_runs_validators_once() {
        let root = root_with_retries(1);
        let check = ScriptedCheck::passing();
        root.run_step(Step::new().with_validator(check.clone()).validator_final())
            .await
            .unwrap();

        root.finalize().await.unwrap();
        root.finalize().await.unwrap();

        assert_eq!(check.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_substep_defers_its_validators_once() {
        let root = root_with_retries(1);
        let check = ScriptedCheck::script([false, true, true]);
        let step = Step::new()
            .with_substep(Step::new().with_validator(check.clone()).validator_final())
            .with_substep_retry(RetryOptions::once().with_retries(1));

        root.run_step(step).await.unwrap();
        assert_eq!(check.calls(), 2);
        assert_eq!(root.pending_final(), 1);

        root.finalize().await.unwrap();

        assert_eq!(check.calls(), 3);
    }

    #[tokio::test]
    async fn distinct_validators_are_deferred_separately() {
        let root = root_with_retries(1);
        let shared = ScriptedCheck::passing();
        root.run_step(Step::new().with_validator(shared.clone()).validator_final())
            .await
            .unwrap();
        root.run_step(
            Step::new()
                .with_validator(shared.clone())
                .with_validators([ScriptedCheck::passing() as Arc<dyn Check>])
                .validator_final(),
        )
        .await
        .unwrap();

        assert_eq!(root.pending_final(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn finalization_reuses_validator_runs_across_attempts() {
        let root = root_with_retries(3);
        let check = ScriptedCheck::script([true, false, false, true]);
        root.run_step(Step::new().with_validator(check.clone()).validator_final())
            .await
            .unwrap();
        let before = root.child(RunKind::Step).handle();

        root.finalize().await.unwrap();

        assert_eq!(check.calls(), 4);
        // one finalize run plus one validator run for the single entry
        let after = root.child(RunKind::Step).handle();
        assert_eq!(after.as_u32() - before.as_u32(), 3);
    }

    #[tokio::test]
    async fn failed_named_scope_fails_root_finalization() {
        let root = root_with_retries(1);
        root.run_step(Step::named("create site").with_validator(ScriptedCheck::failing("404")))
            .await
            .unwrap();
        root.run_step(Step::named("list sites").with_validator(ScriptedCheck::passing()))
            .await
            .unwrap();

        let err = root.finalize().await.unwrap_err();

        match err {
            HarnessError::NamedScopes { scopes } => {
                assert_eq!(scopes, vec!["suite/create_site".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(root.outcome().is_err());
    }

    #[tokio::test]
    async fn named_step_finalizes_its_subfinal_queue() {
        let root = root_with_retries(1);
        let inner = ScriptedCheck::passing();
        let step = Step::named("create site")
            .with_substep(Step::new().with_validator(inner.clone()).validator_sub_final());

        root.run_step(step).await.unwrap();

        assert_eq!(inner.calls(), 2);
        assert_eq!(root.pending_sub_final(), 0);
        assert!(!root.report().has_failures());
    }

    #[tokio::test]
    async fn unnamed_subfinal_validators_wait_for_root_finalization() {
        let root = root_with_retries(1);
        let check = ScriptedCheck::passing();
        root.run_step(Step::new().with_validator(check.clone()).validator_sub_final())
            .await
            .unwrap();
        assert_eq!(root.pending_sub_final(), 1);

        root.finalize().await.unwrap();

        assert_eq!(check.calls(), 2);
    }
}
