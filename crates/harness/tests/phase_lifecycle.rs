//! End-to-end phase tests: setup, main steps, teardown ordering, and
//! once-per-root hooks.

use std::sync::Arc;
use std::time::Duration;

use harness::test_support::{EventLog, HookRecorder, RecordingAction, ScriptedCheck};
use harness::{
    action_fn, releasable, Activation, Disruptor, HarnessConfig, HarnessError, Phase,
    RecordKind, RetryOptions, Run, Step,
};

fn root(disruptors: &str) -> Run {
    let config = HarnessConfig::default()
        .with_disruptors(disruptors)
        .expect("valid selection");
    Run::root("suite", config)
}

fn logging_action(label: &'static str, log: &EventLog) -> Arc<dyn harness::Action> {
    let log = log.clone();
    action_fn(move |_run| {
        let log = log.clone();
        async move {
            log.push(label);
            Ok(())
        }
    })
}

/// A setup action with a teardown, followed by a failing main step: the
/// teardown runs exactly once, after the failure, before `run` returns.
#[tokio::test]
async fn setup_teardown_runs_once_after_main_failure() {
    let log = EventLog::new();
    let setup = RecordingAction::with_teardown("create", "delete", &log);
    let teardown = setup.teardown_action().expect("teardown attached");
    let mut phase = Phase::new()
        .with_setup([Step::new().with_modify(setup.clone())])
        .with_main([Step::new()
            .with_modify(RecordingAction::logged("main", &log))
            .with_validator(ScriptedCheck::failing("service unavailable"))]);

    let err = phase.run().await.unwrap_err();

    assert!(matches!(err, HarnessError::Validation { .. }));
    assert_eq!(log.events(), vec!["create", "main", "delete"]);
    assert_eq!(teardown.calls(), 1);
    assert_eq!(phase.pending_teardown(), 0);
}

#[tokio::test]
async fn teardown_steps_run_in_order_then_stack_in_reverse() {
    let log = EventLog::new();
    let mut phase = Phase::new()
        .with_setup([
            Step::new().with_modify(releasable(
                logging_action("create-a", &log),
                logging_action("delete-a", &log),
            )),
            Step::new().with_modify(releasable(
                logging_action("create-b", &log),
                logging_action("delete-b", &log),
            )),
        ])
        .with_main([Step::new().with_modify(logging_action("main", &log))])
        .with_teardown([
            Step::new().with_modify(logging_action("declared-1", &log)),
            Step::new().with_modify(logging_action("declared-2", &log)),
        ]);

    phase.run_in(&root("")).await.unwrap();

    assert_eq!(
        log.events(),
        vec![
            "create-a",
            "create-b",
            "main",
            "declared-1",
            "declared-2",
            "delete-b",
            "delete-a",
        ]
    );
}

#[tokio::test]
async fn failing_setup_still_tears_down_what_it_pushed() {
    let log = EventLog::new();
    let mut phase = Phase::new()
        .with_setup([
            Step::new().with_modify(releasable(
                logging_action("create", &log),
                logging_action("delete", &log),
            )),
            Step::new().with_validator(ScriptedCheck::failing("not ready")),
        ])
        .with_main([Step::new().with_modify(logging_action("main", &log))]);

    assert!(phase.run().await.is_err());

    assert_eq!(log.events(), vec!["create", "delete"]);
}

#[tokio::test]
async fn post_main_setup_hook_fires_once_per_root() {
    let log = EventLog::new();
    let root = root("recorder");
    let recorder: Box<dyn Disruptor> = Box::new(HookRecorder::new("recorder", &log));
    let activation = root.allow_disruptors(vec![recorder]).unwrap();
    assert!(matches!(activation, Activation::Active { .. }));

    let mut empty =
        Phase::new().with_setup([Step::new().with_modify(logging_action("setup-0", &log))]);
    let mut first = Phase::new()
        .with_setup([Step::new().with_modify(logging_action("setup-1", &log))])
        .with_main([Step::new().with_modify(logging_action("main-1", &log))]);
    let mut second =
        Phase::new().with_main([Step::new().with_modify(logging_action("main-2", &log))]);

    empty.run_in(&root).await.unwrap();
    first.run_in(&root).await.unwrap();
    second.run_in(&root).await.unwrap();

    assert_eq!(
        log.events(),
        vec![
            "setup-0",
            "setup-1",
            "recorder:post-main-setup:suite.p2",
            "main-1",
            "main-2",
        ]
    );
}

#[tokio::test]
async fn skipped_root_runs_nothing() {
    let root = root("missing");
    let activation = root.allow_disruptors(Vec::new()).unwrap();
    let action = RecordingAction::new("main");
    let mut phase = Phase::new().with_main([Step::new().with_modify(action.clone())]);

    phase.run_in(&root).await.unwrap();

    assert!(matches!(activation, Activation::Skipped { .. }));
    assert_eq!(action.calls(), 0);
    assert!(root.skip_reason().unwrap().contains("missing"));
}

#[tokio::test(start_paused = true)]
async fn cleanup_cancels_keep_trying_validators() {
    let root = root("");
    let check = ScriptedCheck::failing("never converges");
    let mut phase = Phase::new().with_main([Step::new()
        .with_validator(check.clone())
        .with_validator_retry(RetryOptions::default().keep_trying())]);
    let canceller = root.clone();
    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        canceller.cleanup();
    });

    let err = phase.run_in(&root).await.unwrap_err();
    cancel.await.unwrap();

    assert!(err.is_scope());
    assert_eq!(check.calls(), 4);
}

#[tokio::test]
async fn named_main_steps_are_isolated_from_siblings() {
    let root = root("");
    let after = RecordingAction::new("after");
    let mut phase = Phase::new().with_main([
        Step::named("broken").with_validator(ScriptedCheck::failing("500")),
        Step::new().with_modify(after.clone()),
    ]);

    phase.run_in(&root).await.unwrap();

    assert_eq!(after.calls(), 1);
    let report = root.report();
    let failed: Vec<_> = report.failures().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, RecordKind::Named);
    assert_eq!(failed[0].run_id, "suite/broken");
}

#[tokio::test]
async fn failed_named_step_surfaces_when_the_root_is_finalized() {
    let root = root("");
    let mut phase = Phase::new()
        .with_main([Step::named("create site").with_validator(ScriptedCheck::failing("404"))]);

    phase.run_in(&root).await.unwrap();
    let err = root.finalize().await.unwrap_err();

    match err {
        HarnessError::NamedScopes { scopes } => assert_eq!(scopes, vec!["suite/create_site"]),
        other => panic!("unexpected error: {other}"),
    }
}
