//! Test-only collaborators: scripted checks, recording actions, and
//! disruptors that exercise each hook capability.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::capability::{Action, Check, Releasable};
use crate::disruptor::{
    Configurable, Disruptor, Inspector, PostMainSetupHook, PostSubtestFinalizerHook,
    PreFinalizerHook, ValidationResultHook,
};
use crate::errors::HarnessError;
use crate::phase::Phase;
use crate::run::Run;
use crate::step::Step;

/// Shared, ordered log of events, for asserting call order across fakes.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event`.
    pub fn push(&self, event: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.into());
    }

    /// Every event so far, oldest first.
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// A check that replays a pass/fail script and then settles on a fixed
/// result.
#[derive(Debug)]
pub struct ScriptedCheck {
    script: Vec<bool>,
    settled: bool,
    message: String,
    calls: AtomicUsize,
}

impl ScriptedCheck {
    /// Follows `script`, then fails forever.
    pub fn script(script: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Arc::new(Self {
            script: script.into_iter().collect(),
            settled: false,
            message: "scripted failure".to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    /// Always passes.
    pub fn passing() -> Arc<Self> {
        Arc::new(Self {
            script: Vec::new(),
            settled: true,
            message: String::new(),
            calls: AtomicUsize::new(0),
        })
    }

    /// Always fails with `message`.
    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Vec::new(),
            settled: false,
            message: message.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of times the check ran.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Check for ScriptedCheck {
    async fn check(&self, _run: &Run) -> anyhow::Result<()> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.script.get(index).copied().unwrap_or(self.settled) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("{}", self.message))
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// An action that counts its calls, optionally fails, optionally logs into
/// an [`EventLog`], and optionally exposes a teardown.
#[derive(Debug)]
pub struct RecordingAction {
    label: String,
    error: Option<String>,
    log: Option<EventLog>,
    teardown: Option<Arc<RecordingAction>>,
    calls: AtomicUsize,
}

impl RecordingAction {
    fn build(label: &str, error: Option<&str>, log: Option<EventLog>) -> Self {
        Self {
            label: label.to_string(),
            error: error.map(str::to_string),
            log,
            teardown: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// An action that always succeeds.
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self::build(label, None, None))
    }

    /// An action that always fails with `error`.
    pub fn failing(label: &str, error: &str) -> Arc<Self> {
        Arc::new(Self::build(label, Some(error), None))
    }

    /// An action that appends `label` to `log` when executed.
    pub fn logged(label: &str, log: &EventLog) -> Arc<Self> {
        Arc::new(Self::build(label, None, Some(log.clone())))
    }

    /// A logged action whose teardown logs `teardown_label`.
    pub fn with_teardown(label: &str, teardown_label: &str, log: &EventLog) -> Arc<Self> {
        let mut action = Self::build(label, None, Some(log.clone()));
        action.teardown = Some(Self::logged(teardown_label, log));
        Arc::new(action)
    }

    /// Number of times the action ran.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The teardown action, if one was attached.
    pub fn teardown_action(&self) -> Option<Arc<RecordingAction>> {
        self.teardown.clone()
    }
}

#[async_trait]
impl Action for RecordingAction {
    async fn execute(&self, _run: &Run) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.push(self.label.clone());
        }
        match &self.error {
            Some(error) => Err(anyhow::anyhow!("{}: {error}", self.label)),
            None => Ok(()),
        }
    }

    fn as_releasable(&self) -> Option<&dyn Releasable> {
        self.teardown.as_ref().map(|_| self as &dyn Releasable)
    }
}

impl Releasable for RecordingAction {
    fn teardown(&self) -> Arc<dyn Action> {
        match &self.teardown {
            Some(teardown) => teardown.clone(),
            None => Self::new("noop"),
        }
    }
}

// ---------------------------------------------------------------------------
// Disruptors
// ---------------------------------------------------------------------------

/// A disruptor that logs every lifecycle hook it receives.
#[derive(Debug)]
pub struct HookRecorder {
    name: String,
    log: EventLog,
    config: Option<String>,
}

impl HookRecorder {
    /// A recorder activated as `name`, logging into `log`.
    pub fn new(name: &str, log: &EventLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            config: None,
        }
    }

    /// The configuration string it received, if any.
    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }
}

impl Disruptor for HookRecorder {
    fn env_value(&self) -> &str {
        &self.name
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }

    fn as_post_main_setup_hook(&self) -> Option<&dyn PostMainSetupHook> {
        Some(self)
    }

    fn as_pre_finalizer_hook(&self) -> Option<&dyn PreFinalizerHook> {
        Some(self)
    }

    fn as_post_subtest_finalizer_hook(&self) -> Option<&dyn PostSubtestFinalizerHook> {
        Some(self)
    }
}

impl Configurable for HookRecorder {
    fn configure(&mut self, config: &str) -> anyhow::Result<()> {
        self.log.push(format!("{}:configure:{config}", self.name));
        self.config = Some(config.to_string());
        Ok(())
    }
}

#[async_trait]
impl PostMainSetupHook for HookRecorder {
    async fn post_main_setup(&self, run: &Run) -> anyhow::Result<()> {
        self.log
            .push(format!("{}:post-main-setup:{}", self.name, run.id()));
        Ok(())
    }
}

#[async_trait]
impl PreFinalizerHook for HookRecorder {
    async fn pre_finalizer(&self, run: &Run) -> anyhow::Result<()> {
        self.log.push(format!("{}:pre-finalizer:{}", self.name, run.id()));
        Ok(())
    }
}

#[async_trait]
impl PostSubtestFinalizerHook for HookRecorder {
    async fn post_subtest_finalizer(&self, run: &Run) -> anyhow::Result<()> {
        self.log
            .push(format!("{}:post-subtest-finalizer:{}", self.name, run.id()));
        Ok(())
    }
}

/// A disruptor that turns every failed step outcome into success.
#[derive(Debug)]
pub struct Forgiving(pub &'static str);

impl Disruptor for Forgiving {
    fn env_value(&self) -> &str {
        self.0
    }

    fn as_validation_result_hook(&self) -> Option<&dyn ValidationResultHook> {
        Some(self)
    }
}

impl ValidationResultHook for Forgiving {
    fn validation_result(
        &self,
        _run: &Run,
        _step: &Step,
        _outcome: Result<(), HarnessError>,
    ) -> Result<(), HarnessError> {
        Ok(())
    }
}

/// A disruptor that wraps every failed outcome with a message.
#[derive(Debug)]
pub struct Annotating(pub &'static str);

impl Disruptor for Annotating {
    fn env_value(&self) -> &str {
        self.0
    }

    fn as_validation_result_hook(&self) -> Option<&dyn ValidationResultHook> {
        Some(self)
    }
}

impl ValidationResultHook for Annotating {
    fn validation_result(
        &self,
        _run: &Run,
        _step: &Step,
        outcome: Result<(), HarnessError>,
    ) -> Result<(), HarnessError> {
        outcome.map_err(|err| err.disrupted(format!("disrupted by {}", self.0)))
    }
}

/// An inspector that applies `rewrite` to every step it sees and logs the
/// step label together with whether a phase was supplied.
pub struct Rewriter {
    name: &'static str,
    log: EventLog,
    rewrite: Box<dyn Fn(&mut Step) + Send + Sync>,
}

impl Rewriter {
    /// An inspector activated as `name`.
    pub fn new(
        name: &'static str,
        log: &EventLog,
        rewrite: impl Fn(&mut Step) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            log: log.clone(),
            rewrite: Box::new(rewrite),
        }
    }
}

impl Disruptor for Rewriter {
    fn env_value(&self) -> &str {
        self.name
    }

    fn as_inspector(&self) -> Option<&dyn Inspector> {
        Some(self)
    }
}

impl Inspector for Rewriter {
    fn inspect(&self, _run: &Run, step: &mut Step, phase: Option<&Phase>) {
        let scope = if phase.is_some() { "phase" } else { "standalone" };
        self.log
            .push(format!("{}:inspect:{}:{scope}", self.name, step.label()));
        (self.rewrite)(step);
    }
}
