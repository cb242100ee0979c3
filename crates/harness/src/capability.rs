//! Capability contracts for units of work supplied by callers.
//!
//! The engine never builds actions or checks itself. Collaborators implement
//! [`Action`] (used as a step's `modify`) and [`Check`] (used as a
//! validator). An action that allocates something needing cleanup exposes
//! the [`Releasable`] capability through [`Action::as_releasable`]; the Phase
//! uses it to populate its teardown stack.
//!
//! For ad-hoc units, [`action_fn`], [`check_fn`] and [`releasable`] wrap async
//! closures.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::run::Run;

/// A mutating unit of work.
#[async_trait]
pub trait Action: Send + Sync {
    /// Performs the action. Errors abort the owning step.
    async fn execute(&self, run: &Run) -> anyhow::Result<()>;

    /// The cleanup capability, if this action allocates something.
    fn as_releasable(&self) -> Option<&dyn Releasable> {
        None
    }
}

/// A validation that reports success or failure.
#[async_trait]
pub trait Check: Send + Sync {
    /// Performs the check. May be invoked many times by the retry engine.
    async fn check(&self, run: &Run) -> anyhow::Result<()>;
}

/// Produces the action that undoes whatever its owner allocates.
pub trait Releasable: Send + Sync {
    /// The cleanup action, run later in teardown order.
    fn teardown(&self) -> Arc<dyn Action>;
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

struct ActionFn<F>(F);

#[async_trait]
impl<F, Fut> Action for ActionFn<F>
where
    F: Fn(Run) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, run: &Run) -> anyhow::Result<()> {
        (self.0)(run.clone()).await
    }
}

struct CheckFn<F>(F);

#[async_trait]
impl<F, Fut> Check for CheckFn<F>
where
    F: Fn(Run) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn check(&self, run: &Run) -> anyhow::Result<()> {
        (self.0)(run.clone()).await
    }
}

/// Wraps an async closure as an [`Action`].
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn Action>
where
    F: Fn(Run) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(ActionFn(f))
}

/// Wraps an async closure as a [`Check`].
pub fn check_fn<F, Fut>(f: F) -> Arc<dyn Check>
where
    F: Fn(Run) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(CheckFn(f))
}

struct WithTeardown {
    action: Arc<dyn Action>,
    teardown: Arc<dyn Action>,
}

#[async_trait]
impl Action for WithTeardown {
    async fn execute(&self, run: &Run) -> anyhow::Result<()> {
        self.action.execute(run).await
    }

    fn as_releasable(&self) -> Option<&dyn Releasable> {
        Some(self)
    }
}

impl Releasable for WithTeardown {
    fn teardown(&self) -> Arc<dyn Action> {
        self.teardown.clone()
    }
}

/// Pairs `action` with the action that undoes it.
pub fn releasable(action: Arc<dyn Action>, teardown: Arc<dyn Action>) -> Arc<dyn Action> {
    Arc::new(WithTeardown { action, teardown })
}

/// The teardown action exposed by `action`, if any.
pub fn teardown_of(action: &dyn Action) -> Option<Arc<dyn Action>> {
    action.as_releasable().map(|releasable| releasable.teardown())
}
