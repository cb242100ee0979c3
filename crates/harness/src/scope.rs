//! Cancellation scopes.
//!
//! A [`Scope`] is a cheaply clonable handle that is either live or done with a
//! [`ScopeError`]. Scopes form a DAG:
//!
//! | Constructor | Done when |
//! |-------------|-----------|
//! | [`Scope::background`] | cancelled |
//! | [`Scope::child`] / [`Scope::with_timeout`] | cancelled, deadline passed, or parent done |
//! | [`Scope::merge`] | cancelled, or either source done |
//!
//! Every scope owns exactly one cancellation sender: its own. Cancelling a
//! scope never cancels the scopes it was derived from. Merged scopes are tagged
//! as derived and keep an explicit record of their two sources, so a chain of
//! merges observes cancellation of an original root synchronously through
//! [`Scope::error`].
//!
//! Each merge spawns one watcher task that wakes [`Scope::done`] waiters. The
//! watcher holds the merged scope weakly and exits as soon as a source fires,
//! the merged scope fires, or the last handle to the merged scope is dropped.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::errors::ScopeError;
use crate::BoxFuture;

/// A cancellable scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    state: watch::Sender<Option<ScopeError>>,
    deadline: Option<Instant>,
    origin: Origin,
}

enum Origin {
    Background,
    Child {
        parent: Scope,
    },
    Merged {
        sources: [Scope; 2],
        // false when no runtime was available to host the watcher
        watched: bool,
    },
}

impl ScopeInner {
    fn new(deadline: Option<Instant>, origin: Origin) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state,
            deadline,
            origin,
        }
    }

    /// Records `err` as the reason this scope is done, unless already done.
    fn latch(&self, err: ScopeError) {
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(err);
            true
        });
    }
}

impl Scope {
    /// A root scope that is only done when cancelled.
    pub fn background() -> Self {
        Self::from_inner(ScopeInner::new(None, Origin::Background))
    }

    /// A scope that is done when `self` is done or it is cancelled itself.
    pub fn child(&self) -> Self {
        Self::from_inner(ScopeInner::new(
            None,
            Origin::Child {
                parent: self.clone(),
            },
        ))
    }

    /// A child scope that also finishes `timeout` from now.
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// A child scope that also finishes at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self::from_inner(ScopeInner::new(
            Some(deadline),
            Origin::Child {
                parent: self.clone(),
            },
        ))
    }

    /// A derived scope that is done when either `a` or `b` is done.
    ///
    /// Cancelling the result leaves both inputs untouched. Merging a scope
    /// with itself returns it unchanged.
    pub fn merge(a: &Scope, b: &Scope) -> Self {
        if Scope::ptr_eq(a, b) {
            return a.clone();
        }

        let runtime = Handle::try_current().ok();
        let merged = Self::from_inner(ScopeInner::new(
            None,
            Origin::Merged {
                sources: [a.clone(), b.clone()],
                watched: runtime.is_some(),
            },
        ));

        if let Some(runtime) = runtime {
            runtime.spawn(watch_sources(
                Arc::downgrade(&merged.inner),
                merged.inner.state.subscribe(),
                a.clone(),
                b.clone(),
            ));
        }
        merged
    }

    fn from_inner(inner: ScopeInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Marks this scope (and everything derived from it) as cancelled.
    pub fn cancel(&self) {
        self.inner.latch(ScopeError::Cancelled);
    }

    /// Why the scope is done, or `None` while it is live.
    pub fn error(&self) -> Option<ScopeError> {
        if let Some(err) = *self.inner.state.borrow() {
            return Some(err);
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Some(ScopeError::DeadlineExceeded);
            }
        }
        match &self.inner.origin {
            Origin::Background => None,
            Origin::Child { parent } => parent.error(),
            Origin::Merged { sources, .. } => sources.iter().find_map(Scope::error),
        }
    }

    /// Returns `true` once the scope is done.
    pub fn is_done(&self) -> bool {
        self.error().is_some()
    }

    /// Returns `true` for scopes produced by [`Scope::merge`].
    pub fn is_derived(&self) -> bool {
        matches!(self.inner.origin, Origin::Merged { .. })
    }

    /// The deadline of this scope, not including ancestors.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Returns `true` if both handles refer to the same scope.
    pub fn ptr_eq(a: &Scope, b: &Scope) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Resolves once the scope is done.
    pub fn done(&self) -> BoxFuture<'_, ScopeError> {
        Box::pin(async move {
            let mut changes = self.inner.state.subscribe();
            loop {
                if let Some(err) = self.error() {
                    return err;
                }
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            // unreachable while `self` holds the sender
                            return ScopeError::Cancelled;
                        }
                    }
                    _ = sleep_until(self.inner.deadline) => {}
                    _ = self.upstream_done() => {}
                }
            }
        })
    }

    fn upstream_done(&self) -> BoxFuture<'_, ScopeError> {
        match &self.inner.origin {
            Origin::Background => Box::pin(std::future::pending()),
            Origin::Child { parent } => parent.done(),
            Origin::Merged { watched: true, .. } => Box::pin(std::future::pending()),
            Origin::Merged {
                sources: [a, b],
                watched: false,
            } => Box::pin(first_done(a, b)),
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let origin = match self.inner.origin {
            Origin::Background => "background",
            Origin::Child { .. } => "child",
            Origin::Merged { .. } => "merged",
        };
        f.debug_struct("Scope")
            .field("origin", &origin)
            .field("deadline", &self.inner.deadline)
            .field("error", &self.error())
            .finish()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn first_done<'a>(a: &'a Scope, b: &'a Scope) -> impl Future<Output = ScopeError> + Send + 'a {
    async move {
        tokio::select! {
            err = a.done() => err,
            err = b.done() => err,
        }
    }
}

/// Watcher for one merge. Exits when a source fires, the merged scope fires,
/// or every handle to the merged scope is gone.
async fn watch_sources(
    merged: Weak<ScopeInner>,
    mut merged_state: watch::Receiver<Option<ScopeError>>,
    a: Scope,
    b: Scope,
) {
    let fired = tokio::select! {
        err = first_done(&a, &b) => Some(err),
        _ = merged_finished(&mut merged_state) => None,
    };
    if let (Some(err), Some(inner)) = (fired, merged.upgrade()) {
        inner.latch(err);
    }
}

async fn merged_finished(state: &mut watch::Receiver<Option<ScopeError>>) {
    loop {
        if state.borrow_and_update().is_some() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
