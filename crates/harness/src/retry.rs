//! General-purpose retry engine.
//!
//! [`run`] invokes a unit of work repeatedly, one [`RetryOptions::interval`]
//! apart, until the success criteria are met, the failure budget runs out, or
//! the cancellation scope finishes.
//!
//! ## Accounting
//!
//! - The first `allow` attempts may fail without consuming `retries`.
//! - The first `ignore` successes are not counted toward `ensure`.
//! - `ensure` consecutive counted successes (minimum 1) end the loop.
//! - Any failure resets both the ignored and the counted successes.
//! - A failure after the allow window with no retries left ends the loop,
//!   unless `keep_trying` is set.
//!
//! The scope is checked before every attempt; that check is the only place
//! cancellation ends a loop.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::errors::ScopeError;
use crate::scope::Scope;
use crate::types::Timestamp;

/// Spacing between attempts when [`RetryOptions::interval`] is zero.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Retry policy for one unit of work.
///
/// The all-zero value ([`RetryOptions::default`]) means "no policy
/// configured"; callers substitute their own default for it with
/// [`RetryOptions::or`].
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Initial attempts whose failures do not consume `retries`.
    pub allow: u32,
    /// Initial successes that are not counted toward `ensure`.
    pub ignore: u32,
    /// Consecutive counted successes required. Zero is treated as one.
    pub ensure: u32,
    /// Failures tolerated after the allow window.
    pub retries: u32,
    /// Ignore `retries`; only cancellation or timeout stops the loop.
    pub keep_trying: bool,
    /// Spacing between attempts. Zero means [`DEFAULT_INTERVAL`].
    pub interval: Duration,
    /// Cancellation scope for the whole loop.
    pub scope: Option<Scope>,
    /// Overall time limit, measured from the start of the loop.
    pub timeout: Option<Duration>,
}

impl RetryOptions {
    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self {
            ensure: 1,
            ..Self::default()
        }
    }

    /// A policy carrying only a cancellation scope.
    pub fn scoped(scope: Scope) -> Self {
        Self {
            scope: Some(scope),
            ..Self::default()
        }
    }

    /// Sets `retries`.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets `allow`.
    pub fn with_allow(mut self, allow: u32) -> Self {
        self.allow = allow;
        self
    }

    /// Sets `ignore`.
    pub fn with_ignore(mut self, ignore: u32) -> Self {
        self.ignore = ignore;
        self
    }

    /// Sets `ensure`.
    pub fn with_ensure(mut self, ensure: u32) -> Self {
        self.ensure = ensure;
        self
    }

    /// Sets `keep_trying`.
    pub fn keep_trying(mut self) -> Self {
        self.keep_trying = true;
        self
    }

    /// Sets `interval`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets `scope`.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Sets `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns `true` iff every field is at its zero value.
    pub fn is_empty(&self) -> bool {
        self.allow == 0
            && self.ignore == 0
            && self.ensure == 0
            && self.retries == 0
            && !self.keep_trying
            && self.interval.is_zero()
            && self.scope.is_none()
            && self.timeout.is_none()
    }

    /// Returns `self`, or `default` when `self` is empty.
    pub fn or(&self, default: &RetryOptions) -> RetryOptions {
        if self.is_empty() {
            default.clone()
        } else {
            self.clone()
        }
    }

    /// Field-wise maximum of two policies; booleans are OR'd.
    ///
    /// An empty policy is the identity. When both carry a scope the result
    /// carries [`Scope::merge`] of the two.
    pub fn max(&self, other: &RetryOptions) -> RetryOptions {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        RetryOptions {
            allow: self.allow.max(other.allow),
            ignore: self.ignore.max(other.ignore),
            ensure: self.ensure.max(other.ensure),
            retries: self.retries.max(other.retries),
            keep_trying: self.keep_trying || other.keep_trying,
            interval: self.interval.max(other.interval),
            scope: match (&self.scope, &other.scope) {
                (Some(a), Some(b)) => Some(Scope::merge(a, b)),
                (Some(a), None) => Some(a.clone()),
                (None, b) => b.clone(),
            },
            timeout: self.timeout.max(other.timeout),
        }
    }

    /// The interval actually waited between attempts.
    pub fn effective_interval(&self) -> Duration {
        if self.interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            self.interval
        }
    }

    /// The number of consecutive counted successes actually required.
    pub fn effective_ensure(&self) -> u32 {
        self.ensure.max(1)
    }
}

// ---------------------------------------------------------------------------
// Attempt log
// ---------------------------------------------------------------------------

/// How one attempt was classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Success counted toward `ensure`.
    Counted,
    /// Success consumed from the `ignore` budget.
    Ignored,
    /// Failure inside the allow window.
    Allowed {
        /// Rendered error.
        message: String,
    },
    /// Failure charged against `retries` (or tolerated by `keep_trying`).
    Failed {
        /// Rendered error.
        message: String,
    },
}

/// One invocation of the unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Classification of the result.
    pub outcome: AttemptOutcome,
    /// When the attempt finished.
    pub at: Timestamp,
}

/// Everything a retry loop produced.
#[derive(Debug)]
pub struct RetryOutcome<E> {
    /// Attempts in the order they ran.
    pub attempts: Vec<Attempt>,
    /// `Ok` on success, the last failure on exhaustion, or the scope error.
    pub result: Result<(), E>,
}

impl<E> RetryOutcome<E> {
    /// Drops the attempt log.
    pub fn into_result(self) -> Result<(), E> {
        self.result
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs `unit` under `options`.
///
/// Cancellation and timeouts surface as `E::from(ScopeError)`; exhaustion
/// surfaces as the last error returned by `unit`.
pub async fn run<F, Fut, E>(options: &RetryOptions, mut unit: F) -> RetryOutcome<E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: From<ScopeError> + Display,
{
    let base = options.scope.clone().unwrap_or_else(Scope::background);
    let scope = match options.timeout {
        Some(timeout) => base.with_timeout(timeout),
        None => base,
    };
    let ensure = options.effective_ensure();
    let interval = options.effective_interval();

    let mut attempts: Vec<Attempt> = Vec::new();
    let mut ignored = 0u32;
    let mut counted = 0u32;
    let mut retries_left = options.retries;

    loop {
        if let Some(err) = scope.error() {
            debug!(attempts = attempts.len(), error = %err, "retry loop stopped by scope");
            return RetryOutcome {
                attempts,
                result: Err(err.into()),
            };
        }

        let number = attempts.len() as u32 + 1;
        match unit().await {
            Ok(()) => {
                if ignored < options.ignore {
                    ignored += 1;
                    attempts.push(attempt(number, AttemptOutcome::Ignored));
                } else {
                    counted += 1;
                    attempts.push(attempt(number, AttemptOutcome::Counted));
                    if counted >= ensure {
                        trace!(attempts = number, "retry loop succeeded");
                        return RetryOutcome {
                            attempts,
                            result: Ok(()),
                        };
                    }
                }
            }
            Err(err) => {
                ignored = 0;
                counted = 0;
                let message = err.to_string();
                if number <= options.allow {
                    attempts.push(attempt(number, AttemptOutcome::Allowed { message }));
                } else if options.keep_trying {
                    attempts.push(attempt(number, AttemptOutcome::Failed { message }));
                } else if retries_left == 0 {
                    debug!(attempts = number, error = %err, "retry budget exhausted");
                    attempts.push(attempt(number, AttemptOutcome::Failed { message }));
                    return RetryOutcome {
                        attempts,
                        result: Err(err),
                    };
                } else {
                    retries_left -= 1;
                    attempts.push(attempt(number, AttemptOutcome::Failed { message }));
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = scope.done() => {}
        }
    }
}

fn attempt(number: u32, outcome: AttemptOutcome) -> Attempt {
    Attempt {
        number,
        outcome,
        at: Timestamp::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error, PartialEq)]
    enum UnitError {
        #[error("unit failed")]
        Failed,
        #[error(transparent)]
        Scope(#[from] ScopeError),
    }

    /// A unit of work that replays `script` (true = success) and then keeps
    /// failing.
    fn scripted(
        script: Vec<bool>,
    ) -> (
        impl FnMut() -> std::future::Ready<Result<(), UnitError>>,
        Arc<AtomicUsize>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let unit = move || {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let ok = script.get(index).copied().unwrap_or(false);
            std::future::ready(if ok { Ok(()) } else { Err(UnitError::Failed) })
        };
        (unit, calls)
    }

    fn fast() -> RetryOptions {
        RetryOptions::default().with_interval(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn allowed_failures_then_ignored_then_ensured_successes_succeed() {
        for allow in 0..3u32 {
            for failures in 0..=allow {
                for ignore in 0..3u32 {
                    for ensure in 1..4u32 {
                        for retries in 0..2u32 {
                            let mut script = vec![false; failures as usize];
                            script.extend(vec![true; (ignore + ensure) as usize]);
                            let options = RetryOptions {
                                allow,
                                ignore,
                                ensure,
                                retries,
                                ..fast()
                            };
                            let (unit, calls) = scripted(script.clone());

                            let outcome = run(&options, unit).await;

                            assert_eq!(
                                outcome.result,
                                Ok(()),
                                "allow={allow} failures={failures} ignore={ignore} ensure={ensure} retries={retries}"
                            );
                            assert_eq!(calls.load(Ordering::SeqCst), script.len());
                        }
                    }
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_among_ensured_successes_fails_once_budget_is_spent() {
        for allow in 0..3u32 {
            for ignore in 0..3u32 {
                for ensure in 1..4u32 {
                    for retries in 0..3u32 {
                        for broken in 0..ensure {
                            let mut script = vec![false; allow as usize];
                            script.extend(vec![true; (ignore + broken) as usize]);
                            // one failure in place of an ensured success, plus
                            // enough further failures to spend the retry budget
                            script.extend(vec![false; retries as usize + 1]);
                            script.extend(vec![true; (ignore + ensure) as usize]);
                            let options = RetryOptions {
                                allow,
                                ignore,
                                ensure,
                                retries,
                                ..fast()
                            };
                            let expected_calls = (allow + ignore + broken + retries + 1) as usize;
                            let (unit, calls) = scripted(script);

                            let outcome = run(&options, unit).await;

                            assert_eq!(outcome.result, Err(UnitError::Failed));
                            assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
                        }
                    }
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_resets_ignored_successes() {
        let options = RetryOptions {
            ignore: 1,
            ensure: 1,
            retries: 1,
            ..fast()
        };
        let (unit, calls) = scripted(vec![true, false, true, true]);

        let outcome = run(&options, unit).await;

        assert_eq!(outcome.result, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let kinds: Vec<&AttemptOutcome> = outcome.attempts.iter().map(|a| &a.outcome).collect();
        assert_eq!(kinds[0], &AttemptOutcome::Ignored);
        assert!(matches!(kinds[1], AttemptOutcome::Failed { .. }));
        assert_eq!(kinds[2], &AttemptOutcome::Ignored);
        assert_eq!(kinds[3], &AttemptOutcome::Counted);
    }

    #[tokio::test(start_paused = true)]
    async fn allowed_failures_are_not_charged() {
        let options = RetryOptions {
            allow: 2,
            ..fast()
        };
        let (unit, _) = scripted(vec![false, false, true]);

        let outcome = run(&options, unit).await;

        assert_eq!(outcome.result, Ok(()));
        assert!(matches!(
            outcome.attempts[0].outcome,
            AttemptOutcome::Allowed { .. }
        ));
        assert!(matches!(
            outcome.attempts[1].outcome,
            AttemptOutcome::Allowed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_trying_runs_until_timeout() {
        let options = RetryOptions::default()
            .keep_trying()
            .with_interval(Duration::from_secs(1))
            .with_timeout(Duration::from_millis(5_500));
        let (unit, calls) = scripted(Vec::new());

        let outcome = run(&options, unit).await;

        assert_eq!(outcome.result, Err(UnitError::Scope(ScopeError::DeadlineExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_trying_stops_on_cancellation() {
        let scope = Scope::background();
        let options = RetryOptions::default().keep_trying().with_scope(scope.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3_500)).await;
            scope.cancel();
        });
        let (unit, calls) = scripted(Vec::new());

        let outcome = run(&options, unit).await;
        canceller.await.unwrap();

        assert_eq!(outcome.result, Err(UnitError::Scope(ScopeError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn done_scope_returns_before_first_attempt() {
        let scope = Scope::background();
        scope.cancel();
        let (unit, calls) = scripted(vec![true]);

        let outcome = run(&RetryOptions::scoped(scope), unit).await;

        assert_eq!(outcome.result, Err(UnitError::Scope(ScopeError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(outcome.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_waits_the_default_tick() {
        let start = tokio::time::Instant::now();
        let (unit, _) = scripted(vec![false, true]);

        let outcome = run(&RetryOptions::once().with_retries(1), unit).await;

        assert_eq!(outcome.result, Ok(()));
        assert!(start.elapsed() >= DEFAULT_INTERVAL);
    }

    #[test]
    fn is_empty_only_for_zero_policy() {
        assert!(RetryOptions::default().is_empty());
        assert!(!RetryOptions::once().is_empty());
        assert!(!RetryOptions::default().keep_trying().is_empty());
        assert!(!RetryOptions::scoped(Scope::background()).is_empty());
        assert!(!RetryOptions::default()
            .with_interval(Duration::from_millis(1))
            .is_empty());
    }

    #[test]
    fn or_substitutes_default_for_empty_policy() {
        let fallback = RetryOptions::once().with_retries(4);

        assert_eq!(RetryOptions::default().or(&fallback).retries, 4);
        assert_eq!(RetryOptions::once().or(&fallback).retries, 0);
    }

    #[test]
    fn max_with_empty_is_identity() {
        let x = RetryOptions {
            allow: 1,
            ignore: 2,
            ensure: 3,
            retries: 4,
            keep_trying: false,
            interval: Duration::from_millis(250),
            scope: None,
            timeout: Some(Duration::from_secs(9)),
        };

        for merged in [x.max(&RetryOptions::default()), RetryOptions::default().max(&x)] {
            assert_eq!(merged.allow, 1);
            assert_eq!(merged.ignore, 2);
            assert_eq!(merged.ensure, 3);
            assert_eq!(merged.retries, 4);
            assert!(!merged.keep_trying);
            assert_eq!(merged.interval, Duration::from_millis(250));
            assert_eq!(merged.timeout, Some(Duration::from_secs(9)));
        }
    }

    #[test]
    fn max_is_commutative_for_numeric_fields() {
        let x = RetryOptions {
            allow: 3,
            ensure: 1,
            interval: Duration::from_secs(2),
            ..RetryOptions::default()
        };
        let y = RetryOptions {
            ignore: 2,
            ensure: 5,
            retries: 7,
            keep_trying: true,
            timeout: Some(Duration::from_secs(1)),
            ..RetryOptions::default()
        };

        let xy = x.max(&y);
        let yx = y.max(&x);

        for merged in [&xy, &yx] {
            assert_eq!(merged.allow, 3);
            assert_eq!(merged.ignore, 2);
            assert_eq!(merged.ensure, 5);
            assert_eq!(merged.retries, 7);
            assert!(merged.keep_trying);
            assert_eq!(merged.interval, Duration::from_secs(2));
            assert_eq!(merged.timeout, Some(Duration::from_secs(1)));
        }
    }

    #[tokio::test]
    async fn max_merges_scopes_without_linking_cancellation_back() {
        let a = Scope::background();
        let b = Scope::background();
        let merged = RetryOptions::scoped(a.clone())
            .max(&RetryOptions::scoped(b.clone()))
            .scope
            .expect("merged scope");

        merged.cancel();
        assert_eq!(a.error(), None);
        assert_eq!(b.error(), None);

        let merged = RetryOptions::scoped(a.clone())
            .max(&RetryOptions::scoped(b.clone()))
            .scope
            .expect("merged scope");
        a.cancel();
        assert_eq!(merged.error(), Some(ScopeError::Cancelled));
        assert_eq!(b.error(), None);
    }
}
