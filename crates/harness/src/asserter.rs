//! Aggregating assertions for leaf validators.
//!
//! An [`Asserter`] records many independent checks and reports them as one
//! error. The engine never uses it; it exists so that a [`Check`] can verify
//! several properties in one attempt and still report all of them:
//!
//! ```
//! use harness::Asserter;
//!
//! let mut asserter = Asserter::new();
//! asserter.check(1 + 1 == 2, "arithmetic");
//! asserter.check("pod".len() == 4, "pod name length");
//!
//! let err = asserter.error().unwrap();
//! assert_eq!(err.to_string(), "1 of 2 checks failed: pod name length");
//! ```
//!
//! [`Check`]: crate::Check

use thiserror::Error;

/// The failures collected by an [`Asserter`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} of {checks} checks failed: {}", .failures.len(), .failures.join("; "))]
pub struct AssertionFailures {
    /// Number of checks performed.
    pub checks: usize,
    /// Failure messages in the order they were recorded.
    pub failures: Vec<String>,
}

/// Accumulates pass/fail checks.
#[derive(Debug, Clone, Default)]
pub struct Asserter {
    failures: Vec<String>,
    checks: usize,
    successes: usize,
}

impl Asserter {
    /// An asserter with no checks recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a check that passed iff `ok`.
    pub fn check(&mut self, ok: bool, message: impl Into<String>) -> bool {
        self.checks += 1;
        if ok {
            self.successes += 1;
        } else {
            self.failures.push(message.into());
        }
        ok
    }

    /// Records a check that passed iff `result` is `Ok`.
    pub fn check_error<T, E: std::fmt::Display>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => {
                self.check(true, String::new());
                Some(value)
            }
            Err(err) => {
                self.check(false, err.to_string());
                None
            }
        }
    }

    /// Number of checks recorded.
    pub fn checks(&self) -> usize {
        self.checks
    }

    /// Number of checks that passed.
    pub fn successes(&self) -> usize {
        self.successes
    }

    /// Number of checks that failed.
    pub fn failures(&self) -> usize {
        self.failures.len()
    }

    /// The collected failures, or `None` if every check passed.
    pub fn error(&self) -> Option<AssertionFailures> {
        if self.failures.is_empty() {
            return None;
        }
        Some(AssertionFailures {
            checks: self.checks,
            failures: self.failures.clone(),
        })
    }

    /// [`Asserter::error`] as a `Result`, ready to return from a check.
    pub fn result(&self) -> Result<(), AssertionFailures> {
        self.error().map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_every_check() {
        for n in 0..6usize {
            for k in 0..=n {
                let mut asserter = Asserter::new();
                for i in 0..n {
                    if i < k {
                        asserter.check_error::<(), _>(Err(format!("failure {i}")));
                    } else {
                        asserter.check(true, "ok");
                    }
                }

                assert_eq!(asserter.checks(), n);
                assert_eq!(asserter.failures(), k);
                assert_eq!(asserter.checks(), asserter.successes() + asserter.failures());
                assert_eq!(asserter.error().is_none(), k == 0);
            }
        }
    }

    #[test]
    fn error_keeps_failures_in_order() {
        let mut asserter = Asserter::new();
        asserter.check(false, "first");
        asserter.check_error(Ok::<_, String>(3));
        asserter.check_error::<(), _>(Err("second"));

        let err = asserter.result().unwrap_err();

        assert_eq!(err.failures, vec!["first", "second"]);
        assert_eq!(err.to_string(), "2 of 3 checks failed: first; second");
    }

    #[test]
    fn check_error_returns_the_value() {
        let mut asserter = Asserter::new();

        assert_eq!(asserter.check_error(Ok::<_, String>(7)), Some(7));
        assert_eq!(asserter.check_error::<u8, _>(Err("bad")), None);
    }
}
