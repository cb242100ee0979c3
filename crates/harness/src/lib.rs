//! Orchestration core for Gauntlet end-to-end test suites.
//!
//! A test suite is a tree of [`Run`]s. Callers describe work as [`Step`]s,
//! group them into [`Phase`]s, and let the engine drive them: it applies the
//! registered [`Disruptor`]s, executes mutating actions, recurses into
//! sub-steps, retries validators under a [`RetryOptions`] policy, and re-runs
//! deferred validators at finalization.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate reads no environment
//! variables and installs no tracing subscriber. Configuration arrives as an
//! explicit [`HarnessConfig`]; the `environment` crate adapts the process
//! environment into one.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`errors`] | `HarnessError`, `ScopeError`, `ConfigError` |
//! | [`identifiers`] | `RunHandle`, `Sequence`, `RootRunId`, `RunKind` |
//! | [`types`] | `Timestamp` and the `RunReport` |
//! | [`config`] | `HarnessConfig` and disruptor selections |
//! | [`scope`] | Cancellation scopes and scope merging |
//! | [`retry`] | The retry engine and its attempt log |
//! | [`capability`] | `Action`, `Check`, `Releasable` and closure adapters |
//! | [`disruptor`] | The disruptor capability traits |
//! | [`run`] | The run tree: identity, scopes, root-owned state |
//! | [`step`] | `Step` and step processing |
//! | [`phase`] | `Phase`: Setup / MainSteps / Teardown |
//! | [`finalize`] | Deferred validators and finalization |
//! | [`asserter`] | `Asserter` for leaf validators |
//!
//! ## Example
//!
//! A failing named step does not stop its siblings; it fails the tree when
//! the root is finalized.
//!
//! ```no_run
//! use harness::{check_fn, HarnessConfig, Phase, Run, Step};
//!
//! # async fn demo() -> Result<(), harness::HarnessError> {
//! let root = Run::root("upgrade", HarnessConfig::default());
//! let mut phase = Phase::new().with_main([Step::new()
//!     .with_validator(check_fn(|_run| async { Ok(()) }))]);
//! phase.run_in(&root).await?;
//! root.finalize().await?;
//! root.cleanup();
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod asserter;
pub mod capability;
pub mod config;
pub mod disruptor;
pub mod errors;
pub mod finalize;
pub mod identifiers;
pub mod phase;
pub mod retry;
pub mod run;
pub mod scope;
pub mod step;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

/// A boxed, sendable future; used where step processing recurses.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use asserter::{Asserter, AssertionFailures};
pub use capability::{action_fn, check_fn, releasable, teardown_of, Action, Check, Releasable};
pub use config::{DisruptorSelection, HarnessConfig, DEFAULT_FINAL_INTERVAL, DEFAULT_FINAL_RETRIES};
pub use disruptor::{
    Configurable, Disruptor, Inspector, PostMainSetupHook, PostSubtestFinalizerHook,
    PreFinalizerHook, ValidationResultHook,
};
pub use errors::{ConfigError, HarnessError, ScopeError};
pub use finalize::DeferredValidation;
pub use identifiers::{RootRunId, RunHandle, RunKind, Sequence};
pub use phase::Phase;
pub use retry::{Attempt, AttemptOutcome, RetryOptions, RetryOutcome, DEFAULT_INTERVAL};
pub use run::{Activation, Run, RunTree};
pub use scope::Scope;
pub use step::Step;
pub use types::{RecordKind, RecordStatus, RunReport, ScopeRecord, Timestamp};
