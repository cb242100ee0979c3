//! Shared value types: timestamps and the run report.
//!
//! The report is the harness's record of everything that did not surface as
//! a returned error: named scopes that failed in isolation, skipped steps,
//! teardown failures, and finalization passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Report records
// ---------------------------------------------------------------------------

/// What a [`ScopeRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A named step scope.
    Named,
    /// A step that was skipped.
    Step,
    /// A teardown step or stacked teardown action.
    Teardown,
    /// A finalization pass.
    Finalize,
}

/// Outcome of a recorded scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    /// Completed without error.
    Passed,
    /// Failed; `message` is the rendered error chain.
    Failed {
        /// Rendered error.
        message: String,
    },
    /// Not executed.
    Skipped,
}

impl RecordStatus {
    /// Returns `true` for [`RecordStatus::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// One entry in a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    /// Id of the run the record belongs to.
    pub run_id: String,
    /// Step name or other human label.
    pub label: String,
    /// What kind of scope this is.
    pub kind: RecordKind,
    /// How it ended.
    #[serde(flatten)]
    pub status: RecordStatus,
    /// When the record was written.
    pub at: Timestamp,
}

/// Everything recorded at a root run, in the order it happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Records in insertion order.
    pub records: Vec<ScopeRecord>,
}

impl RunReport {
    /// Returns `true` if any record failed.
    pub fn has_failures(&self) -> bool {
        self.records.iter().any(|r| r.status.is_failed())
    }

    /// Iterates over failed records.
    pub fn failures(&self) -> impl Iterator<Item = &ScopeRecord> {
        self.records.iter().filter(|r| r.status.is_failed())
    }

    /// Iterates over records of `kind`.
    pub fn of_kind(&self, kind: RecordKind) -> impl Iterator<Item = &ScopeRecord> {
        self.records.iter().filter(move |r| r.kind == kind)
    }

    /// Serialises the report as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
