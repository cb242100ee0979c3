//! Newtype identifiers for the run tree.
//!
//! Every node of an execution tree is addressed by a [`RunHandle`] into the
//! tree's arena, and every tree as a whole by a [`RootRunId`]. Keeping these as
//! distinct newtypes prevents mixing a handle from one tree with another's
//! sequence number even though both are integers underneath.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for u32-wrapped newtypes.
// Generates: struct (Copy), const new(), as_u32(), Display.
// ---------------------------------------------------------------------------
macro_rules! u32_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub const fn new(value: u32) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

u32_id! {
    /// Index of a run node inside its tree's arena.
    ///
    /// Handles are only meaningful together with the tree that issued them.
    RunHandle
}

impl RunHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

u32_id! {
    /// Position of a run among its parent's children, starting at 1.
    Sequence
}

// ---------------------------------------------------------------------------
// Root identity
// ---------------------------------------------------------------------------

/// Identifies one execution tree.
///
/// Generated fresh for every root run; attached to tracing spans so that all
/// activity from one tree can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RootRunId(Uuid);

impl RootRunId {
    /// Generates a new random root identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for RootRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Run kinds
// ---------------------------------------------------------------------------

/// What kind of execution unit a run node represents.
///
/// The kind contributes one letter to the node's path-like id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// The root of a tree.
    Root,
    /// One execution of a [`crate::Phase`].
    Phase,
    /// One step being processed.
    Step,
    /// A sub-step nested in a step.
    Substep,
    /// A step's mutating action.
    Modify,
    /// One validator invocation.
    Validate,
    /// A teardown step or a stacked teardown action.
    Teardown,
    /// A finalization pass.
    Finalize,
    /// Entry into a named scope; resets the id to a flat host path.
    Named,
}

impl RunKind {
    /// The letter used for this kind in run ids.
    pub fn letter(self) -> char {
        match self {
            Self::Root => 'r',
            Self::Phase => 'p',
            Self::Step => 's',
            Self::Substep => 'u',
            Self::Modify => 'm',
            Self::Validate => 'v',
            Self::Teardown => 't',
            Self::Finalize => 'f',
            Self::Named => 'n',
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}
