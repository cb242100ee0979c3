//! The run tree: identity, scopes, and root-owned bookkeeping.
//!
//! Every execution unit (phase, step, action, validator invocation, teardown,
//! finalization) gets its own [`Run`]. Runs live in an arena ([`RunTree`])
//! owned jointly by every handle into it; a [`Run`] is just the arena plus a
//! [`RunHandle`]. Nodes record their parent handle and hand out child
//! sequence numbers from a per-node counter, so there are no parent/child
//! pointer cycles.
//!
//! ## Identity
//!
//! A node's id is its parent's id followed by `.`, its kind letter and its
//! sequence (`checkout.p1.s2.v1`). Named scopes enter the host namespace and
//! reset to a flat path (`checkout/create_site`), de-duplicated with a `#NN`
//! suffix the way test runners name repeated subtests.
//!
//! ## Root-owned state
//!
//! The root holds the registered disruptors, the deferred validator lists,
//! the once-per-root hook guards, the skip flag, the [`RunReport`] and the
//! scopes to cancel on cleanup. The tree is walked sequentially; locks guard
//! the arena only for the length of a lookup and are never held across an
//! `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard};

use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::disruptor::Disruptor;
use crate::errors::{ConfigError, HarnessError};
use crate::finalize::DeferredValidation;
use crate::identifiers::{RootRunId, RunHandle, RunKind, Sequence};
use crate::scope::Scope;
use crate::types::{RecordKind, RecordStatus, RunReport, ScopeRecord, Timestamp};

const ROOT: RunHandle = RunHandle::new(0);

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// The arena behind one execution tree.
pub struct RunTree {
    root_id: RootRunId,
    config: HarnessConfig,
    nodes: RwLock<Vec<RunNode>>,
    state: Mutex<RootState>,
}

struct RunNode {
    kind: RunKind,
    sequence: Sequence,
    parent: Option<RunHandle>,
    /// Host path; set for the root and for named nodes.
    path: Option<String>,
    name: Option<String>,
    next_child: AtomicU32,
    scope: OnceLock<Scope>,
}

#[derive(Default)]
struct RootState {
    disruptors: Option<Vec<Arc<dyn Disruptor>>>,
    final_validators: Vec<DeferredValidation>,
    sub_final_validators: HashMap<RunHandle, Vec<DeferredValidation>>,
    post_main_setup_fired: bool,
    pre_finalizer_fired: bool,
    skip_reason: Option<String>,
    report: RunReport,
    host_paths: HashMap<String, u32>,
    cleanups: Vec<Scope>,
}

impl RunTree {
    fn read_nodes(&self) -> RwLockReadGuard<'_, Vec<RunNode>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, RootState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RunTree {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for scope in state.cleanups.drain(..) {
            scope.cancel();
        }
    }
}

/// Result of [`Run::allow_disruptors`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// Every selection matched; the listed disruptors are registered in order.
    Active {
        /// Activation keys of the registered disruptors.
        names: Vec<String>,
    },
    /// A selection named an unavailable disruptor; the whole run is skipped.
    Skipped {
        /// Human-readable reason.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Run handle
// ---------------------------------------------------------------------------

/// A node of an execution tree.
///
/// Cloning a `Run` clones the handle, not the node.
#[derive(Clone)]
pub struct Run {
    tree: Arc<RunTree>,
    handle: RunHandle,
}

impl Run {
    /// Creates the root of a new tree.
    ///
    /// `name` becomes the root's id and the base of every named path.
    pub fn root(name: impl Into<String>, config: HarnessConfig) -> Self {
        let name = sanitize(&name.into());
        let root = RunNode {
            kind: RunKind::Root,
            sequence: Sequence::new(0),
            parent: None,
            path: Some(name.clone()),
            name: Some(name),
            next_child: AtomicU32::new(0),
            scope: OnceLock::new(),
        };
        let tree = RunTree {
            root_id: RootRunId::new_random(),
            config,
            nodes: RwLock::new(vec![root]),
            state: Mutex::new(RootState::default()),
        };
        Self {
            tree: Arc::new(tree),
            handle: ROOT,
        }
    }

    fn with_node<R>(&self, f: impl FnOnce(&RunNode) -> R) -> R {
        let nodes = self.tree.read_nodes();
        f(&nodes[self.handle.index()])
    }

    pub(crate) fn at(&self, handle: RunHandle) -> Run {
        Run {
            tree: self.tree.clone(),
            handle,
        }
    }

    // -- identity -----------------------------------------------------------

    /// Arena handle of this node.
    pub fn handle(&self) -> RunHandle {
        self.handle
    }

    /// Identifier shared by every node of this tree.
    pub fn root_id(&self) -> RootRunId {
        self.tree.root_id
    }

    /// Kind of this node.
    pub fn kind(&self) -> RunKind {
        self.with_node(|node| node.kind)
    }

    /// Position among the parent's children (0 for the root).
    pub fn sequence(&self) -> Sequence {
        self.with_node(|node| node.sequence)
    }

    /// Name given to the root or to a named scope.
    pub fn name(&self) -> Option<String> {
        self.with_node(|node| node.name.clone())
    }

    /// Parent node, `None` for the root.
    pub fn parent(&self) -> Option<Run> {
        self.with_node(|node| node.parent).map(|handle| self.at(handle))
    }

    /// The root of this tree.
    pub fn root_run(&self) -> Run {
        self.at(ROOT)
    }

    /// Returns `true` for the root.
    pub fn is_root(&self) -> bool {
        self.handle == ROOT
    }

    /// Returns `true` for the root and for named scopes.
    pub fn is_named(&self) -> bool {
        self.with_node(|node| node.path.is_some())
    }

    /// Path-like id, unique within the tree.
    pub fn id(&self) -> String {
        let nodes = self.tree.read_nodes();
        let mut segments = Vec::new();
        let mut cursor = &nodes[self.handle.index()];
        loop {
            if let Some(path) = &cursor.path {
                segments.push(path.clone());
                break;
            }
            segments.push(format!("{}{}", cursor.kind.letter(), cursor.sequence));
            match cursor.parent {
                Some(parent) => cursor = &nodes[parent.index()],
                None => break,
            }
        }
        segments.reverse();
        segments.join(".")
    }

    /// The nearest named ancestor, including `self`. Falls back to the root.
    pub fn nearest_named(&self) -> Run {
        let nodes = self.tree.read_nodes();
        let mut handle = self.handle;
        loop {
            let node = &nodes[handle.index()];
            if node.path.is_some() {
                return self.at(handle);
            }
            match node.parent {
                Some(parent) => handle = parent,
                None => return self.root_run(),
            }
        }
    }

    /// Settings of this tree.
    pub fn config(&self) -> &HarnessConfig {
        &self.tree.config
    }

    /// A tracing span carrying this run's id and the tree's root id.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("run", id = %self.id(), root = %self.tree.root_id)
    }

    // -- children -----------------------------------------------------------

    /// Creates a child that shares this node's scope.
    pub fn child(&self, kind: RunKind) -> Run {
        self.push_child(kind, None, None, None)
    }

    /// Creates a child with its own scope.
    pub fn child_with_scope(&self, kind: RunKind, scope: Scope) -> Run {
        self.push_child(kind, None, None, Some(scope))
    }

    /// Enters a named scope under this node.
    ///
    /// The child's id is the host path of the nearest named ancestor plus
    /// `/name`; repeated names get `#01`, `#02`, ... suffixes.
    pub fn named(&self, name: &str) -> Run {
        let name = sanitize(name);
        let base = self.nearest_named().with_node(|node| node.path.clone());
        let base = base.unwrap_or_default();
        let candidate = format!("{base}/{name}");
        let path = {
            let mut state = self.tree.state();
            let seen = state.host_paths.entry(candidate.clone()).or_insert(0);
            let path = if *seen == 0 {
                candidate
            } else {
                format!("{candidate}#{seen:02}")
            };
            *seen += 1;
            path
        };
        self.push_child(RunKind::Named, Some(path), Some(name), None)
    }

    fn push_child(
        &self,
        kind: RunKind,
        path: Option<String>,
        name: Option<String>,
        scope: Option<Scope>,
    ) -> Run {
        let (sequence, inherited) = self.with_node(|parent| {
            let sequence = parent.next_child.fetch_add(1, Ordering::Relaxed) + 1;
            (sequence, parent.scope.get().cloned())
        });
        let node = RunNode {
            kind,
            sequence: Sequence::new(sequence),
            parent: Some(self.handle),
            path,
            name,
            next_child: AtomicU32::new(0),
            scope: OnceLock::new(),
        };
        if let Some(scope) = scope.or(inherited) {
            let _ = node.scope.set(scope);
        }

        let mut nodes = self.tree.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let handle = RunHandle::new(nodes.len() as u32);
        nodes.push(node);
        self.at(handle)
    }

    // -- scope --------------------------------------------------------------

    /// The nearest scope in this node's ancestry.
    ///
    /// When no ancestor has one, a background scope is created on this node
    /// and registered to be cancelled on [`Run::cleanup`].
    pub fn scope(&self) -> Scope {
        {
            let nodes = self.tree.read_nodes();
            let mut cursor = Some(self.handle);
            while let Some(handle) = cursor {
                let node = &nodes[handle.index()];
                if let Some(scope) = node.scope.get() {
                    return scope.clone();
                }
                cursor = node.parent;
            }
        }

        let fresh = Scope::background();
        let scope = self.with_node(|node| match node.scope.set(fresh.clone()) {
            Ok(()) => fresh,
            Err(_) => node.scope.get().cloned().unwrap_or(fresh),
        });
        self.tree.state().cleanups.push(scope.clone());
        scope
    }

    /// Cancels every scope registered for cleanup in this tree.
    pub fn cleanup(&self) {
        let scopes: Vec<Scope> = self.tree.state().cleanups.drain(..).collect();
        for scope in scopes {
            scope.cancel();
        }
    }

    // -- disruptors ---------------------------------------------------------

    /// Registers the disruptors selected by the tree's configuration.
    ///
    /// Each selection must name the [`Disruptor::env_value`] of one of
    /// `candidates`. An unknown name marks the whole tree as skipped. A
    /// `:config` suffix is applied through [`Disruptor::as_configurable`];
    /// a disruptor without that capability is a configuration error.
    /// Registration happens once per tree, at the root.
    pub fn allow_disruptors(
        &self,
        candidates: Vec<Box<dyn Disruptor>>,
    ) -> Result<Activation, HarnessError> {
        let root = self.root_run();
        if self.tree.state().disruptors.is_some() {
            return Err(ConfigError::DisruptorsAlreadySet { root: root.id() }.into());
        }

        let mut pool: Vec<Option<Box<dyn Disruptor>>> = candidates.into_iter().map(Some).collect();
        let mut active: Vec<Arc<dyn Disruptor>> = Vec::new();
        for selection in &self.tree.config.disruptors {
            if active.iter().any(|d| d.env_value() == selection.name) {
                warn!(disruptor = %selection.name, "duplicate disruptor selection ignored");
                continue;
            }
            let slot = pool.iter().position(|candidate| {
                candidate
                    .as_ref()
                    .is_some_and(|d| d.env_value() == selection.name)
            });
            let Some(mut disruptor) = slot.and_then(|index| pool[index].take()) else {
                let reason = format!("disruptor '{}' is not available", selection.name);
                warn!(run = %root.id(), %reason, "skipping run");
                self.tree.state().skip_reason = Some(reason.clone());
                return Ok(Activation::Skipped { reason });
            };

            if let Some(config) = &selection.config {
                let Some(configurable) = disruptor.as_configurable() else {
                    return Err(ConfigError::NotConfigurable {
                        name: selection.name.clone(),
                        config: config.clone(),
                    }
                    .into());
                };
                configurable.configure(config).map_err(|err| {
                    ConfigError::InvalidDisruptorConfig {
                        name: selection.name.clone(),
                        config: config.clone(),
                        reason: format!("{err:#}"),
                    }
                })?;
            }
            active.push(Arc::from(disruptor));
        }

        let names: Vec<String> = active.iter().map(|d| d.env_value().to_string()).collect();
        info!(run = %root.id(), disruptors = ?names, "disruptors registered");
        self.tree.state().disruptors = Some(active);
        Ok(Activation::Active { names })
    }

    /// Disruptors registered at the root, in registration order.
    pub fn disruptors(&self) -> Vec<Arc<dyn Disruptor>> {
        self.tree.state().disruptors.clone().unwrap_or_default()
    }

    /// Why the tree is skipped, if it is.
    pub fn skip_reason(&self) -> Option<String> {
        self.tree.state().skip_reason.clone()
    }

    /// Returns `true` once an activation marked the tree as skipped.
    pub fn is_skipped(&self) -> bool {
        self.skip_reason().is_some()
    }

    // -- once-per-root guards -----------------------------------------------

    pub(crate) fn claim_post_main_setup(&self) -> bool {
        !std::mem::replace(&mut self.tree.state().post_main_setup_fired, true)
    }

    pub(crate) fn claim_pre_finalizer(&self) -> bool {
        !std::mem::replace(&mut self.tree.state().pre_finalizer_fired, true)
    }

    // -- deferred validators ------------------------------------------------

    pub(crate) fn defer_final(&self, deferred: DeferredValidation) {
        enqueue(&mut self.tree.state().final_validators, deferred);
    }

    pub(crate) fn defer_sub_final(&self, deferred: DeferredValidation) {
        let owner = self.nearest_named().handle;
        let mut state = self.tree.state();
        enqueue(state.sub_final_validators.entry(owner).or_default(), deferred);
    }

    pub(crate) fn take_final(&self) -> Vec<DeferredValidation> {
        std::mem::take(&mut self.tree.state().final_validators)
    }

    pub(crate) fn take_sub_final(&self, owner: RunHandle) -> Vec<DeferredValidation> {
        self.tree
            .state()
            .sub_final_validators
            .remove(&owner)
            .unwrap_or_default()
    }

    /// Number of validators waiting for root finalization.
    pub fn pending_final(&self) -> usize {
        self.tree.state().final_validators.len()
    }

    /// Number of validators waiting for this node's named scope to end.
    pub fn pending_sub_final(&self) -> usize {
        let owner = self.nearest_named().handle;
        self.tree
            .state()
            .sub_final_validators
            .get(&owner)
            .map_or(0, Vec::len)
    }

    // -- report -------------------------------------------------------------

    pub(crate) fn record(&self, label: &str, kind: RecordKind, status: RecordStatus) {
        let record = ScopeRecord {
            run_id: self.id(),
            label: label.to_string(),
            kind,
            status,
            at: Timestamp::now(),
        };
        self.tree.state().report.records.push(record);
    }

    /// Snapshot of everything recorded in this tree so far.
    pub fn report(&self) -> RunReport {
        self.tree.state().report.clone()
    }

    /// The tree's overall result: an error naming every failed named scope.
    pub fn outcome(&self) -> Result<(), HarnessError> {
        let scopes: Vec<String> = self
            .tree
            .state()
            .report
            .of_kind(RecordKind::Named)
            .filter(|record| record.status.is_failed())
            .map(|record| record.run_id.clone())
            .collect();
        if scopes.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::NamedScopes { scopes })
        }
    }
}

impl PartialEq for Run {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.handle == other.handle
    }
}

impl Eq for Run {}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Queues `deferred`, replacing an earlier entry for the same validators.
///
/// A retried sub-step registers its validators once per attempt; only the
/// latest attempt is kept.
fn enqueue(queue: &mut Vec<DeferredValidation>, deferred: DeferredValidation) {
    match queue.iter_mut().find(|queued| queued.same_validators(&deferred)) {
        Some(queued) => *queued = deferred,
        None => queue.push(deferred),
    }
}

fn sanitize(name: &str) -> String {
    name.trim().replace(char::is_whitespace, "_")
}
