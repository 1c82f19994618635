//! Dependency graph of invocation nodes.
//!
//! Keyed by invocation id, with two continuously maintained drain sets:
//! `ready` (Pending nodes whose dependencies all Succeeded) and `doomed`
//! (Pending nodes with at least one Failed/Skipped dependency). The
//! scheduler drains both after every mutation; execution tasks drive
//! `on_terminal` and re-drain, which is what wakes dependents.
//!
//! The graph is also the authority for cross-session dependencies: ids in
//! [`SessionSeeds`] are satisfied (or dooming) without placeholder nodes.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use run_event::SkipCause;

use crate::error::InvocationError;
use crate::parser::InvocationCall;

/// Lifecycle state of one invocation node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Waiting on at least one dependency.
    Pending,
    /// All dependencies Succeeded; queued for dispatch.
    Ready,
    /// Dispatched; the execution task holds it.
    Running,
    /// Terminal: gadget completed (or a controller synthesized success).
    Succeeded,
    /// Terminal: classified failure.
    Failed,
    /// Terminal: never ran.
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped
        )
    }
}

/// Terminal outcome reported into the graph via [`InvocationGraph::on_terminal`].
#[derive(Clone, Debug)]
pub enum NodeOutcome {
    Succeeded { result: String, cost: Option<f64> },
    Failed(InvocationError),
    Skipped(SkipCause),
}

/// One entry in the graph: the call plus execution bookkeeping.
#[derive(Clone, Debug)]
pub struct InvocationNode {
    pub call: InvocationCall,
    pub state: NodeState,
    pub result: Option<String>,
    pub error: Option<InvocationError>,
    pub skip_cause: Option<SkipCause>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cost: Option<f64>,
}

impl InvocationNode {
    fn new(call: InvocationCall) -> Self {
        Self {
            call,
            state: NodeState::Pending,
            result: None,
            error: None,
            skip_cause: None,
            started_at: None,
            finished_at: None,
            cost: None,
        }
    }
}

/// Previously resolved ids from prior iterations of the agent loop.
///
/// A new call whose dependency names a seeded id is immediately satisfied
/// (or doomed) without a placeholder node.
#[derive(Clone, Debug, Default)]
pub struct SessionSeeds {
    pub succeeded: HashSet<String>,
    pub failed: HashSet<String>,
}

impl SessionSeeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_succeeded<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.succeeded.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_failed<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failed.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// What `insert` found out about the new call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Node registered; readiness flows through `poll_ready` / `poll_doomed`.
    Registered,
    /// The id was already present. The duplicate is recorded and must be
    /// surfaced as a parse-level failure; the original node is untouched.
    DuplicateId,
    /// The call listed itself as a dependency; recorded Skipped.
    SelfDependency,
    /// The call carried a `parse_error`; recorded Failed, never dispatched.
    ParseFailed,
}

/// Diagnostic for a node left unresolved when the stream closed.
#[derive(Clone, Debug)]
pub struct CloseDiagnostic {
    pub id: String,
    pub gadget: String,
    pub cause: SkipCause,
}

/// In-memory DAG of invocation nodes for one scheduler session.
#[derive(Debug, Default)]
pub struct InvocationGraph {
    nodes: HashMap<String, InvocationNode>,
    /// dep id → ids waiting on it. Keys may name ids that have not appeared
    /// yet (forward references) or never will (dangling).
    dependents: HashMap<String, Vec<String>>,
    ready: Vec<String>,
    /// (id, dep that doomed it); queued at most once per node.
    doomed: Vec<(String, String)>,
    doomed_queued: HashSet<String>,
    seeds: SessionSeeds,
    duplicates: Vec<InvocationCall>,
}

impl InvocationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seeds(mut self, seeds: SessionSeeds) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn node(&self, id: &str) -> Option<&InvocationNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Duplicate calls rejected by `insert`, for diagnostics.
    pub fn duplicates(&self) -> &[InvocationCall] {
        &self.duplicates
    }

    /// Registers a parsed call. O(deps).
    pub fn insert(&mut self, call: InvocationCall) -> InsertOutcome {
        let id = call.invocation_id.clone();
        if self.nodes.contains_key(&id) {
            self.duplicates.push(call);
            return InsertOutcome::DuplicateId;
        }

        if call.dependencies.iter().any(|d| d == &id) {
            let mut node = InvocationNode::new(call);
            node.state = NodeState::Skipped;
            node.skip_cause = Some(SkipCause::SelfDependency);
            node.finished_at = Some(Utc::now());
            self.nodes.insert(id.clone(), node);
            self.doom_dependents_of(&id);
            return InsertOutcome::SelfDependency;
        }

        if let Some(reason) = call.parse_error.clone() {
            let raw = call.raw_parameter_text.clone();
            let mut node = InvocationNode::new(call);
            node.state = NodeState::Failed;
            node.error = Some(InvocationError::parse(format!(
                "{reason}; raw parameters: {raw:?}"
            )));
            node.finished_at = Some(Utc::now());
            self.nodes.insert(id.clone(), node);
            self.doom_dependents_of(&id);
            return InsertOutcome::ParseFailed;
        }

        let mut dooming: Option<String> = None;
        let mut unsatisfied = false;
        for dep in &call.dependencies {
            if self.seeds.succeeded.contains(dep) {
                continue;
            }
            if self.seeds.failed.contains(dep) {
                dooming.get_or_insert_with(|| dep.clone());
                continue;
            }
            match self.nodes.get(dep).map(|n| n.state) {
                Some(NodeState::Succeeded) => {}
                Some(NodeState::Failed) | Some(NodeState::Skipped) => {
                    dooming.get_or_insert_with(|| dep.clone());
                }
                Some(_) => {
                    unsatisfied = true;
                    self.dependents.entry(dep.clone()).or_default().push(id.clone());
                }
                None => {
                    // Forward reference; legal until stream close.
                    unsatisfied = true;
                    self.dependents.entry(dep.clone()).or_default().push(id.clone());
                }
            }
        }

        self.nodes.insert(id.clone(), InvocationNode::new(call));
        if let Some(dep) = dooming {
            self.queue_doom(&id, &dep);
        } else if !unsatisfied {
            self.queue_ready(&id);
        }
        InsertOutcome::Registered
    }

    /// Records a terminal outcome and walks forward edges, queueing newly
    /// ready or doomed dependents.
    pub fn on_terminal(&mut self, id: &str, outcome: NodeOutcome) {
        let success = {
            let Some(node) = self.nodes.get_mut(id) else {
                return;
            };
            if node.state.is_terminal() {
                return;
            }
            node.finished_at = Some(Utc::now());
            match outcome {
                NodeOutcome::Succeeded { result, cost } => {
                    node.state = NodeState::Succeeded;
                    node.result = Some(result);
                    node.cost = cost;
                    true
                }
                NodeOutcome::Failed(err) => {
                    node.state = NodeState::Failed;
                    node.error = Some(err);
                    false
                }
                NodeOutcome::Skipped(cause) => {
                    node.state = NodeState::Skipped;
                    node.skip_cause = Some(cause);
                    false
                }
            }
        };

        if success {
            self.wake_dependents_of(id);
        } else {
            self.doom_dependents_of(id);
        }
    }

    /// Marks a node Running. Used by the scheduler at dispatch.
    pub fn mark_running(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            if !node.state.is_terminal() {
                node.state = NodeState::Running;
                node.started_at = Some(Utc::now());
            }
        }
    }

    /// Returns and drains the current ready set; the caller owns dispatch.
    pub fn poll_ready(&mut self) -> Vec<String> {
        std::mem::take(&mut self.ready)
    }

    /// Returns and drains the doomed set as (id, dooming dependency).
    pub fn poll_doomed(&mut self) -> Vec<(String, String)> {
        for (id, _) in &self.doomed {
            self.doomed_queued.remove(id);
        }
        std::mem::take(&mut self.doomed)
    }

    /// Classifies every still-unresolved node at stream close, marks it
    /// Skipped, and returns the diagnostics in application order.
    ///
    /// A node with a dependency that never appeared is a dangling reference;
    /// a node that can reach itself over pending dependency edges sits on a
    /// cycle; the rest are downstream casualties of those.
    pub fn unresolved_on_close(&mut self) -> Vec<CloseDiagnostic> {
        let open: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| !n.state.is_terminal() && n.state != NodeState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        if open.is_empty() {
            return Vec::new();
        }
        let open_set: HashSet<&str> = open.iter().map(String::as_str).collect();

        let mut diagnostics = Vec::new();
        let mut resolved: HashMap<String, String> = HashMap::new(); // id → dooming dep

        // Dangling references first.
        for id in &open {
            let deps = &self.nodes[id].call.dependencies;
            if let Some(missing) = deps.iter().find(|d| {
                !self.nodes.contains_key(*d)
                    && !self.seeds.succeeded.contains(*d)
                    && !self.seeds.failed.contains(*d)
            }) {
                diagnostics.push(CloseDiagnostic {
                    id: id.clone(),
                    gadget: self.nodes[id].call.gadget.clone(),
                    cause: SkipCause::DanglingReference {
                        dependency: missing.clone(),
                    },
                });
                resolved.insert(id.clone(), missing.clone());
            }
        }

        // Cycle members: nodes that reach themselves over open dep edges.
        for id in &open {
            if resolved.contains_key(id) {
                continue;
            }
            if self.reaches_itself(id, &open_set) {
                diagnostics.push(CloseDiagnostic {
                    id: id.clone(),
                    gadget: self.nodes[id].call.gadget.clone(),
                    cause: SkipCause::Cycle,
                });
                resolved.insert(id.clone(), id.clone());
            }
        }

        // Everything left is doomed by one of the nodes above.
        let mut changed = true;
        while changed {
            changed = false;
            for id in &open {
                if resolved.contains_key(id) {
                    continue;
                }
                let cause = self.nodes[id]
                    .call
                    .dependencies
                    .iter()
                    .find(|d| {
                        resolved.contains_key(*d)
                            || self
                                .nodes
                                .get(*d)
                                .map(|n| {
                                    matches!(n.state, NodeState::Failed | NodeState::Skipped)
                                })
                                .unwrap_or(false)
                    })
                    .cloned();
                if let Some(dep) = cause {
                    diagnostics.push(CloseDiagnostic {
                        id: id.clone(),
                        gadget: self.nodes[id].call.gadget.clone(),
                        cause: SkipCause::Dependency { cause: dep.clone() },
                    });
                    resolved.insert(id.clone(), dep);
                    changed = true;
                }
            }
        }

        for diag in &diagnostics {
            if let Some(node) = self.nodes.get_mut(&diag.id) {
                node.state = NodeState::Skipped;
                node.skip_cause = Some(diag.cause.clone());
                node.finished_at = Some(Utc::now());
            }
        }
        diagnostics
    }

    /// Ids of all nodes currently not in a terminal state.
    pub fn open_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn reaches_itself(&self, start: &str, open: &HashSet<&str>) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: VecDeque<&str> = self.nodes[start]
            .call
            .dependencies
            .iter()
            .map(String::as_str)
            .filter(|d| open.contains(d))
            .collect();
        while let Some(cur) = stack.pop_front() {
            if cur == start {
                return true;
            }
            if !seen.insert(cur) {
                continue;
            }
            if let Some(node) = self.nodes.get(cur) {
                stack.extend(
                    node.call
                        .dependencies
                        .iter()
                        .map(String::as_str)
                        .filter(|d| open.contains(d)),
                );
            }
        }
        false
    }

    fn queue_ready(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            if node.state == NodeState::Pending {
                node.state = NodeState::Ready;
                self.ready.push(id.to_string());
            }
        }
    }

    fn queue_doom(&mut self, id: &str, dep: &str) {
        let pending = self
            .nodes
            .get(id)
            .map(|n| n.state == NodeState::Pending)
            .unwrap_or(false);
        if pending && self.doomed_queued.insert(id.to_string()) {
            self.doomed.push((id.to_string(), dep.to_string()));
        }
    }

    fn wake_dependents_of(&mut self, dep: &str) {
        let Some(waiting) = self.dependents.remove(dep) else {
            return;
        };
        for id in waiting {
            let all_satisfied = match self.nodes.get(&id) {
                Some(node) if node.state == NodeState::Pending => node
                    .call
                    .dependencies
                    .iter()
                    .all(|d| self.dependency_satisfied(d)),
                _ => continue,
            };
            if all_satisfied {
                self.queue_ready(&id);
            }
        }
    }

    fn doom_dependents_of(&mut self, dep: &str) {
        let Some(waiting) = self.dependents.remove(dep) else {
            return;
        };
        for id in waiting {
            self.queue_doom(&id, dep);
        }
    }

    fn dependency_satisfied(&self, dep: &str) -> bool {
        self.seeds.succeeded.contains(dep)
            || self
                .nodes
                .get(dep)
                .map(|n| n.state == NodeState::Succeeded)
                .unwrap_or(false)
    }
}
