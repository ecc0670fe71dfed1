//! Deploy scheduler: the per-run state machine over the service graph.
//!
//! The scheduler decides which services are ready to build and records every
//! state transition. It owns no tasks; the executor drives it.

use crate::changeset::Changeset;
use crate::dag::builder::{DagBuilder, ServiceGraph, ServiceIndex};
use crate::dag::state::{Failure, FailureKind, ServiceRunState};
use crate::env::{Address, unresolved_after_exhaustion};
use crate::errors::ManifestError;
use crate::filter;
use crate::manifest::{Manifest, Service};
use std::collections::BTreeMap;
use std::time::Duration;

/// A service together with its run state.
#[derive(Debug, Clone)]
pub struct ServiceNode {
    pub service: Service,
    pub index: ServiceIndex,
    pub state: ServiceRunState,
    /// Whether the changeset requires a rebuild
    pub affected: bool,
    pub failure: Option<Failure>,
    pub address: Option<Address>,
    /// Resolved environment, once known
    pub env: BTreeMap<String, String>,
    pub attempts: u32,
    /// Promoted from a previous deploy without building
    pub reused: bool,
    pub duration: Duration,
}

impl ServiceNode {
    pub fn new(service: Service, index: ServiceIndex, affected: bool) -> Self {
        Self {
            service,
            index,
            state: ServiceRunState::Pending,
            affected,
            failure: None,
            address: None,
            env: BTreeMap::new(),
            attempts: 0,
            reused: false,
            duration: Duration::ZERO,
        }
    }

    /// Nothing more will happen to this service in this run.
    pub fn is_settled(&self) -> bool {
        self.state.is_terminal()
            || (self.state == ServiceRunState::Blocked && self.failure.is_some())
    }

    /// Deployed by this run, as opposed to reused.
    pub fn deployed(&self) -> bool {
        self.state == ServiceRunState::Live && !self.reused
    }
}

/// The per-run scheduler.
#[derive(Debug)]
pub struct DeployScheduler {
    graph: ServiceGraph,
    nodes: Vec<ServiceNode>,
}

impl DeployScheduler {
    /// Build the graph and evaluate change filters. A `None` changeset marks
    /// every service affected.
    pub fn from_manifest(
        manifest: &Manifest,
        changeset: Option<&Changeset>,
    ) -> Result<Self, ManifestError> {
        let graph = DagBuilder::new(manifest).build()?;
        Ok(Self::new(graph, changeset))
    }

    pub fn new(graph: ServiceGraph, changeset: Option<&Changeset>) -> Self {
        let nodes = graph
            .services()
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let affected = changeset.is_none_or(|c| filter::affected(s, c.paths()));
                ServiceNode::new(s.clone(), i, affected)
            })
            .collect();
        Self { graph, nodes }
    }

    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    pub fn service_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[ServiceNode] {
        &self.nodes
    }

    pub fn node(&self, index: ServiceIndex) -> Option<&ServiceNode> {
        self.nodes.get(index)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&ServiceNode> {
        self.graph.index(name).and_then(|i| self.nodes.get(i))
    }

    pub fn into_parts(self) -> (ServiceGraph, Vec<ServiceNode>) {
        (self.graph, self.nodes)
    }

    fn is_live(&self, index: ServiceIndex) -> bool {
        self.nodes
            .get(index)
            .is_some_and(|n| n.state == ServiceRunState::Live)
    }

    /// Names of the dependencies, over either edge kind, that are not live yet.
    pub fn waiting_on(&self, index: ServiceIndex) -> Vec<String> {
        self.graph
            .dependencies(index)
            .iter()
            .filter(|l| !self.is_live(l.index))
            .map(|l| self.graph.name(l.index).to_string())
            .collect()
    }

    /// Services that may dispatch now, in topological order.
    pub fn ready_services(&self) -> Vec<ServiceIndex> {
        self.graph
            .topological_order()
            .iter()
            .copied()
            .filter(|&i| {
                let node = &self.nodes[i];
                matches!(node.state, ServiceRunState::Pending | ServiceRunState::Blocked)
                    && node.failure.is_none()
                    && self.waiting_on(i).is_empty()
            })
            .collect()
    }

    /// Move pending services with unmet dependencies to `Blocked`.
    /// Returns the newly blocked services and what each waits on.
    pub fn refresh_blocked(&mut self) -> Vec<(ServiceIndex, Vec<String>)> {
        let mut newly_blocked = Vec::new();
        for &i in self.graph.topological_order() {
            if self.nodes[i].state != ServiceRunState::Pending {
                continue;
            }
            let waiting = self.waiting_on(i);
            if !waiting.is_empty() {
                newly_blocked.push((i, waiting));
            }
        }
        for (i, _) in &newly_blocked {
            self.nodes[*i].state = ServiceRunState::Blocked;
        }
        newly_blocked
    }

    pub fn mark_building(&mut self, index: ServiceIndex) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.state = ServiceRunState::Building;
        }
    }

    pub fn mark_deploying(&mut self, index: ServiceIndex) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.state = ServiceRunState::Deploying;
        }
    }

    pub fn mark_live(
        &mut self,
        index: ServiceIndex,
        address: Address,
        env: BTreeMap<String, String>,
        attempts: u32,
        duration: Duration,
    ) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.state = ServiceRunState::Live;
            node.address = Some(address);
            node.env = env;
            node.attempts = attempts;
            node.duration = duration;
        }
    }

    pub fn set_env(&mut self, index: ServiceIndex, env: BTreeMap<String, String>) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.env = env;
        }
    }

    pub fn mark_reused(
        &mut self,
        index: ServiceIndex,
        address: Address,
        env: BTreeMap<String, String>,
        duration: Duration,
    ) {
        self.mark_live(index, address, env, 0, duration);
        if let Some(node) = self.nodes.get_mut(index) {
            node.reused = true;
        }
    }

    /// Record a failure and block every transitive dependent, over env and
    /// route edges, with the inherited root cause. Returns the services
    /// blocked by this call.
    pub fn mark_failed(
        &mut self,
        index: ServiceIndex,
        state: ServiceRunState,
        failure: Failure,
        attempts: u32,
        duration: Duration,
    ) -> Vec<ServiceIndex> {
        let Some(node) = self.nodes.get_mut(index) else {
            return Vec::new();
        };
        node.state = state;
        node.attempts = attempts;
        node.duration = duration;
        node.failure = Some(failure.clone());

        let inherited = failure.inherited();
        let mut blocked = Vec::new();
        for dependent in self.graph.transitive_dependents(index) {
            let node = &mut self.nodes[dependent];
            if node.state.is_terminal() || node.state.is_active() || node.failure.is_some() {
                continue;
            }
            node.state = ServiceRunState::Blocked;
            node.failure = Some(inherited.clone());
            blocked.push(dependent);
        }
        blocked
    }

    /// Mark an in-flight service as stopped by the run budget.
    pub fn mark_cancelled(&mut self, index: ServiceIndex, attempts: u32, duration: Duration) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.state = ServiceRunState::Cancelled;
            node.attempts = attempts;
            node.duration = duration;
            node.failure = Some(Failure::direct(
                FailureKind::Timeout,
                &node.service.name,
                "run timed out before the service went live",
            ));
        }
    }

    /// Cancel every service that has not settled. Returns the cancelled ones.
    pub fn cancel_unsettled(&mut self) -> Vec<ServiceIndex> {
        let unsettled: Vec<ServiceIndex> = (0..self.nodes.len())
            .filter(|&i| !self.nodes[i].is_settled())
            .collect();
        for &i in &unsettled {
            let duration = self.nodes[i].duration;
            let attempts = self.nodes[i].attempts;
            self.mark_cancelled(i, attempts, duration);
        }
        unsettled
    }

    /// With nothing running and nothing ready, any service still waiting
    /// references a target that will never go live. Fail the first such
    /// service in topological order and return it with its blocked dependents.
    pub fn exhaust_waiting(&mut self) -> Option<(ServiceIndex, Vec<ServiceIndex>)> {
        let index = self
            .graph
            .topological_order()
            .iter()
            .copied()
            .find(|&i| !self.nodes[i].is_settled())?;

        let target = self.waiting_on(index).into_iter().next().unwrap_or_default();
        let error = unresolved_after_exhaustion(&self.nodes[index].service, &target);
        let failure = Failure::direct(
            FailureKind::UnresolvedReference,
            &self.nodes[index].service.name,
            error.to_string(),
        );
        let blocked = self.mark_failed(index, ServiceRunState::BuildFailed, failure, 0, Duration::ZERO);
        Some((index, blocked))
    }

    pub fn all_settled(&self) -> bool {
        self.nodes.iter().all(ServiceNode::is_settled)
    }

    pub fn live_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.state == ServiceRunState::Live)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.failure.is_some()).count()
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.nodes.is_empty() {
            return 100.0;
        }
        let settled = self.nodes.iter().filter(|n| n.is_settled()).count();
        (settled as f64 / self.nodes.len() as f64) * 100.0
    }
}
