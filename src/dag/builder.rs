//! DAG builder for constructing the service dependency graph.
//!
//! An edge `dependency -> dependent` exists when the dependent's environment
//! references the dependency (`EdgeKind::Env`, a hard build-time requirement)
//! or one of its routes proxies to it (`EdgeKind::Route`, ordering only).

use crate::errors::ManifestError;
use crate::manifest::{Manifest, Service};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Index into the service list.
pub type ServiceIndex = usize;

/// Why one service must wait for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The dependent resolves an env var from the dependency's address.
    Env,
    /// The dependent routes traffic to the dependency.
    Route,
}

/// One end of an edge, seen from the other end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub index: ServiceIndex,
    pub kind: EdgeKind,
}

/// A directed acyclic graph of services.
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    /// Services indexed by their position in the manifest
    services: Vec<Service>,
    /// Map from service name to index
    index_map: HashMap<String, ServiceIndex>,
    /// index -> services that depend on it
    forward_edges: Vec<Vec<Link>>,
    /// index -> services it depends on
    reverse_edges: Vec<Vec<Link>>,
    /// Deterministic topological order
    order: Vec<ServiceIndex>,
}

impl ServiceGraph {
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, index: ServiceIndex) -> Option<&Service> {
        self.services.get(index)
    }

    pub fn service_by_name(&self, name: &str) -> Option<&Service> {
        self.index_map.get(name).and_then(|&i| self.services.get(i))
    }

    pub fn index(&self, name: &str) -> Option<ServiceIndex> {
        self.index_map.get(name).copied()
    }

    pub fn name(&self, index: ServiceIndex) -> &str {
        self.services
            .get(index)
            .map(|s| s.name.as_str())
            .unwrap_or_default()
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Services that depend on the given one.
    pub fn dependents(&self, index: ServiceIndex) -> &[Link] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Services the given one depends on.
    pub fn dependencies(&self, index: ServiceIndex) -> &[Link] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Every service reachable through dependent edges, in topological order.
    pub fn transitive_dependents(&self, index: ServiceIndex) -> Vec<ServiceIndex> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ServiceIndex> = VecDeque::from([index]);
        while let Some(current) = queue.pop_front() {
            for link in self.dependents(current) {
                if seen.insert(link.index) {
                    queue.push_back(link.index);
                }
            }
        }
        self.order
            .iter()
            .copied()
            .filter(|i| seen.contains(i))
            .collect()
    }

    /// Services in build order: every service after everything it references,
    /// ties broken by name.
    pub fn topological_order(&self) -> &[ServiceIndex] {
        &self.order
    }

    pub fn ordered_names(&self) -> Vec<String> {
        self.order
            .iter()
            .map(|&i| self.name(i).to_string())
            .collect()
    }

    /// Groups of services that could build together once all earlier groups
    /// are live. Each wave is sorted by name.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut done: HashSet<ServiceIndex> = HashSet::new();

        loop {
            let mut ready: Vec<ServiceIndex> = self
                .order
                .iter()
                .copied()
                .filter(|i| !done.contains(i))
                .filter(|&i| self.dependencies(i).iter().all(|l| done.contains(&l.index)))
                .collect();

            if ready.is_empty() {
                break;
            }

            ready.sort_by(|a, b| self.name(*a).cmp(self.name(*b)));
            done.extend(ready.iter().copied());
            waves.push(ready.iter().map(|&i| self.name(i).to_string()).collect());
        }

        waves
    }
}

/// Builder for constructing service graphs.
pub struct DagBuilder<'a> {
    manifest: &'a Manifest,
}

impl<'a> DagBuilder<'a> {
    pub fn new(manifest: &'a Manifest) -> Self {
        Self { manifest }
    }

    /// Build the service graph, rejecting reference cycles.
    pub fn build(self) -> Result<ServiceGraph, ManifestError> {
        let services = self.manifest.services().to_vec();

        let index_map: HashMap<String, ServiceIndex> = services
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let mut forward_edges: Vec<Vec<Link>> = vec![Vec::new(); services.len()];
        let mut reverse_edges: Vec<Vec<Link>> = vec![Vec::new(); services.len()];

        for (to_idx, service) in services.iter().enumerate() {
            let mut links: HashMap<ServiceIndex, EdgeKind> = HashMap::new();

            let env = service.env_targets().map(|t| (t, EdgeKind::Env));
            let routes = service.route_targets().map(|t| (t, EdgeKind::Route));
            for (target, kind) in env.chain(routes) {
                // Manifest validation guarantees every target exists.
                let Some(&from_idx) = index_map.get(target) else {
                    continue;
                };
                // An env edge is stronger than a route edge to the same service.
                links
                    .entry(from_idx)
                    .and_modify(|k| {
                        if kind == EdgeKind::Env {
                            *k = EdgeKind::Env;
                        }
                    })
                    .or_insert(kind);
            }

            let mut links: Vec<(ServiceIndex, EdgeKind)> = links.into_iter().collect();
            links.sort_by_key(|(i, _)| *i);
            for (from_idx, kind) in links {
                forward_edges[from_idx].push(Link {
                    index: to_idx,
                    kind,
                });
                reverse_edges[to_idx].push(Link {
                    index: from_idx,
                    kind,
                });
            }
        }

        let order = Self::topological_sort(&services, &forward_edges, &reverse_edges)?;

        Ok(ServiceGraph {
            services,
            index_map,
            forward_edges,
            reverse_edges,
            order,
        })
    }

    /// Kahn's algorithm with name-ordered tie breaking.
    fn topological_sort(
        services: &[Service],
        forward_edges: &[Vec<Link>],
        reverse_edges: &[Vec<Link>],
    ) -> Result<Vec<ServiceIndex>, ManifestError> {
        let mut in_degree: Vec<usize> = reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: BTreeSet<(&str, ServiceIndex)> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| (services[i].name.as_str(), i))
            .collect();

        let mut order = Vec::with_capacity(services.len());

        while let Some((_, node)) = queue.pop_first() {
            order.push(node);
            for link in &forward_edges[node] {
                in_degree[link.index] -= 1;
                if in_degree[link.index] == 0 {
                    queue.insert((services[link.index].name.as_str(), link.index));
                }
            }
        }

        if order.len() != services.len() {
            let remaining: HashSet<ServiceIndex> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| i)
                .collect();

            // Services downstream of a cycle also keep a positive in-degree;
            // only those that can reach themselves are on the cycle.
            let mut participants: Vec<String> = remaining
                .iter()
                .copied()
                .filter(|&i| Self::reaches_itself(i, forward_edges, &remaining))
                .map(|i| services[i].name.clone())
                .collect();
            participants.sort();

            return Err(ManifestError::Cycle { participants });
        }

        Ok(order)
    }

    fn reaches_itself(
        start: ServiceIndex,
        forward_edges: &[Vec<Link>],
        within: &HashSet<ServiceIndex>,
    ) -> bool {
        let mut seen = HashSet::new();
        let mut stack: Vec<ServiceIndex> = forward_edges[start].iter().map(|l| l.index).collect();
        while let Some(node) = stack.pop() {
            if node == start {
                return true;
            }
            if !within.contains(&node) || !seen.insert(node) {
                continue;
            }
            stack.extend(forward_edges[node].iter().map(|l| l.index));
        }
        false
    }
}

/// Compute the deterministic build order for a manifest.
pub fn resolve(manifest: &Manifest) -> Result<Vec<String>, ManifestError> {
    Ok(DagBuilder::new(manifest).build()?.ordered_names())
}
