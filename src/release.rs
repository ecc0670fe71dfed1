//! Release coordination: the deploy step and the end-of-run report.
//!
//! `activate` is the only path to `live` for a built service. `finalize`
//! rolls back everything downstream of a failure, persists what stayed live
//! and produces the [`ReleaseReport`].

use crate::dag::RunResult;
use crate::dag::state::duration_serde;
use crate::dag::{Failure, RunOutcome, ServiceRunState};
use crate::env::{Address, LiveAddresses};
use crate::errors::DeployError;
use crate::manifest::{Service, ServiceKind};
use crate::platform::{DeployRequest, Platform};
use crate::store::{DeploymentRecord, DeploymentStore, fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Final state of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub name: String,
    pub kind: ServiceKind,
    pub state: ServiceRunState,
    pub affected: bool,
    pub reused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub env: BTreeMap<String, String>,
    pub attempts: u32,
    #[serde(with = "duration_serde", rename = "duration_ms")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_serde", rename = "duration_ms")]
    pub duration: Duration,
    pub outcome: RunOutcome,
    /// Services in build order
    pub services: Vec<ServiceReport>,
    /// Services where a failure chain started
    pub root_causes: Vec<String>,
    /// Aggregated failure message, unset on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReleaseReport {
    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    pub fn count(&self, state: ServiceRunState) -> usize {
        self.services.iter().filter(|s| s.state == state).count()
    }

    pub fn reused_count(&self) -> usize {
        self.services.iter().filter(|s| s.reused).count()
    }
}

/// Deploys built services and settles runs. Holds no per-run state; each
/// run brings its own [`LiveAddresses`].
pub struct ReleaseCoordinator {
    platform: Arc<dyn Platform>,
    store: Arc<dyn DeploymentStore>,
}

impl ReleaseCoordinator {
    pub fn new(platform: Arc<dyn Platform>, store: Arc<dyn DeploymentStore>) -> Self {
        Self { platform, store }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    /// Run the deploy step and publish the address into the run's map on
    /// success.
    pub async fn activate(
        &self,
        live: &LiveAddresses,
        service: &Service,
        env: &BTreeMap<String, String>,
        working_dir: &Path,
    ) -> Result<Address, DeployError> {
        let request = DeployRequest {
            service: service.clone(),
            env: env.clone(),
            working_dir: working_dir.to_path_buf(),
        };
        let address = self.platform.deploy(&request).await?;
        if let Err(e) = live.publish(&service.name, address.clone()) {
            self.platform.rollback(&service.name).await.ok();
            return Err(e);
        }
        Ok(address)
    }

    /// Publish the address of a previous deployment without deploying.
    pub fn reuse(
        &self,
        live: &LiveAddresses,
        service: &str,
        address: Address,
    ) -> Result<(), DeployError> {
        live.publish(service, address)
    }

    /// Roll back dependents of failures, update the store and build the
    /// report.
    pub async fn finalize(&self, run: RunResult) -> ReleaseReport {
        let RunResult {
            run_id,
            started_at,
            duration,
            timed_out,
            graph,
            mut nodes,
        } = run;

        let triggers: Vec<usize> = graph
            .topological_order()
            .iter()
            .copied()
            .filter(|&i| {
                matches!(
                    nodes[i].state,
                    ServiceRunState::BuildFailed | ServiceRunState::RolledBack
                ) && nodes[i].failure.as_ref().is_some_and(Failure::is_root)
            })
            .collect();

        let mut undeployed = HashSet::new();
        for trigger in triggers {
            let Some(root) = nodes[trigger].failure.clone() else {
                continue;
            };
            for dependent in graph.transitive_dependents(trigger) {
                let node = &mut nodes[dependent];
                match node.state {
                    ServiceRunState::Cancelled
                    | ServiceRunState::BuildFailed
                    | ServiceRunState::RolledBack => {}
                    ServiceRunState::Live => {
                        if !node.reused {
                            if let Err(e) = self.platform.rollback(&node.service.name).await {
                                warn!(service = %node.service.name, error = %e, "Rollback failed");
                            }
                            undeployed.insert(node.service.name.clone());
                        }
                        info!(
                            service = %node.service.name,
                            root_cause = %root.root_cause,
                            "Rolled back"
                        );
                        node.state = ServiceRunState::RolledBack;
                        node.address = None;
                    }
                    _ => node.state = ServiceRunState::RolledBack,
                }
                if node.failure.is_none() {
                    node.failure = Some(root.inherited());
                }
            }
        }

        for node in &nodes {
            let name = &node.service.name;
            let result = if node.deployed()
                && let Some(address) = &node.address
            {
                let record = DeploymentRecord::new(
                    name,
                    address.clone(),
                    fingerprint(&node.service, &node.env),
                );
                self.store.record(record).await
            } else if undeployed.contains(name) {
                self.store.remove(name).await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                warn!(service = %name, error = %e, "Failed to update deployment store");
            }
        }

        let services: Vec<ServiceReport> = graph
            .topological_order()
            .iter()
            .map(|&i| {
                let node = &nodes[i];
                ServiceReport {
                    name: node.service.name.clone(),
                    kind: node.service.kind,
                    state: node.state,
                    affected: node.affected,
                    reused: node.reused,
                    address: node.address.clone(),
                    env: node.env.clone(),
                    attempts: node.attempts,
                    duration: node.duration,
                    failure: node.failure.clone(),
                }
            })
            .collect();

        let root_causes: Vec<String> = services
            .iter()
            .filter(|s| s.failure.as_ref().is_some_and(Failure::is_root))
            .filter(|s| s.state != ServiceRunState::Cancelled)
            .map(|s| s.name.clone())
            .collect();

        let not_live = services
            .iter()
            .filter(|s| s.state != ServiceRunState::Live)
            .count();
        let (outcome, error) = if timed_out {
            let cancelled = services
                .iter()
                .filter(|s| s.state == ServiceRunState::Cancelled)
                .count();
            (
                RunOutcome::TimedOut,
                Some(format!("Run timed out with {} services cancelled", cancelled)),
            )
        } else if not_live > 0 {
            let causes: Vec<String> = services
                .iter()
                .filter(|s| root_causes.contains(&s.name))
                .filter_map(|s| {
                    s.failure
                        .as_ref()
                        .map(|f| format!("{}: {}", s.name, f.message))
                })
                .collect();
            (
                RunOutcome::Failed,
                Some(format!(
                    "{} of {} services did not go live. Root causes: {}",
                    not_live,
                    services.len(),
                    causes.join("; ")
                )),
            )
        } else {
            (RunOutcome::Succeeded, None)
        };

        match &error {
            Some(message) => error!(run_id = %run_id, outcome = %outcome, "{}", message),
            None => info!(run_id = %run_id, services = services.len(), "Release succeeded"),
        }

        ReleaseReport {
            run_id,
            started_at,
            duration,
            outcome,
            services,
            root_causes,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{DagBuilder, DeployScheduler};
    use crate::dag::FailureKind;
    use crate::manifest::{EnvVar, Manifest, RouteRule, ServiceProperty};
    use crate::platform::testing::RecordingPlatform;
    use crate::store::MemoryStore;

    fn coordinator(platform: Arc<RecordingPlatform>, store: Arc<MemoryStore>) -> ReleaseCoordinator {
        ReleaseCoordinator::new(platform, store)
    }

    fn run_from(scheduler: DeployScheduler, timed_out: bool) -> RunResult {
        let (graph, nodes) = scheduler.into_parts();
        RunResult {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            timed_out,
            graph,
            nodes,
        }
    }

    fn manifest() -> Manifest {
        Manifest::new(
            vec![
                Service::process("api", "run"),
                Service::static_site("docs")
                    .with_route(RouteRule::rewrite("/api/*", "/").with_upstream("api")),
                Service::static_site("web").with_env(EnvVar::from_service(
                    "API_URL",
                    "api",
                    ServiceProperty::Url,
                )),
                Service::process("worker", "run"),
            ],
            vec![],
        )
        .unwrap()
    }

    fn index(s: &DeployScheduler, name: &str) -> usize {
        s.graph().index(name).unwrap()
    }

    #[tokio::test]
    async fn test_activate_publishes_address() {
        let platform = Arc::new(RecordingPlatform::new());
        let c = coordinator(platform.clone(), Arc::new(MemoryStore::new()));
        let service = Service::process("api", "run");
        let live = LiveAddresses::new();
        let address = c
            .activate(&live, &service, &BTreeMap::new(), Path::new("/srv"))
            .await
            .unwrap();
        assert_eq!(live.get("api"), Some(address));

        // A second activation in the same run cannot overwrite the address.
        let err = c
            .activate(&live, &service, &BTreeMap::new(), Path::new("/srv"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::AlreadyPublished { .. }));
        assert_eq!(platform.rolled_back(), vec!["api"]);

        // The next run starts from an empty map.
        let next_run = LiveAddresses::new();
        assert!(
            c.activate(&next_run, &service, &BTreeMap::new(), Path::new("/srv"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_failed_activation_publishes_nothing() {
        let platform = Arc::new(RecordingPlatform::new().failing("api"));
        let c = coordinator(platform, Arc::new(MemoryStore::new()));
        let live = LiveAddresses::new();
        let result = c
            .activate(&live, &Service::process("api", "run"), &BTreeMap::new(), Path::new("/srv"))
            .await;
        assert!(result.is_err());
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_rolls_back_dependents_of_failure() {
        let platform = Arc::new(RecordingPlatform::new());
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(platform.clone(), store.clone());

        let mut s = DeployScheduler::from_manifest(&manifest(), None).unwrap();
        let api = index(&s, "api");
        s.mark_failed(
            api,
            ServiceRunState::BuildFailed,
            Failure::direct(FailureKind::Build, "api", "exit 1"),
            1,
            Duration::ZERO,
        );
        let docs = index(&s, "docs");
        s.mark_live(docs, Address::http("127.0.0.1", 1), BTreeMap::new(), 1, Duration::ZERO);
        let worker = index(&s, "worker");
        s.mark_live(worker, Address::http("127.0.0.1", 2), BTreeMap::new(), 1, Duration::ZERO);

        let report = c.finalize(run_from(s, false)).await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.root_causes, vec!["api"]);
        assert!(report.error.as_ref().unwrap().contains("api: exit 1"));

        assert_eq!(report.service("docs").unwrap().state, ServiceRunState::RolledBack);
        assert!(report.service("docs").unwrap().address.is_none());
        assert!(report.service("worker").unwrap().address.is_some());
        assert_eq!(report.service("web").unwrap().state, ServiceRunState::RolledBack);
        assert_eq!(report.service("worker").unwrap().state, ServiceRunState::Live);
        assert_eq!(
            report.service("web").unwrap().failure.as_ref().unwrap().root_cause,
            "api"
        );
        assert_eq!(platform.rolled_back(), vec!["docs"]);

        let stored: Vec<String> = store.list().await.unwrap().into_iter().map(|r| r.service).collect();
        assert_eq!(stored, vec!["worker"]);
    }

    #[tokio::test]
    async fn test_finalize_success() {
        let c = coordinator(Arc::new(RecordingPlatform::new()), Arc::new(MemoryStore::new()));
        let manifest = Manifest::new(vec![Service::process("api", "run")], vec![]).unwrap();
        let graph = DagBuilder::new(&manifest).build().unwrap();
        let mut s = DeployScheduler::new(graph, None);
        s.mark_live(0, Address::http("127.0.0.1", 1), BTreeMap::new(), 1, Duration::ZERO);

        let report = c.finalize(run_from(s, false)).await;
        assert!(report.succeeded());
        assert!(report.error.is_none());
        assert_eq!(report.count(ServiceRunState::Live), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "succeeded");
        assert_eq!(json["services"][0]["state"], "live");
        assert!(json["services"][0].get("failure").is_none());
    }

    #[tokio::test]
    async fn test_finalize_timed_out() {
        let c = coordinator(Arc::new(RecordingPlatform::new()), Arc::new(MemoryStore::new()));
        let mut s = DeployScheduler::from_manifest(&manifest(), None).unwrap();
        s.cancel_unsettled();
        let report = c.finalize(run_from(s, true)).await;
        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert_eq!(report.count(ServiceRunState::Cancelled), 4);
        assert!(report.root_causes.is_empty());
    }
}
