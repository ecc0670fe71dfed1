//! Deploy executor: runs service builds in parallel while respecting
//! dependencies.
//!
//! The executor owns the run loop. It asks the scheduler for ready services,
//! spawns one task per service bounded by a semaphore, and applies results as
//! they arrive on an mpsc channel. The run deadline and cancellation are
//! handled in the same loop.

use crate::changeset::Changeset;
use crate::config::{EngineConfig, ServiceSettings};
use crate::dag::builder::{ServiceGraph, ServiceIndex};
use crate::dag::scheduler::{DeployScheduler, ServiceNode};
use crate::dag::state::{ExecutionTimer, Failure, FailureKind, RunOutcome, ServiceRunState};
use crate::env::{
    Address, DatabaseValues, EnvResolution, LiveAddresses, resolve_env,
    unresolved_after_exhaustion,
};
use crate::errors::{BuildError, ManifestError, TimeoutError};
use crate::manifest::{Manifest, Service};
use crate::platform::database_values;
use crate::release::{ReleaseCoordinator, ReleaseReport};
use crate::retry::RetryPolicy;
use crate::runner::{CommandRequest, CommandRunner};
use crate::store::fingerprint;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events emitted during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        services: usize,
        affected: Vec<String>,
    },
    /// A service is waiting on dependencies that are not live yet.
    ServiceBlocked {
        service: String,
        waiting_on: Vec<String>,
    },
    BuildStarted {
        service: String,
        attempt: u32,
    },
    /// A transient failure will be retried after `delay_ms`.
    BuildRetry {
        service: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    Deploying {
        service: String,
    },
    ServiceLive {
        service: String,
        url: String,
    },
    ServiceReused {
        service: String,
        url: String,
    },
    ServiceFailed {
        service: String,
        failure: Failure,
    },
    RunCompleted {
        outcome: RunOutcome,
    },
}

/// Final scheduler state of a run, before release finalization.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// The run budget ran out
    pub timed_out: bool,
    pub graph: ServiceGraph,
    pub nodes: Vec<ServiceNode>,
}

/// Messages from service tasks to the run loop.
enum TaskMessage {
    Deploying(ServiceIndex),
    Finished(TaskOutcome),
}

enum TaskResult {
    Live {
        address: Address,
        env: BTreeMap<String, String>,
    },
    Reused {
        address: Address,
        env: BTreeMap<String, String>,
    },
    Failed {
        state: ServiceRunState,
        failure: Failure,
        env: BTreeMap<String, String>,
    },
    Cancelled,
}

struct TaskOutcome {
    index: ServiceIndex,
    result: TaskResult,
    attempts: u32,
    duration: Duration,
}

enum BuildOutcome {
    Succeeded,
    Failed(BuildError),
    Cancelled,
}

/// Shared by every service task of one run.
struct TaskContext {
    project_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    coordinator: Arc<ReleaseCoordinator>,
    databases: DatabaseValues,
    /// Addresses published in this run
    live: LiveAddresses,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
    token: CancellationToken,
}

impl TaskContext {
    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            tx.send(event).ok();
        }
    }

    fn working_dir(&self, service: &Service) -> PathBuf {
        working_dir(&self.project_dir, service)
    }
}

pub(crate) fn working_dir(project_dir: &Path, service: &Service) -> PathBuf {
    match &service.root_dir {
        Some(dir) => project_dir.join(dir),
        None => project_dir.to_path_buf(),
    }
}

/// Runs a manifest through build, deploy and release.
pub struct DeployExecutor {
    project_dir: PathBuf,
    config: EngineConfig,
    runner: Arc<dyn CommandRunner>,
    coordinator: Arc<ReleaseCoordinator>,
    event_tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl DeployExecutor {
    pub fn new(
        project_dir: impl Into<PathBuf>,
        config: EngineConfig,
        runner: Arc<dyn CommandRunner>,
        coordinator: Arc<ReleaseCoordinator>,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            config,
            runner,
            coordinator,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn coordinator(&self) -> &Arc<ReleaseCoordinator> {
        &self.coordinator
    }

    /// Execute the run and finalize the release.
    pub async fn deploy(
        &self,
        manifest: &Manifest,
        changeset: Option<&Changeset>,
    ) -> Result<ReleaseReport, ManifestError> {
        let run = self.execute(manifest, changeset).await?;
        let report = self.coordinator.finalize(run).await;
        self.emit(RunEvent::RunCompleted {
            outcome: report.outcome,
        });
        Ok(report)
    }

    /// Build and deploy every service the schedule allows. Fails only when
    /// the manifest cannot be scheduled at all; per-service failures are in
    /// the returned nodes.
    pub async fn execute(
        &self,
        manifest: &Manifest,
        changeset: Option<&Changeset>,
    ) -> Result<RunResult, ManifestError> {
        let timer = ExecutionTimer::start();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut scheduler = DeployScheduler::from_manifest(manifest, changeset)?;
        let affected: Vec<String> = scheduler
            .nodes()
            .iter()
            .filter(|n| n.affected)
            .map(|n| n.service.name.clone())
            .collect();

        info!(
            run_id = %run_id,
            services = scheduler.service_count(),
            affected = affected.len(),
            max_parallel = self.config.max_parallel,
            "Starting deploy run"
        );
        debug!(waves = ?scheduler.graph().compute_waves(), "Computed build waves");
        self.emit(RunEvent::RunStarted {
            run_id,
            services: scheduler.service_count(),
            affected,
        });

        let token = CancellationToken::new();
        let ctx = Arc::new(TaskContext {
            project_dir: self.project_dir.clone(),
            runner: Arc::clone(&self.runner),
            coordinator: Arc::clone(&self.coordinator),
            databases: database_values(self.coordinator.platform().as_ref(), manifest),
            live: LiveAddresses::new(),
            events: self.event_tx.clone(),
            token: token.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let (result_tx, mut result_rx) = mpsc::channel::<TaskMessage>(100);
        let mut active_tasks: HashMap<ServiceIndex, JoinHandle<()>> = HashMap::new();
        let deadline = tokio::time::Instant::now() + self.config.run_timeout;
        let mut timed_out = false;

        loop {
            for (index, waiting_on) in scheduler.refresh_blocked() {
                let service = scheduler.graph().name(index).to_string();
                debug!(service = %service, waiting_on = ?waiting_on, "Service blocked");
                self.emit(RunEvent::ServiceBlocked {
                    service,
                    waiting_on,
                });
            }

            if !timed_out {
                for index in scheduler.ready_services() {
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        break;
                    };
                    let Some(node) = scheduler.node(index) else {
                        continue;
                    };
                    let service = node.service.clone();
                    let affected = node.affected;
                    let settings = self.config.settings_for(&service.name);
                    scheduler.mark_building(index);

                    let ctx = Arc::clone(&ctx);
                    let result_tx = result_tx.clone();
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        let outcome =
                            run_service(&ctx, index, service, affected, settings, &result_tx)
                                .await;
                        result_tx.send(TaskMessage::Finished(outcome)).await.ok();
                    });
                    active_tasks.insert(index, handle);
                }
            }

            if active_tasks.is_empty() {
                if timed_out || scheduler.all_settled() {
                    break;
                }
                // Nothing running and nothing ready: whatever still waits
                // will never resolve.
                match scheduler.exhaust_waiting() {
                    Some((index, blocked)) => {
                        self.report_failure(&scheduler, index);
                        for dependent in blocked {
                            self.report_failure(&scheduler, dependent);
                        }
                        continue;
                    }
                    None => break,
                }
            }

            tokio::select! {
                message = result_rx.recv() => match message {
                    Some(TaskMessage::Deploying(index)) => scheduler.mark_deploying(index),
                    Some(TaskMessage::Finished(outcome)) => {
                        if let Some(handle) = active_tasks.remove(&outcome.index) {
                            handle.await.ok();
                        }
                        self.apply(&mut scheduler, outcome);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    timed_out = true;
                    warn!(
                        run_id = %run_id,
                        budget = ?self.config.run_timeout,
                        in_flight = active_tasks.len(),
                        "Run timeout reached, cancelling in-flight builds"
                    );
                    token.cancel();
                }
            }
        }

        if timed_out {
            for index in scheduler.cancel_unsettled() {
                self.report_failure(&scheduler, index);
            }
        }

        info!(
            run_id = %run_id,
            live = scheduler.live_count(),
            failed = scheduler.failed_count(),
            timed_out,
            duration_ms = timer.elapsed().as_millis() as u64,
            "Deploy run finished"
        );

        let (graph, nodes) = scheduler.into_parts();
        Ok(RunResult {
            run_id,
            started_at,
            duration: timer.elapsed(),
            timed_out,
            graph,
            nodes,
        })
    }

    fn apply(&self, scheduler: &mut DeployScheduler, outcome: TaskOutcome) {
        let index = outcome.index;
        let name = scheduler.graph().name(index).to_string();
        match outcome.result {
            TaskResult::Live { address, env } => {
                info!(service = %name, url = %address.url, attempts = outcome.attempts, "Service live");
                self.emit(RunEvent::ServiceLive {
                    service: name,
                    url: address.url.clone(),
                });
                scheduler.mark_live(index, address, env, outcome.attempts, outcome.duration);
            }
            TaskResult::Reused { address, env } => {
                info!(service = %name, url = %address.url, "Reusing previous deployment");
                self.emit(RunEvent::ServiceReused {
                    service: name,
                    url: address.url.clone(),
                });
                scheduler.mark_reused(index, address, env, outcome.duration);
            }
            TaskResult::Failed {
                state,
                failure,
                env,
            } => {
                error!(
                    service = %name,
                    kind = ?failure.kind,
                    attempts = outcome.attempts,
                    error = %failure.message,
                    "Service failed"
                );
                scheduler.set_env(index, env);
                let blocked =
                    scheduler.mark_failed(index, state, failure, outcome.attempts, outcome.duration);
                self.report_failure(scheduler, index);
                for dependent in blocked {
                    self.report_failure(scheduler, dependent);
                }
            }
            TaskResult::Cancelled => {
                scheduler.mark_cancelled(index, outcome.attempts, outcome.duration);
            }
        }
    }

    fn report_failure(&self, scheduler: &DeployScheduler, index: ServiceIndex) {
        let Some(node) = scheduler.node(index) else {
            return;
        };
        if let Some(failure) = &node.failure {
            if !failure.is_root() {
                warn!(
                    service = %node.service.name,
                    root_cause = %failure.root_cause,
                    "Service will not be built"
                );
            }
            self.emit(RunEvent::ServiceFailed {
                service: node.service.name.clone(),
                failure: failure.clone(),
            });
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            tx.send(event).ok();
        }
    }
}

/// Resolve, reuse or build, then deploy a single service.
async fn run_service(
    ctx: &TaskContext,
    index: ServiceIndex,
    service: Service,
    affected: bool,
    settings: ServiceSettings,
    result_tx: &mpsc::Sender<TaskMessage>,
) -> TaskOutcome {
    let timer = ExecutionTimer::start();
    let name = service.name.clone();
    let finish = |result: TaskResult, attempts: u32| TaskOutcome {
        index,
        result,
        attempts,
        duration: timer.elapsed(),
    };

    let env = match resolve_env(&service, &ctx.live, &ctx.databases) {
        Ok(EnvResolution::Ready(env)) => env,
        Ok(EnvResolution::Waiting(targets)) => {
            let target = targets.first().map(String::as_str).unwrap_or_default();
            let err = unresolved_after_exhaustion(&service, target);
            return finish(unresolved(&name, err.to_string()), 0);
        }
        Err(err) => return finish(unresolved(&name, err.to_string()), 0),
    };

    if !affected && let Some(address) = try_reuse(ctx, &service, &env).await {
        return finish(TaskResult::Reused { address, env }, 0);
    }

    let mut attempts = 0;
    let build = build_with_retries(ctx, &service, &env, &settings.retry, &mut attempts);
    let built = tokio::time::timeout(settings.build_timeout, build).await;
    match built {
        Err(_) => {
            let err = TimeoutError::Build {
                service: name.clone(),
                budget: settings.build_timeout,
            };
            let failure = Failure::direct(FailureKind::Timeout, &name, err.to_string());
            return finish(
                TaskResult::Failed {
                    state: ServiceRunState::BuildFailed,
                    failure,
                    env,
                },
                attempts,
            );
        }
        Ok(BuildOutcome::Cancelled) => return finish(TaskResult::Cancelled, attempts),
        Ok(BuildOutcome::Failed(err)) => {
            let failure = Failure::direct(FailureKind::Build, &name, err.to_string());
            return finish(
                TaskResult::Failed {
                    state: ServiceRunState::BuildFailed,
                    failure,
                    env,
                },
                attempts,
            );
        }
        Ok(BuildOutcome::Succeeded) => {}
    }

    result_tx.send(TaskMessage::Deploying(index)).await.ok();
    ctx.emit(RunEvent::Deploying {
        service: name.clone(),
    });
    let working_dir = ctx.working_dir(&service);
    let deployed = tokio::select! {
        _ = ctx.token.cancelled() => return finish(TaskResult::Cancelled, attempts),
        result = ctx.coordinator.activate(&ctx.live, &service, &env, &working_dir) => result,
    };

    match deployed {
        Ok(address) => finish(TaskResult::Live { address, env }, attempts),
        Err(err) => {
            let failure = Failure::direct(FailureKind::Deploy, &name, err.to_string());
            finish(
                TaskResult::Failed {
                    state: ServiceRunState::RolledBack,
                    failure,
                    env,
                },
                attempts,
            )
        }
    }
}

fn unresolved(service: &str, message: String) -> TaskResult {
    TaskResult::Failed {
        state: ServiceRunState::BuildFailed,
        failure: Failure::direct(FailureKind::UnresolvedReference, service, message),
        env: BTreeMap::new(),
    }
}

/// Promote an unaffected service whose stored fingerprint still matches and
/// whose deployment the platform still runs.
async fn try_reuse(
    ctx: &TaskContext,
    service: &Service,
    env: &BTreeMap<String, String>,
) -> Option<Address> {
    let expected = fingerprint(service, env);
    let record = match ctx.coordinator.store().get(&service.name).await {
        Ok(Some(record)) if record.fingerprint == expected => record,
        Ok(Some(_)) => {
            debug!(service = %service.name, "Fingerprint changed, rebuilding");
            return None;
        }
        Ok(None) => {
            debug!(service = %service.name, "No previous deployment, building");
            return None;
        }
        Err(e) => {
            warn!(service = %service.name, error = %e, "Failed to read deployment record");
            return None;
        }
    };

    if !ctx
        .coordinator
        .platform()
        .is_running(service, &record.address)
        .await
    {
        debug!(
            service = %service.name,
            url = %record.address.url,
            "Previous deployment is gone, rebuilding"
        );
        return None;
    }

    match ctx
        .coordinator
        .reuse(&ctx.live, &service.name, record.address.clone())
    {
        Ok(()) => Some(record.address),
        Err(e) => {
            warn!(service = %service.name, error = %e, "Failed to reuse deployment");
            None
        }
    }
}

/// Run all build steps, retrying transient failures with backoff.
async fn build_with_retries(
    ctx: &TaskContext,
    service: &Service,
    env: &BTreeMap<String, String>,
    retry: &RetryPolicy,
    attempts: &mut u32,
) -> BuildOutcome {
    let working_dir = ctx.working_dir(service);
    loop {
        *attempts += 1;
        let attempt = *attempts;
        debug!(service = %service.name, attempt, "Starting build");
        ctx.emit(RunEvent::BuildStarted {
            service: service.name.clone(),
            attempt,
        });

        let result = tokio::select! {
            _ = ctx.token.cancelled() => return BuildOutcome::Cancelled,
            result = run_steps(ctx, service, env, &working_dir, retry) => result,
        };
        let err = match result {
            Ok(()) => return BuildOutcome::Succeeded,
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= retry.max_attempts() {
            return BuildOutcome::Failed(err);
        }

        let delay = retry.delay_for(attempt);
        warn!(
            service = %service.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient build failure, retrying"
        );
        ctx.emit(RunEvent::BuildRetry {
            service: service.name.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            reason: err.to_string(),
        });
        tokio::select! {
            _ = ctx.token.cancelled() => return BuildOutcome::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_steps(
    ctx: &TaskContext,
    service: &Service,
    env: &BTreeMap<String, String>,
    working_dir: &Path,
    retry: &RetryPolicy,
) -> Result<(), BuildError> {
    for step in &service.build {
        debug!(service = %service.name, step = %step, "Running build step");
        let request = CommandRequest {
            service: service.name.clone(),
            command: step.clone(),
            working_dir: working_dir.to_path_buf(),
            env: env.clone(),
        };
        let output = ctx
            .runner
            .run(&request)
            .await
            .map_err(|source| BuildError::Spawn {
                step: step.clone(),
                source,
            })?;
        if !output.success() {
            let transient = retry.is_transient(output.exit_code, &output.combined());
            return Err(BuildError::NonZeroExit {
                step: step.clone(),
                exit_code: output.exit_code,
                transient,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{BuildFilter, EnvVar, RouteRule, ServiceProperty};
    use crate::platform::testing::RecordingPlatform;
    use crate::runner::testing::{ScriptedRunner, fail, ok};
    use crate::store::{DeploymentStore, MemoryStore};

    struct Harness {
        runner: Arc<ScriptedRunner>,
        platform: Arc<RecordingPlatform>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        fn new(runner: ScriptedRunner) -> Self {
            Self::with_platform(runner, RecordingPlatform::new())
        }

        fn with_platform(runner: ScriptedRunner, platform: RecordingPlatform) -> Self {
            Self {
                runner: Arc::new(runner),
                platform: Arc::new(platform),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn executor(&self, config: EngineConfig) -> DeployExecutor {
            let coordinator = ReleaseCoordinator::new(self.platform.clone(), self.store.clone());
            DeployExecutor::new("/srv/app", config, self.runner.clone(), Arc::new(coordinator))
        }
    }

    fn fast() -> EngineConfig {
        EngineConfig::default().with_retry(
            RetryPolicy::default().with_base_delay(Duration::from_millis(1)),
        )
    }

    fn manifest(services: Vec<Service>) -> Manifest {
        Manifest::new(services, vec![]).unwrap()
    }

    fn backend() -> Service {
        Service::process("backend", "node index.js")
            .with_build(&["backend: npm ci"])
            .with_filter(BuildFilter::new(&["server/**/*"], &[]))
    }

    fn frontend() -> Service {
        Service::static_site("frontend")
            .with_build(&["frontend: npm run build"])
            .with_env(EnvVar::from_service("VITE_API_URL", "backend", ServiceProperty::Url))
            .with_filter(BuildFilter::new(&["client/**/*"], &["**/*.test.js"]))
    }

    #[tokio::test]
    async fn test_dependency_builds_first_and_env_resolves() {
        let harness = Harness::new(ScriptedRunner::new());
        let report = harness
            .executor(fast())
            .deploy(&manifest(vec![frontend(), backend()]), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        let commands: Vec<String> = harness.runner.calls().into_iter().map(|c| c.command).collect();
        assert_eq!(commands, vec!["backend: npm ci", "frontend: npm run build"]);

        let backend_url = report.service("backend").unwrap().address.clone().unwrap().url;
        let frontend = report.service("frontend").unwrap();
        assert_eq!(frontend.env["VITE_API_URL"], backend_url);

        let build_env = &harness.runner.calls()[1].env;
        assert_eq!(build_env["VITE_API_URL"], backend_url);
    }

    #[tokio::test]
    async fn test_failed_dependency_is_never_built_or_live() {
        let runner = ScriptedRunner::new().script("backend: npm ci", vec![fail(1, "syntax error")]);
        let harness = Harness::new(runner);
        let report = harness
            .executor(fast())
            .deploy(&manifest(vec![frontend(), backend()]), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(harness.runner.count("frontend: npm run build"), 0);
        assert!(harness.platform.deployed().is_empty());

        let backend = report.service("backend").unwrap();
        assert_eq!(backend.state, ServiceRunState::BuildFailed);
        assert_eq!(backend.attempts, 1);

        let frontend = report.service("frontend").unwrap();
        assert_ne!(frontend.state, ServiceRunState::Live);
        let failure = frontend.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::DependencyFailed);
        assert_eq!(failure.root_cause, "backend");
        assert_eq!(report.root_causes, vec!["backend"]);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let runner = ScriptedRunner::new().script(
            "backend: npm ci",
            vec![fail(1, "npm ERR! code ECONNRESET"), fail(75, ""), ok()],
        );
        let harness = Harness::new(runner);
        let report = harness
            .executor(fast())
            .deploy(&manifest(vec![backend()]), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.service("backend").unwrap().attempts, 3);
        assert_eq!(harness.runner.count("backend: npm ci"), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let runner = ScriptedRunner::new().script("backend: npm ci", vec![fail(75, "")]);
        let harness = Harness::new(runner);
        let config = fast().with_retry(
            RetryPolicy::default()
                .with_base_delay(Duration::from_millis(1))
                .with_max_retries(1),
        );
        let report = harness
            .executor(config)
            .deploy(&manifest(vec![backend()]), None)
            .await
            .unwrap();

        let backend = report.service("backend").unwrap();
        assert_eq!(backend.state, ServiceRunState::BuildFailed);
        assert_eq!(backend.attempts, 2);
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let runner = ScriptedRunner::new().delay("backend: npm ci", Duration::from_secs(5));
        let harness = Harness::new(runner);
        let config = fast().with_build_timeout(Duration::from_millis(50));
        let report = harness
            .executor(config)
            .deploy(&manifest(vec![backend()]), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        let backend = report.service("backend").unwrap();
        assert_eq!(backend.state, ServiceRunState::BuildFailed);
        assert_eq!(backend.failure.as_ref().unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_run_timeout_cancels_unfinished_services() {
        let runner = ScriptedRunner::new().delay("backend: npm ci", Duration::from_secs(5));
        let harness = Harness::new(runner);
        let config = fast().with_run_timeout(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = harness
            .executor(config)
            .with_event_channel(tx)
            .deploy(&manifest(vec![frontend(), backend()]), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::TimedOut);
        for name in ["backend", "frontend"] {
            assert_eq!(report.service(name).unwrap().state, ServiceRunState::Cancelled);
        }
        assert_eq!(harness.runner.count("frontend: npm run build"), 0);

        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::RunCompleted { outcome } = event {
                completed = Some(outcome);
            }
        }
        assert_eq!(completed, Some(RunOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let mut runner = ScriptedRunner::new();
        let mut services = Vec::new();
        for i in 0..6 {
            let step = format!("build-{}", i);
            runner = runner.delay(&step, Duration::from_millis(30));
            services.push(Service::process(&format!("svc-{}", i), "run").with_build(&[&step]));
        }
        let harness = Harness::new(runner);
        let report = harness
            .executor(fast().with_max_parallel(2))
            .deploy(&manifest(services), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(harness.runner.calls().len(), 6);
        assert!(harness.runner.peak_concurrency() <= 2);
    }

    #[tokio::test]
    async fn test_rerun_on_unchanged_changeset_builds_nothing() {
        let harness = Harness::new(ScriptedRunner::new());
        let services = manifest(vec![frontend(), backend()]);

        let first = harness.executor(fast()).deploy(&services, None).await.unwrap();
        assert_eq!(first.outcome, RunOutcome::Succeeded);
        assert_eq!(harness.runner.calls().len(), 2);
        assert_eq!(harness.store.list().await.unwrap().len(), 2);

        let unchanged = Changeset::from_paths(["README.md"]);
        let second = harness
            .executor(fast())
            .deploy(&services, Some(&unchanged))
            .await
            .unwrap();
        assert_eq!(second.outcome, RunOutcome::Succeeded);
        assert_eq!(harness.runner.calls().len(), 2);
        assert!(second.services.iter().all(|s| s.reused));
        assert_eq!(
            second.service("frontend").unwrap().address,
            first.service("frontend").unwrap().address
        );
    }

    #[tokio::test]
    async fn test_unaffected_service_without_record_is_built() {
        let harness = Harness::new(ScriptedRunner::new());
        let unchanged = Changeset::from_paths(["README.md"]);
        let report = harness
            .executor(fast())
            .deploy(&manifest(vec![backend()]), Some(&unchanged))
            .await
            .unwrap();

        let backend = report.service("backend").unwrap();
        assert!(!backend.affected);
        assert!(!backend.reused);
        assert_eq!(backend.state, ServiceRunState::Live);
        assert_eq!(harness.runner.count("backend: npm ci"), 1);
    }

    #[tokio::test]
    async fn test_changed_dependency_rebuilds_dependent_env() {
        let harness = Harness::new(ScriptedRunner::new());
        let services = manifest(vec![frontend(), backend()]);
        harness.executor(fast()).deploy(&services, None).await.unwrap();

        // backend redeploys on a new port, so frontend's env changes too
        let changes = Changeset::from_paths(["server/index.js"]);
        let report = harness
            .executor(fast())
            .deploy(&services, Some(&changes))
            .await
            .unwrap();
        assert!(!report.service("frontend").unwrap().affected);
        assert!(!report.service("frontend").unwrap().reused);
        assert_eq!(harness.runner.count("frontend: npm run build"), 2);
    }

    #[tokio::test]
    async fn test_route_dependent_is_never_attempted_when_upstream_fails() {
        let site = Service::static_site("site")
            .with_build(&["site: build"])
            .with_route(RouteRule::rewrite("/api/*", "/api").with_upstream("backend"));
        let harness =
            Harness::with_platform(ScriptedRunner::new(), RecordingPlatform::new().failing("backend"));
        let report = harness
            .executor(fast())
            .deploy(&manifest(vec![site, backend()]), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(harness.platform.deployed(), vec!["backend"]);
        assert_eq!(harness.runner.count("site: build"), 0);
        assert!(!harness.platform.rolled_back().contains(&"site".to_string()));

        let backend = report.service("backend").unwrap();
        assert_eq!(backend.failure.as_ref().unwrap().kind, FailureKind::Deploy);
        let site = report.service("site").unwrap();
        assert_eq!(site.state, ServiceRunState::RolledBack);
        assert!(site.address.is_none());
        let failure = site.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::DependencyFailed);
        assert_eq!(failure.root_cause, "backend");
        assert_eq!(report.root_causes, vec!["backend"]);
    }

    #[tokio::test]
    async fn test_one_executor_runs_repeatedly() {
        let harness = Harness::new(ScriptedRunner::new());
        let executor = harness.executor(fast());
        let services = manifest(vec![frontend(), backend()]);

        let first = executor.deploy(&services, None).await.unwrap();
        assert_eq!(first.outcome, RunOutcome::Succeeded);

        let second = executor.deploy(&services, None).await.unwrap();
        assert_eq!(second.outcome, RunOutcome::Succeeded);
        assert!(harness.platform.rolled_back().is_empty());
        assert_eq!(harness.runner.calls().len(), 4);

        let unchanged = Changeset::from_paths(["README.md"]);
        let third = executor.deploy(&services, Some(&unchanged)).await.unwrap();
        assert_eq!(third.outcome, RunOutcome::Succeeded);
        assert!(third.services.iter().all(|s| s.reused));
        assert_eq!(harness.runner.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_stopped_deployment_is_rebuilt_not_reused() {
        let services = manifest(vec![backend()]);
        let store = Arc::new(MemoryStore::new());
        let first = Harness {
            runner: Arc::new(ScriptedRunner::new()),
            platform: Arc::new(RecordingPlatform::new()),
            store: store.clone(),
        };
        first.executor(fast()).deploy(&services, None).await.unwrap();
        assert!(store.get("backend").await.unwrap().is_some());

        // Same store, but the platform no longer runs the old process.
        let second = Harness {
            runner: Arc::new(ScriptedRunner::new()),
            platform: Arc::new(RecordingPlatform::new().stopped("backend")),
            store,
        };
        let unchanged = Changeset::from_paths(["README.md"]);
        let report = second
            .executor(fast())
            .deploy(&services, Some(&unchanged))
            .await
            .unwrap();

        let backend = report.service("backend").unwrap();
        assert_eq!(backend.state, ServiceRunState::Live);
        assert!(!backend.reused);
        assert_eq!(second.runner.count("backend: npm ci"), 1);
        assert_eq!(second.platform.deployed(), vec!["backend"]);
    }

    #[tokio::test]
    async fn test_reference_that_never_resolves_fails_dependents() {
        // Static sites have no port, so DOCS_PORT can never resolve.
        let docs = Service::static_site("docs").with_build(&["docs: build"]);
        let web = Service::process("web", "run")
            .with_build(&["web: build"])
            .with_env(EnvVar::from_service("DOCS_PORT", "docs", ServiceProperty::Port));
        let admin = Service::static_site("admin")
            .with_build(&["admin: build"])
            .with_env(EnvVar::from_service("WEB_URL", "web", ServiceProperty::Url));
        let harness = Harness::new(ScriptedRunner::new());
        let report = harness
            .executor(fast())
            .deploy(&manifest(vec![admin, web, docs]), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.service("docs").unwrap().state, ServiceRunState::Live);

        let web = report.service("web").unwrap();
        assert_eq!(web.state, ServiceRunState::BuildFailed);
        let failure = web.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::UnresolvedReference);
        assert!(failure.message.contains("DOCS_PORT"));

        let admin = report.service("admin").unwrap();
        assert_ne!(admin.state, ServiceRunState::Live);
        assert_eq!(admin.failure.as_ref().unwrap().kind, FailureKind::DependencyFailed);
        assert_eq!(admin.failure.as_ref().unwrap().root_cause, "web");

        assert_eq!(report.root_causes, vec!["web"]);
        assert_eq!(harness.runner.count("web: build"), 0);
        assert_eq!(harness.runner.count("admin: build"), 0);
    }

    #[tokio::test]
    async fn test_independent_branches_report_identically_in_any_order() {
        fn branch(prefix: &str) -> Vec<Service> {
            vec![
                Service::static_site(&format!("{}-api", prefix))
                    .with_build(&[&format!("{}-api", prefix)]),
                Service::static_site(&format!("{}-web", prefix))
                    .with_build(&[&format!("{}-web", prefix)])
                    .with_env(EnvVar::from_service(
                        "API_URL",
                        &format!("{}-api", prefix),
                        ServiceProperty::Url,
                    )),
            ]
        }
        let services = manifest([branch("a"), branch("b")].concat());

        let mut projections = Vec::new();
        for (slow, fast_step) in [("a-api", "b-api"), ("b-api", "a-api")] {
            let runner = ScriptedRunner::new()
                .delay(slow, Duration::from_millis(40))
                .delay(fast_step, Duration::from_millis(1));
            let harness = Harness::new(runner);
            let report = harness.executor(fast()).deploy(&services, None).await.unwrap();
            let projection: Vec<_> = report
                .services
                .iter()
                .map(|s| (s.name.clone(), s.state, s.env.clone(), s.address.clone()))
                .collect();
            projections.push(projection);
        }
        assert_eq!(projections[0], projections[1]);
    }

    #[tokio::test]
    async fn test_service_without_build_steps_deploys() {
        let harness = Harness::new(ScriptedRunner::new());
        let report = harness
            .executor(fast())
            .deploy(&manifest(vec![Service::process("worker", "run")]), None)
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.service("worker").unwrap().attempts, 1);
        assert!(harness.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_events_trace_the_run() {
        let runner = ScriptedRunner::new().script("backend: npm ci", vec![fail(75, ""), ok()]);
        let harness = Harness::new(runner);
        let (tx, mut rx) = mpsc::unbounded_channel();
        harness
            .executor(fast())
            .with_event_channel(tx)
            .deploy(&manifest(vec![frontend(), backend()]), None)
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let json = serde_json::to_value(&event).unwrap();
            kinds.push(json["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("run_started"));
        assert_eq!(kinds.last().map(String::as_str), Some("run_completed"));
        assert!(kinds.contains(&"service_blocked".to_string()));
        assert!(kinds.contains(&"build_retry".to_string()));
        assert_eq!(kinds.iter().filter(|k| *k == "service_live").count(), 2);
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_build() {
        let a = Service::process("a", "run")
            .with_build(&["a"])
            .with_env(EnvVar::from_service("B", "b", ServiceProperty::Url));
        let b = Service::process("b", "run")
            .with_build(&["b"])
            .with_env(EnvVar::from_service("A", "a", ServiceProperty::Url));
        let harness = Harness::new(ScriptedRunner::new());
        let err = harness
            .executor(fast())
            .deploy(&manifest(vec![a, b]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::Cycle { .. }));
        assert!(harness.runner.calls().is_empty());
    }
}
