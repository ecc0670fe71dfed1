//! Deploy targets.
//!
//! A `Platform` activates a built service and hands back the address it can
//! be reached at. `LocalPlatform` runs process services on this machine and
//! publishes static services straight from their build output.

use crate::env::{Address, DatabaseValues};
use crate::errors::DeployError;
use crate::manifest::{Database, DatabaseProperty, Manifest, Service, ServiceKind};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Everything needed to activate one built service.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub service: Service,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Start or publish the service and return its address.
    async fn deploy(&self, request: &DeployRequest) -> Result<Address, DeployError>;

    /// Undo a deploy made earlier in this run.
    async fn rollback(&self, service: &str) -> Result<(), DeployError>;

    /// Whether a deployment recorded by an earlier run still serves at
    /// `address`. Only such deployments may be reused.
    async fn is_running(&self, service: &Service, address: &Address) -> bool;

    /// Value of a property of an externally provisioned database.
    fn database_property(&self, database: &Database, property: DatabaseProperty)
    -> Option<String>;
}

/// Look up every database property the manifest could reference.
pub fn database_values(platform: &dyn Platform, manifest: &Manifest) -> DatabaseValues {
    const PROPERTIES: [DatabaseProperty; 5] = [
        DatabaseProperty::ConnectionString,
        DatabaseProperty::Host,
        DatabaseProperty::Port,
        DatabaseProperty::User,
        DatabaseProperty::Database,
    ];
    let mut values = DatabaseValues::new();
    for database in manifest.databases() {
        for property in PROPERTIES {
            if let Some(value) = platform.database_property(database, property) {
                values.insert((database.name.clone(), property), value);
            }
        }
    }
    values
}

/// Settings for [`LocalPlatform`].
#[derive(Debug, Clone)]
pub struct LocalPlatformConfig {
    pub host: String,
    pub base_port: u16,
    pub startup_grace: Duration,
    /// Where process stdout/stderr go; discarded when unset
    pub log_dir: Option<PathBuf>,
    pub database_host: String,
    pub database_port: u16,
}

impl Default for LocalPlatformConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: 10000,
            startup_grace: Duration::from_millis(1500),
            log_dir: None,
            database_host: "localhost".to_string(),
            database_port: 5432,
        }
    }
}

/// Runs process services as local children and serves static services from
/// their publish directory.
pub struct LocalPlatform {
    config: LocalPlatformConfig,
    next_port: AtomicU16,
    running: Mutex<HashMap<String, Child>>,
}

impl LocalPlatform {
    pub fn new(config: LocalPlatformConfig) -> Self {
        let next_port = AtomicU16::new(config.base_port);
        Self {
            config,
            next_port,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn allocate_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }

    fn output_for(&self, service: &str) -> Result<(Stdio, Stdio), DeployError> {
        let Some(dir) = &self.config.log_dir else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let open = || -> std::io::Result<(Stdio, Stdio)> {
            std::fs::create_dir_all(dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{}.log", service)))?;
            let err = file.try_clone()?;
            Ok((Stdio::from(file), Stdio::from(err)))
        };
        open().map_err(|e| DeployError::StartFailed {
            service: service.to_string(),
            message: format!("failed to open log file: {}", e),
        })
    }

    async fn publish_static(&self, request: &DeployRequest) -> Result<Address, DeployError> {
        let service = &request.service;
        let dir = match &service.static_publish_path {
            Some(path) => request.working_dir.join(path),
            None => request.working_dir.clone(),
        };
        if !dir.is_dir() {
            return Err(DeployError::MissingPublishDir {
                service: service.name.clone(),
                path: dir,
            });
        }
        let dir = dir.canonicalize().unwrap_or(dir);
        info!(service = %service.name, path = %dir.display(), "Published static site");
        Ok(Address::new(
            format!("file://{}", dir.display()),
            "localhost",
            None,
        ))
    }

    async fn start_process(&self, request: &DeployRequest) -> Result<Address, DeployError> {
        let service = &request.service;
        let start = service
            .start
            .as_deref()
            .ok_or_else(|| DeployError::StartFailed {
                service: service.name.clone(),
                message: "no start command".to_string(),
            })?;

        let port = self.allocate_port();
        let (stdout, stderr) = self.output_for(&service.name)?;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(start)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeployError::StartFailed {
                service: service.name.clone(),
                message: e.to_string(),
            })?;

        debug!(service = %service.name, port, "Waiting out startup grace period");
        match tokio::time::timeout(self.config.startup_grace, child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                return Err(DeployError::StartFailed {
                    service: service.name.clone(),
                    message: format!("process exited with {}", status),
                });
            }
            Ok(Ok(_)) => {
                debug!(service = %service.name, "Start command exited cleanly");
            }
            Ok(Err(e)) => {
                return Err(DeployError::StartFailed {
                    service: service.name.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                self.running.lock().await.insert(service.name.clone(), child);
            }
        }

        info!(service = %service.name, port, "Process service started");
        Ok(Address::http(&self.config.host, port))
    }

    /// Names of processes currently held by this platform.
    pub async fn running_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Held processes that have not exited. Reaps those that have.
    async fn process_alive(&self, service: &str) -> bool {
        let mut running = self.running.lock().await;
        let Some(child) = running.get_mut(service) else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(service = %service, status = %status, "Process has exited");
                running.remove(service);
                false
            }
            Err(e) => {
                warn!(service = %service, error = %e, "Failed to poll process");
                false
            }
        }
    }

    /// Keep every started process alive until it exits on its own.
    pub async fn wait_all(&self) {
        let children: Vec<(String, Child)> = self.running.lock().await.drain().collect();
        for (name, mut child) in children {
            if let Err(e) = child.wait().await {
                warn!(service = %name, error = %e, "Failed waiting for process");
            }
        }
    }
}

#[async_trait]
impl Platform for LocalPlatform {
    async fn deploy(&self, request: &DeployRequest) -> Result<Address, DeployError> {
        match request.service.kind {
            ServiceKind::Static => self.publish_static(request).await,
            ServiceKind::Process => self.start_process(request).await,
        }
    }

    async fn rollback(&self, service: &str) -> Result<(), DeployError> {
        let Some(mut child) = self.running.lock().await.remove(service) else {
            return Ok(());
        };
        child
            .kill()
            .await
            .map_err(|e| DeployError::RollbackFailed {
                service: service.to_string(),
                message: e.to_string(),
            })?;
        info!(service = %service, "Stopped process");
        Ok(())
    }

    async fn is_running(&self, service: &Service, address: &Address) -> bool {
        match service.kind {
            ServiceKind::Static => address
                .url
                .strip_prefix("file://")
                .is_some_and(|path| Path::new(path).is_dir()),
            // Processes die with the platform that started them.
            ServiceKind::Process => self.process_alive(&service.name).await,
        }
    }

    fn database_property(
        &self,
        database: &Database,
        property: DatabaseProperty,
    ) -> Option<String> {
        let user = database.user.as_deref().unwrap_or(&database.name);
        let name = database.database_name.as_deref().unwrap_or(&database.name);
        let value = match property {
            DatabaseProperty::Host => self.config.database_host.clone(),
            DatabaseProperty::Port => self.config.database_port.to_string(),
            DatabaseProperty::User => user.to_string(),
            DatabaseProperty::Database => name.to_string(),
            DatabaseProperty::ConnectionString => format!(
                "postgres://{}@{}:{}/{}",
                user, self.config.database_host, self.config.database_port, name
            ),
        };
        Some(value)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    /// Records deploys and rollbacks; fails deploys for chosen services.
    #[derive(Default)]
    pub struct RecordingPlatform {
        failing: HashSet<String>,
        stopped: HashSet<String>,
        next_port: AtomicU16,
        deployed: StdMutex<Vec<DeployRequest>>,
        rolled_back: StdMutex<Vec<String>>,
    }

    impl RecordingPlatform {
        pub fn new() -> Self {
            Self {
                next_port: AtomicU16::new(10000),
                ..Default::default()
            }
        }

        pub fn failing(mut self, service: &str) -> Self {
            self.failing.insert(service.to_string());
            self
        }

        /// Report earlier deployments of `service` as no longer running.
        pub fn stopped(mut self, service: &str) -> Self {
            self.stopped.insert(service.to_string());
            self
        }

        pub fn deployed(&self) -> Vec<String> {
            self.deployed
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.service.name.clone())
                .collect()
        }

        pub fn deploy_request(&self, service: &str) -> Option<DeployRequest> {
            self.deployed
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.service.name == service)
                .cloned()
        }

        pub fn rolled_back(&self) -> Vec<String> {
            self.rolled_back.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Platform for RecordingPlatform {
        async fn deploy(&self, request: &DeployRequest) -> Result<Address, DeployError> {
            self.deployed.lock().unwrap().push(request.clone());
            let name = &request.service.name;
            if self.failing.contains(name) {
                return Err(DeployError::StartFailed {
                    service: name.clone(),
                    message: "health check failed".to_string(),
                });
            }
            Ok(match request.service.kind {
                ServiceKind::Static => {
                    Address::new(format!("https://{}.example.com", name), format!("{}.example.com", name), None)
                }
                ServiceKind::Process => {
                    Address::http("127.0.0.1", self.next_port.fetch_add(1, Ordering::SeqCst))
                }
            })
        }

        async fn rollback(&self, service: &str) -> Result<(), DeployError> {
            self.rolled_back.lock().unwrap().push(service.to_string());
            Ok(())
        }

        async fn is_running(&self, service: &Service, _address: &Address) -> bool {
            !self.stopped.contains(&service.name)
        }

        fn database_property(
            &self,
            database: &Database,
            property: DatabaseProperty,
        ) -> Option<String> {
            match property {
                DatabaseProperty::ConnectionString => {
                    Some(format!("postgres://test@db/{}", database.name))
                }
                _ => None,
            }
        }
    }
}
