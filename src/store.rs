//! Persistence of what is currently deployed.
//!
//! Records survive between runs and decide whether an unaffected service can
//! be reused without rebuilding.

use crate::env::Address;
use crate::manifest::Service;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::Mutex;

/// The last successful deploy of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub service: String,
    pub address: Address,
    pub fingerprint: String,
    pub deployed_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn new(service: &str, address: Address, fingerprint: String) -> Self {
        Self {
            service: service.to_string(),
            address,
            fingerprint,
            deployed_at: Utc::now(),
        }
    }
}

/// SHA-256 over build steps, start command and resolved environment.
pub fn fingerprint(service: &Service, env: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service.kind.to_string().as_bytes());
    for step in &service.build {
        hasher.update(b"build\0");
        hasher.update(step.as_bytes());
        hasher.update(b"\0");
    }
    if let Some(start) = &service.start {
        hasher.update(b"start\0");
        hasher.update(start.as_bytes());
        hasher.update(b"\0");
    }
    for (key, value) in env {
        hasher.update(b"env\0");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn get(&self, service: &str) -> Result<Option<DeploymentRecord>>;

    /// Insert or replace the record for `record.service`.
    async fn record(&self, record: DeploymentRecord) -> Result<()>;

    async fn remove(&self, service: &str) -> Result<()>;

    /// All records, ordered by service name.
    async fn list(&self) -> Result<Vec<DeploymentRecord>>;
}

/// In-memory store for tests and one-off runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, DeploymentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn get(&self, service: &str) -> Result<Option<DeploymentRecord>> {
        let records = self.records.read().map_err(|_| anyhow!("lock poisoned"))?;
        Ok(records.get(service).cloned())
    }

    async fn record(&self, record: DeploymentRecord) -> Result<()> {
        let mut records = self.records.write().map_err(|_| anyhow!("lock poisoned"))?;
        records.insert(record.service.clone(), record);
        Ok(())
    }

    async fn remove(&self, service: &str) -> Result<()> {
        let mut records = self.records.write().map_err(|_| anyhow!("lock poisoned"))?;
        records.remove(service);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        let records = self.records.read().map_err(|_| anyhow!("lock poisoned"))?;
        let mut all: Vec<DeploymentRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(all)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    deployments: BTreeMap<String, DeploymentRecord>,
}

/// Store backed by a JSON file, rewritten on every change.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_state(&self) -> Result<StateFile> {
        if !self.path.exists() {
            return Ok(StateFile::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))
    }

    fn write_state(&self, state: &StateFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let content = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for JsonFileStore {
    async fn get(&self, service: &str) -> Result<Option<DeploymentRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_state()?.deployments.remove(service))
    }

    async fn record(&self, record: DeploymentRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.read_state()?;
        state.deployments.insert(record.service.clone(), record);
        self.write_state(&state)
    }

    async fn remove(&self, service: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.read_state()?;
        if state.deployments.remove(service).is_some() {
            self.write_state(&state)?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_state()?.deployments.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fingerprint_tracks_inputs() {
        let service = Service::process("api", "node index.js").with_build(&["npm ci"]);
        let base = fingerprint(&service, &env(&[("NODE_ENV", "production")]));
        assert_eq!(base.len(), 64);
        assert_eq!(
            base,
            fingerprint(&service, &env(&[("NODE_ENV", "production")]))
        );

        let changed_env = fingerprint(&service, &env(&[("NODE_ENV", "staging")]));
        assert_ne!(base, changed_env);

        let changed_build = fingerprint(
            &service.clone().with_build(&["npm ci", "npm run build"]),
            &env(&[("NODE_ENV", "production")]),
        );
        assert_ne!(base, changed_build);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get("api").await.unwrap().is_none());

        let record =
            DeploymentRecord::new("api", Address::http("127.0.0.1", 10000), "abc".to_string());
        store.record(record.clone()).await.unwrap();
        assert_eq!(store.get("api").await.unwrap(), Some(record));

        store.remove("api").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".rollout/state.json");

        let store = JsonFileStore::new(&path);
        store
            .record(DeploymentRecord::new(
                "web",
                Address::new("file:///srv/web", "localhost", None),
                "f1".to_string(),
            ))
            .await
            .unwrap();
        store
            .record(DeploymentRecord::new(
                "api",
                Address::http("127.0.0.1", 10000),
                "f2".to_string(),
            ))
            .await
            .unwrap();

        let reopened = JsonFileStore::new(&path);
        let names: Vec<String> = reopened
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.service)
            .collect();
        assert_eq!(names, vec!["api", "web"]);
        assert_eq!(
            reopened.get("api").await.unwrap().unwrap().fingerprint,
            "f2"
        );
    }

    #[tokio::test]
    async fn test_json_store_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        let store = JsonFileStore::new(&path);
        let err = store.get("api").await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse state file"));
    }
}
