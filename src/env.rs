//! Environment resolution.
//!
//! [`LiveAddresses`] is the only mutable state shared between build tasks: a
//! map from service name to its published address, written once per service
//! when it goes live and read by every dependent. [`resolve_env`] turns a
//! service's env entries into concrete strings against that map.

use crate::errors::{DeployError, UnresolvedReferenceError};
use crate::manifest::{DatabaseProperty, EnvValue, Service, ServiceProperty};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Where a live service can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub url: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Address {
    pub fn new(url: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            url: url.into(),
            host: host.into(),
            port,
        }
    }

    /// Address of an HTTP process listening on `host:port`.
    pub fn http(host: &str, port: u16) -> Self {
        Self::new(format!("http://{}:{}", host, port), host, Some(port))
    }

    pub fn property(&self, property: ServiceProperty) -> Option<String> {
        match property {
            ServiceProperty::Url => Some(self.url.clone()),
            ServiceProperty::Host => Some(self.host.clone()),
            ServiceProperty::Port => self.port.map(|p| p.to_string()),
        }
    }
}

/// Concrete values of database properties, keyed by database name.
pub type DatabaseValues = HashMap<(String, DatabaseProperty), String>;

/// Live addresses published during a run.
///
/// Each key is written at most once; the map-level lock only guards the
/// insertion itself.
#[derive(Debug, Clone, Default)]
pub struct LiveAddresses {
    inner: Arc<RwLock<HashMap<String, Address>>>,
}

impl LiveAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a service's address. A second publish for the same service is
    /// rejected.
    pub fn publish(&self, service: &str, address: Address) -> Result<(), DeployError> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(service) {
            return Err(DeployError::AlreadyPublished {
                service: service.to_string(),
            });
        }
        map.insert(service.to_string(), address);
        Ok(())
    }

    pub fn get(&self, service: &str) -> Option<Address> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service)
    }

    pub fn snapshot(&self) -> HashMap<String, Address> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of resolving a service's environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvResolution {
    /// Every entry has a concrete value.
    Ready(BTreeMap<String, String>),
    /// These referenced services have no live address yet.
    Waiting(Vec<String>),
}

/// Resolve every env entry of `service` against the live addresses.
///
/// A target that is not live yet is reported through
/// [`EnvResolution::Waiting`]; that is the ordering mechanism, not an error.
/// A property the live target cannot provide is an error.
pub fn resolve_env(
    service: &Service,
    live: &LiveAddresses,
    databases: &DatabaseValues,
) -> Result<EnvResolution, UnresolvedReferenceError> {
    let mut resolved = BTreeMap::new();
    let mut waiting = Vec::new();

    for var in &service.env {
        match &var.value {
            EnvValue::Literal(value) => {
                resolved.insert(var.key.clone(), value.clone());
            }
            EnvValue::Service {
                target, property, ..
            } => match live.get(target) {
                Some(address) => {
                    let value =
                        address
                            .property(*property)
                            .ok_or_else(|| UnresolvedReferenceError {
                                service: service.name.clone(),
                                key: var.key.clone(),
                                target: target.clone(),
                                reason: format!("address has no {}", property),
                            })?;
                    resolved.insert(var.key.clone(), value);
                }
                None => {
                    if !waiting.contains(target) {
                        waiting.push(target.clone());
                    }
                }
            },
            EnvValue::Database { name, property } => {
                let value = databases
                    .get(&(name.clone(), *property))
                    .ok_or_else(|| UnresolvedReferenceError {
                        service: service.name.clone(),
                        key: var.key.clone(),
                        target: name.clone(),
                        reason: format!("database does not provide {}", property),
                    })?;
                resolved.insert(var.key.clone(), value.clone());
            }
        }
    }

    if waiting.is_empty() {
        Ok(EnvResolution::Ready(resolved))
    } else {
        Ok(EnvResolution::Waiting(waiting))
    }
}

/// Turn a reference that is still waiting after the schedule is exhausted
/// into an error.
pub fn unresolved_after_exhaustion(service: &Service, target: &str) -> UnresolvedReferenceError {
    let key = service
        .env
        .iter()
        .find(|v| v.service_target() == Some(target))
        .map(|v| v.key.clone())
        .unwrap_or_default();
    UnresolvedReferenceError {
        service: service.name.clone(),
        key,
        target: target.to_string(),
        reason: "target never went live".to_string(),
    }
}
