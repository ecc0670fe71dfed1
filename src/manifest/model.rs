//! Immutable typed representation of a deployment manifest.
//!
//! A `Manifest` can only be obtained through [`Manifest::new`], which enforces
//! every per-service invariant. Reference cycles are the one thing it does not
//! check: that is the dependency resolver's job.

use crate::errors::ManifestError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Whether a service is a published asset bundle or a long-running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Static,
    Process,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Static => write!(f, "static"),
            ServiceKind::Process => write!(f, "process"),
        }
    }
}

/// Property of another service's live address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProperty {
    Url,
    Host,
    Port,
}

impl fmt::Display for ServiceProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceProperty::Url => write!(f, "url"),
            ServiceProperty::Host => write!(f, "host"),
            ServiceProperty::Port => write!(f, "port"),
        }
    }
}

impl FromStr for ServiceProperty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "url" => Ok(ServiceProperty::Url),
            "host" => Ok(ServiceProperty::Host),
            "port" => Ok(ServiceProperty::Port),
            other => Err(other.to_string()),
        }
    }
}

/// Property of an externally provisioned database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DatabaseProperty {
    ConnectionString,
    Host,
    Port,
    User,
    Database,
}

impl fmt::Display for DatabaseProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseProperty::ConnectionString => write!(f, "connectionString"),
            DatabaseProperty::Host => write!(f, "host"),
            DatabaseProperty::Port => write!(f, "port"),
            DatabaseProperty::User => write!(f, "user"),
            DatabaseProperty::Database => write!(f, "database"),
        }
    }
}

impl FromStr for DatabaseProperty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connectionString" => Ok(DatabaseProperty::ConnectionString),
            "host" => Ok(DatabaseProperty::Host),
            "port" => Ok(DatabaseProperty::Port),
            "user" => Ok(DatabaseProperty::User),
            "database" => Ok(DatabaseProperty::Database),
            other => Err(other.to_string()),
        }
    }
}

/// Value of an environment entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Literal(String),
    /// Resolved from another service's live address.
    Service {
        target: String,
        /// Declared type of the target, checked against the manifest if set.
        target_type: Option<String>,
        property: ServiceProperty,
    },
    /// Resolved from an externally provisioned database.
    Database {
        name: String,
        property: DatabaseProperty,
    },
}

/// A single `KEY=value` entry in a service environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: EnvValue,
}

impl EnvVar {
    pub fn literal(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: EnvValue::Literal(value.to_string()),
        }
    }

    pub fn from_service(key: &str, target: &str, property: ServiceProperty) -> Self {
        Self {
            key: key.to_string(),
            value: EnvValue::Service {
                target: target.to_string(),
                target_type: None,
                property,
            },
        }
    }

    pub fn from_database(key: &str, name: &str, property: DatabaseProperty) -> Self {
        Self {
            key: key.to_string(),
            value: EnvValue::Database {
                name: name.to_string(),
                property,
            },
        }
    }

    /// The service this entry depends on, if any.
    pub fn service_target(&self) -> Option<&str> {
        match &self.value {
            EnvValue::Service { target, .. } => Some(target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Rewrite,
    Redirect,
}

/// A routing rule attached to a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub kind: RouteKind,
    pub source: String,
    pub destination: String,
    /// Service this route proxies to; ordering-only dependency.
    pub upstream: Option<String>,
}

impl RouteRule {
    pub fn rewrite(source: &str, destination: &str) -> Self {
        Self {
            kind: RouteKind::Rewrite,
            source: source.to_string(),
            destination: destination.to_string(),
            upstream: None,
        }
    }

    pub fn with_upstream(mut self, upstream: &str) -> Self {
        self.upstream = Some(upstream.to_string());
        self
    }

    /// A rewrite that applies to every request path.
    pub fn is_catch_all_rewrite(&self) -> bool {
        self.kind == RouteKind::Rewrite && matches!(self.source.as_str(), "/*" | "/**")
    }
}

/// Include/ignore glob lists deciding whether a changeset affects a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildFilter {
    pub paths: Vec<String>,
    pub ignored_paths: Vec<String>,
}

impl BuildFilter {
    pub fn new(paths: &[&str], ignored_paths: &[&str]) -> Self {
        Self {
            paths: paths.iter().map(|s| s.to_string()).collect(),
            ignored_paths: ignored_paths.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A deployable unit of the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub kind: ServiceKind,
    /// Raw `type` string from the manifest (`web`, `pserv`, `worker`, ...).
    pub declared_type: String,
    pub runtime: Option<String>,
    /// Build steps, run in order; the first failing step fails the attempt.
    pub build: Vec<String>,
    pub start: Option<String>,
    /// Working directory relative to the project directory.
    pub root_dir: Option<PathBuf>,
    pub static_publish_path: Option<PathBuf>,
    pub env: Vec<EnvVar>,
    pub routes: Vec<RouteRule>,
    pub build_filter: Option<BuildFilter>,
}

impl Service {
    /// A long-running process service.
    pub fn process(name: &str, start: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ServiceKind::Process,
            declared_type: "web".to_string(),
            runtime: None,
            build: Vec::new(),
            start: Some(start.to_string()),
            root_dir: None,
            static_publish_path: None,
            env: Vec::new(),
            routes: Vec::new(),
            build_filter: None,
        }
    }

    /// A static-asset service.
    pub fn static_site(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ServiceKind::Static,
            declared_type: "web".to_string(),
            runtime: Some("static".to_string()),
            build: Vec::new(),
            start: None,
            root_dir: None,
            static_publish_path: None,
            env: Vec::new(),
            routes: Vec::new(),
            build_filter: None,
        }
    }

    pub fn with_build(mut self, steps: &[&str]) -> Self {
        self.build = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_env(mut self, var: EnvVar) -> Self {
        self.env.push(var);
        self
    }

    pub fn with_route(mut self, route: RouteRule) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_filter(mut self, filter: BuildFilter) -> Self {
        self.build_filter = Some(filter);
        self
    }

    pub fn with_root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    pub fn with_publish_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_publish_path = Some(dir.into());
        self
    }

    /// Services this one needs live before it can build (env references).
    pub fn env_targets(&self) -> impl Iterator<Item = &str> {
        self.env.iter().filter_map(EnvVar::service_target)
    }

    /// Services this one proxies to through its routes.
    pub fn route_targets(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().filter_map(|r| r.upstream.as_deref())
    }
}

/// An externally provisioned database the services may reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Database {
    pub name: String,
    pub database_name: Option<String>,
    pub user: Option<String>,
}

/// A validated manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    services: Vec<Service>,
    databases: Vec<Database>,
}

impl Manifest {
    /// Validate and wrap services and databases.
    pub fn new(services: Vec<Service>, databases: Vec<Database>) -> Result<Self, ManifestError> {
        let mut database_names = HashSet::new();
        for db in &databases {
            if !database_names.insert(db.name.as_str()) {
                return Err(ManifestError::DuplicateDatabase {
                    name: db.name.clone(),
                });
            }
        }

        let mut service_names = HashSet::new();
        for service in &services {
            if service.name.trim().is_empty() {
                return Err(ManifestError::MissingField {
                    service: service.name.clone(),
                });
            }
            if !service_names.insert(service.name.as_str()) {
                return Err(ManifestError::DuplicateService {
                    name: service.name.clone(),
                });
            }
        }

        for service in &services {
            Self::validate_service(service, &services, &database_names)?;
        }

        Ok(Self {
            services,
            databases,
        })
    }

    fn validate_service(
        service: &Service,
        services: &[Service],
        databases: &HashSet<&str>,
    ) -> Result<(), ManifestError> {
        match (service.kind, &service.start) {
            (ServiceKind::Process, None) => {
                return Err(ManifestError::MissingStartCommand {
                    service: service.name.clone(),
                });
            }
            (ServiceKind::Static, Some(_)) => {
                return Err(ManifestError::UnexpectedStartCommand {
                    service: service.name.clone(),
                });
            }
            _ => {}
        }

        let mut keys = HashSet::new();
        for var in &service.env {
            if !keys.insert(var.key.as_str()) {
                return Err(ManifestError::DuplicateEnvKey {
                    service: service.name.clone(),
                    key: var.key.clone(),
                });
            }
            match &var.value {
                EnvValue::Literal(_) => {}
                EnvValue::Service {
                    target,
                    target_type,
                    ..
                } => {
                    let found = services.iter().find(|s| &s.name == target).ok_or_else(|| {
                        ManifestError::UnknownServiceReference {
                            service: service.name.clone(),
                            key: var.key.clone(),
                            target: target.clone(),
                        }
                    })?;
                    if let Some(expected) = target_type
                        && expected != &found.declared_type
                    {
                        return Err(ManifestError::ReferenceTypeMismatch {
                            service: service.name.clone(),
                            key: var.key.clone(),
                            target: target.clone(),
                            expected: expected.clone(),
                            actual: found.declared_type.clone(),
                        });
                    }
                }
                EnvValue::Database { name, .. } => {
                    if !databases.contains(name.as_str()) {
                        return Err(ManifestError::UnknownDatabaseReference {
                            service: service.name.clone(),
                            key: var.key.clone(),
                            target: name.clone(),
                        });
                    }
                }
            }
        }

        if service.routes.iter().filter(|r| r.is_catch_all_rewrite()).count() > 1 {
            return Err(ManifestError::MultipleCatchAllRewrites {
                service: service.name.clone(),
            });
        }
        for route in &service.routes {
            if let Some(upstream) = &route.upstream
                && (upstream == &service.name || !services.iter().any(|s| &s.name == upstream))
            {
                return Err(ManifestError::UnknownRouteUpstream {
                    service: service.name.clone(),
                    source_path: route.source.clone(),
                    upstream: upstream.clone(),
                });
            }
        }

        if let Some(filter) = &service.build_filter {
            for pattern in filter.paths.iter().chain(&filter.ignored_paths) {
                glob::Pattern::new(pattern).map_err(|source| ManifestError::InvalidGlob {
                    service: service.name.clone(),
                    pattern: pattern.clone(),
                    source,
                })?;
            }
        }

        Ok(())
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn databases(&self) -> &[Database] {
        &self.databases
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn database(&self, name: &str) -> Option<&Database> {
        self.databases.iter().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
