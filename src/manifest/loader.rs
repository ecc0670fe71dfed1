//! YAML manifest loading.
//!
//! The on-disk document uses camelCase keys (`buildCommand`, `envVars`,
//! `fromService`, ...). It is deserialized into raw structs first and then
//! converted into the validated [`Manifest`] model.

use super::model::{
    BuildFilter, Database, DatabaseProperty, EnvValue, EnvVar, Manifest, RouteKind, RouteRule,
    Service, ServiceKind, ServiceProperty,
};
use crate::errors::ManifestError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    services: Vec<RawService>,
    #[serde(default)]
    databases: Vec<RawDatabase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawService {
    #[serde(rename = "type")]
    service_type: String,
    name: String,
    #[serde(default)]
    runtime: Option<String>,
    #[serde(default)]
    build_command: Option<RawBuildCommand>,
    #[serde(default)]
    start_command: Option<String>,
    #[serde(default)]
    root_dir: Option<PathBuf>,
    #[serde(default)]
    static_publish_path: Option<PathBuf>,
    #[serde(default)]
    env_vars: Vec<RawEnvVar>,
    #[serde(default)]
    routes: Vec<RawRoute>,
    #[serde(default)]
    build_filter: Option<RawBuildFilter>,
}

/// `buildCommand` may be a single shell string or a list of steps.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBuildCommand {
    Single(String),
    Steps(Vec<String>),
}

impl RawBuildCommand {
    fn into_steps(self) -> Vec<String> {
        match self {
            RawBuildCommand::Single(cmd) if cmd.trim().is_empty() => Vec::new(),
            RawBuildCommand::Single(cmd) => vec![cmd],
            RawBuildCommand::Steps(steps) => steps
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvVar {
    key: String,
    #[serde(default)]
    value: Option<serde_yaml::Value>,
    #[serde(default)]
    from_service: Option<RawServiceRef>,
    #[serde(default)]
    from_database: Option<RawDatabaseRef>,
}

#[derive(Debug, Deserialize)]
struct RawServiceRef {
    name: String,
    #[serde(rename = "type", default)]
    service_type: Option<String>,
    property: String,
}

#[derive(Debug, Deserialize)]
struct RawDatabaseRef {
    name: String,
    property: String,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    #[serde(rename = "type")]
    kind: RouteKind,
    source: String,
    destination: String,
    #[serde(default)]
    upstream: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBuildFilter {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    ignored_paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDatabase {
    name: String,
    #[serde(default)]
    database_name: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

/// Load and validate a manifest from a YAML file.
pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_manifest(&content)
}

/// Parse and validate a manifest from a YAML string.
pub fn parse_manifest(content: &str) -> Result<Manifest, ManifestError> {
    let raw: RawManifest = serde_yaml::from_str(content)?;

    let services = raw
        .services
        .into_iter()
        .map(convert_service)
        .collect::<Result<Vec<_>, _>>()?;

    let databases = raw
        .databases
        .into_iter()
        .map(|db| Database {
            name: db.name,
            database_name: db.database_name,
            user: db.user,
        })
        .collect();

    Manifest::new(services, databases)
}

fn convert_service(raw: RawService) -> Result<Service, ManifestError> {
    let is_static =
        raw.service_type == "static" || raw.runtime.as_deref().is_some_and(|r| r == "static");
    let kind = if is_static {
        ServiceKind::Static
    } else {
        ServiceKind::Process
    };

    let mut env = Vec::with_capacity(raw.env_vars.len());
    for var in raw.env_vars {
        if let Some(converted) = convert_env_var(&raw.name, var)? {
            env.push(converted);
        }
    }

    Ok(Service {
        name: raw.name,
        kind,
        declared_type: raw.service_type,
        runtime: raw.runtime,
        build: raw
            .build_command
            .map(RawBuildCommand::into_steps)
            .unwrap_or_default(),
        start: raw.start_command.filter(|s| !s.trim().is_empty()),
        root_dir: raw.root_dir,
        static_publish_path: raw.static_publish_path,
        env,
        routes: raw
            .routes
            .into_iter()
            .map(|r| RouteRule {
                kind: r.kind,
                source: r.source,
                destination: r.destination,
                upstream: r.upstream,
            })
            .collect(),
        build_filter: raw.build_filter.map(|f| BuildFilter {
            paths: f.paths,
            ignored_paths: f.ignored_paths,
        }),
    })
}

fn convert_env_var(service: &str, raw: RawEnvVar) -> Result<Option<EnvVar>, ManifestError> {
    let value = match (raw.value, raw.from_service, raw.from_database) {
        (Some(value), None, None) => EnvValue::Literal(scalar_to_string(&value)),
        (None, Some(reference), None) => {
            let property = reference.property.parse::<ServiceProperty>().map_err(|property| {
                ManifestError::UnknownProperty {
                    service: service.to_string(),
                    key: raw.key.clone(),
                    property,
                }
            })?;
            EnvValue::Service {
                target: reference.name,
                target_type: reference.service_type,
                property,
            }
        }
        (None, None, Some(reference)) => {
            let property = reference.property.parse::<DatabaseProperty>().map_err(|property| {
                ManifestError::UnknownProperty {
                    service: service.to_string(),
                    key: raw.key.clone(),
                    property,
                }
            })?;
            EnvValue::Database {
                name: reference.name,
                property,
            }
        }
        (None, None, None) => {
            // Values set out-of-band (e.g. `sync: false` secrets) belong to the platform.
            warn!(service, key = %raw.key, "env var has no value in manifest, skipping");
            return Ok(None);
        }
        _ => {
            return Err(ManifestError::AmbiguousEnvValue {
                service: service.to_string(),
                key: raw.key,
            });
        }
    };

    Ok(Some(EnvVar {
        key: raw.key,
        value,
    }))
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}
