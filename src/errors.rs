//! Typed error hierarchy for the rollout engine.
//!
//! One enum per failure class a run can hit:
//! - `ManifestError` - invalid or cyclic manifest, fatal before any build starts
//! - `BuildError` - a service's build step failed (retried per policy)
//! - `UnresolvedReferenceError` - a dependency address never materialized
//! - `TimeoutError` - run or per-service budget exceeded
//! - `DeployError` - post-build activation failed

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that make the manifest itself unusable. A run never starts when one
/// of these is returned.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Duplicate service name: {name}")]
    DuplicateService { name: String },

    #[error("Duplicate database name: {name}")]
    DuplicateDatabase { name: String },

    #[error("Service {service} has an empty name or build command")]
    MissingField { service: String },

    #[error("Service {service} is a long-running process but has no start command")]
    MissingStartCommand { service: String },

    #[error("Service {service} is static and must not declare a start command")]
    UnexpectedStartCommand { service: String },

    #[error("Service {service} declares env var {key} more than once")]
    DuplicateEnvKey { service: String, key: String },

    #[error("Env var {key} in service {service} references unknown service {target}")]
    UnknownServiceReference {
        service: String,
        key: String,
        target: String,
    },

    #[error("Env var {key} in service {service} references unknown database {target}")]
    UnknownDatabaseReference {
        service: String,
        key: String,
        target: String,
    },

    #[error(
        "Env var {key} in service {service} expects {target} to be of type {expected}, but it is {actual}"
    )]
    ReferenceTypeMismatch {
        service: String,
        key: String,
        target: String,
        expected: String,
        actual: String,
    },

    #[error("Env var {key} in service {service} has unknown property '{property}'")]
    UnknownProperty {
        service: String,
        key: String,
        property: String,
    },

    #[error("Env var {key} in service {service} must set exactly one of value, fromService, fromDatabase")]
    AmbiguousEnvValue { service: String, key: String },

    #[error("Service {service} declares more than one catch-all rewrite route")]
    MultipleCatchAllRewrites { service: String },

    #[error("Route {source_path} in service {service} proxies to unknown service {upstream}")]
    UnknownRouteUpstream {
        service: String,
        source_path: String,
        upstream: String,
    },

    #[error("Invalid build filter glob '{pattern}' in service {service}: {source}")]
    InvalidGlob {
        service: String,
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Cycle detected in service references. Involved services: {participants:?}")]
    Cycle { participants: Vec<String> },
}

/// A failed build attempt.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Build step `{step}` exited with code {exit_code:?}")]
    NonZeroExit {
        step: String,
        exit_code: Option<i32>,
        transient: bool,
    },

    #[error("Failed to spawn build step `{step}`: {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// Whether retrying the build could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NonZeroExit { transient: true, .. })
    }
}

/// A reference whose target address never became available, or that names a
/// property the target does not expose.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Env var {key} in service {service} could not resolve {target}: {reason}")]
pub struct UnresolvedReferenceError {
    pub service: String,
    pub key: String,
    pub target: String,
    pub reason: String,
}

/// A time budget ran out.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Run exceeded its {0:?} budget")]
    Run(Duration),

    #[error("Build of {service} exceeded its {budget:?} budget")]
    Build { service: String, budget: Duration },
}

/// The post-build activation of a service failed.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Start command for {service} failed: {message}")]
    StartFailed { service: String, message: String },

    #[error("Static publish directory {path} for {service} does not exist")]
    MissingPublishDir { service: String, path: PathBuf },

    #[error("Failed to roll back {service}: {message}")]
    RollbackFailed { service: String, message: String },

    #[error("Address for {service} was already published")]
    AlreadyPublished { service: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_error_cycle_lists_participants() {
        let err = ManifestError::Cycle {
            participants: vec!["api".to_string(), "web".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Cycle"));
        assert!(msg.contains("api"));
        assert!(msg.contains("web"));
    }

    #[test]
    fn build_error_transient_flag() {
        let transient = BuildError::NonZeroExit {
            step: "npm install".into(),
            exit_code: Some(75),
            transient: true,
        };
        let permanent = BuildError::NonZeroExit {
            step: "npm run build".into(),
            exit_code: Some(1),
            transient: false,
        };
        let spawn = BuildError::Spawn {
            step: "make".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "sh not found"),
        };
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
        assert!(!spawn.is_transient());
    }

    #[test]
    fn unresolved_reference_names_target() {
        let err = UnresolvedReferenceError {
            service: "frontend".into(),
            key: "VITE_API_URL".into(),
            target: "backend".into(),
            reason: "service never went live".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("VITE_API_URL"));
        assert!(msg.contains("backend"));
    }

    #[test]
    fn timeout_variants_are_distinct() {
        let run = TimeoutError::Run(Duration::from_secs(5));
        let build = TimeoutError::Build {
            service: "api".into(),
            budget: Duration::from_secs(1),
        };
        assert_ne!(run, build);
        assert!(build.to_string().contains("api"));
    }

    #[test]
    fn deploy_error_converts_from_anyhow() {
        let err: DeployError = anyhow::anyhow!("platform unavailable").into();
        assert!(matches!(err, DeployError::Other(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ManifestError::DuplicateService { name: "x".into() });
        assert_std_error(&TimeoutError::Run(Duration::ZERO));
        assert_std_error(&DeployError::AlreadyPublished {
            service: "x".into(),
        });
    }
}
