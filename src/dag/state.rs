//! Run state tracking for the deploy scheduler.
//!
//! Per-service run states, failure records and timing helpers. None of this
//! outlives a run; what survives is written to a `DeploymentStore`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// State of a single service within one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRunState {
    /// Not yet considered
    #[default]
    Pending,
    /// Waiting on a dependency, or doomed by a failed one
    Blocked,
    /// Build steps are running
    Building,
    /// Build failed after all retries
    BuildFailed,
    /// Build succeeded, deploy step running
    Deploying,
    /// Built, deployed and address published
    Live,
    /// Not deployed (or undeployed) because a prerequisite failed
    RolledBack,
    /// Unfinished when the run budget ran out
    Cancelled,
}

impl ServiceRunState {
    /// States a service can never leave within this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Live | Self::BuildFailed | Self::RolledBack | Self::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Building | Self::Deploying)
    }
}

impl fmt::Display for ServiceRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Building => "building",
            Self::BuildFailed => "build_failed",
            Self::Deploying => "deploying",
            Self::Live => "live",
            Self::RolledBack => "rolled_back",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Classification of a service failure in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Build,
    UnresolvedReference,
    Timeout,
    Deploy,
    /// Never attempted or undone because something upstream failed
    DependencyFailed,
}

/// Why a service did not go live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Service where the failure chain started; equals the failing service
    /// for direct failures.
    pub root_cause: String,
}

impl Failure {
    pub fn direct(kind: FailureKind, service: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            root_cause: service.to_string(),
        }
    }

    /// The failure a dependent inherits from this one.
    pub fn inherited(&self) -> Self {
        Self {
            kind: FailureKind::DependencyFailed,
            message: format!("dependency {} failed: {}", self.root_cause, self.message),
            root_cause: self.root_cause.clone(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind != FailureKind::DependencyFailed
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization as milliseconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_terminal() {
        assert!(!ServiceRunState::Pending.is_terminal());
        assert!(!ServiceRunState::Blocked.is_terminal());
        assert!(!ServiceRunState::Building.is_terminal());
        assert!(!ServiceRunState::Deploying.is_terminal());
        assert!(ServiceRunState::Live.is_terminal());
        assert!(ServiceRunState::BuildFailed.is_terminal());
        assert!(ServiceRunState::RolledBack.is_terminal());
        assert!(ServiceRunState::Cancelled.is_terminal());
    }

    #[test]
    fn test_run_state_serializes_snake_case() {
        let json = serde_json::to_string(&ServiceRunState::BuildFailed).unwrap();
        assert_eq!(json, "\"build_failed\"");
        assert_eq!(ServiceRunState::RolledBack.to_string(), "rolled_back");
    }

    #[test]
    fn test_inherited_failure_keeps_root_cause() {
        let root = Failure::direct(FailureKind::Build, "backend", "exit 1");
        let inherited = root.inherited();
        assert_eq!(inherited.kind, FailureKind::DependencyFailed);
        assert_eq!(inherited.root_cause, "backend");
        assert!(inherited.message.contains("backend"));
        assert!(root.is_root());
        assert!(!inherited.is_root());

        // Inheriting twice still points at the original service.
        assert_eq!(inherited.inherited().root_cause, "backend");
    }

    #[test]
    fn test_duration_serde_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_serde")]
            d: Duration,
        }
        let json = serde_json::to_string(&Wrapper {
            d: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json, r#"{"d":1500}"#);
    }
}
