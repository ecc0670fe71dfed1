//! Change filter: decides whether a changeset requires a service rebuild.
//!
//! For each changed path the include globs are tried first; a path that
//! matches an include is then tested against the ignore globs, and an ignore
//! match drops it. The service is affected if any path survives. A service
//! without a build filter is always affected.

use crate::manifest::{BuildFilter, Service};
use glob::{MatchOptions, Pattern, PatternError};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled include/ignore globs for one service.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    include: Vec<Pattern>,
    ignore: Vec<Pattern>,
}

impl ChangeFilter {
    pub fn compile(filter: &BuildFilter) -> Result<Self, PatternError> {
        let include = filter
            .paths
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let ignore = filter
            .ignored_paths
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { include, ignore })
    }

    /// Whether a single changed path survives the include and ignore tests.
    pub fn matches_path(&self, path: &str) -> bool {
        let path = normalize(path);
        // No include globs means everything is included.
        let included = self.include.is_empty()
            || self
                .include
                .iter()
                .any(|p| p.matches_with(&path, MATCH_OPTIONS));
        if !included {
            return false;
        }
        !self
            .ignore
            .iter()
            .any(|p| p.matches_with(&path, MATCH_OPTIONS))
    }

    pub fn affected_by<S: AsRef<str>>(&self, changed_paths: &[S]) -> bool {
        changed_paths.iter().any(|p| self.matches_path(p.as_ref()))
    }
}

/// Whether `service` must be rebuilt for `changed_paths`.
pub fn affected<S: AsRef<str>>(service: &Service, changed_paths: &[S]) -> bool {
    let Some(filter) = &service.build_filter else {
        return true;
    };
    match ChangeFilter::compile(filter) {
        Ok(compiled) => compiled.affected_by(changed_paths),
        // Unreachable for validated manifests; rebuilding is the safe answer.
        Err(_) => true,
    }
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.trim_start_matches("./").to_string()
}
