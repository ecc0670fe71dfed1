//! Changesets: the set of file paths a deploy is reacting to.
//!
//! A changeset is either given explicitly or read from git as the diff
//! between two revisions (or a revision and the working tree).

use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Repository};
use std::collections::BTreeSet;
use std::path::Path;

/// Ordered, de-duplicated set of repository-relative paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    paths: Vec<String>,
}

impl Changeset {
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let paths = paths
            .into_iter()
            .map(Into::into)
            .filter(|p| seen.insert(p.clone()))
            .collect();
        Self { paths }
    }

    /// Paths changed between `base` and `head`. Without `head`, compares
    /// against the working tree including the index and untracked files.
    pub fn from_git(repo_dir: &Path, base: &str, head: Option<&str>) -> Result<Self> {
        let repo = Repository::discover(repo_dir).context("Failed to open git repository")?;
        let base_tree = repo
            .revparse_single(base)
            .and_then(|obj| obj.peel_to_tree())
            .with_context(|| format!("Failed to resolve base revision '{}'", base))?;

        let mut opts = DiffOptions::new();
        let diff = match head {
            Some(head) => {
                let head_tree = repo
                    .revparse_single(head)
                    .and_then(|obj| obj.peel_to_tree())
                    .with_context(|| format!("Failed to resolve head revision '{}'", head))?;
                repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), Some(&mut opts))?
            }
            None => {
                opts.include_untracked(true).recurse_untracked_dirs(true);
                repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?
            }
        };

        let mut paths = Vec::new();
        for delta in diff.deltas() {
            // A rename or deletion touches the old location too.
            if matches!(delta.status(), Delta::Renamed | Delta::Deleted)
                && let Some(old) = delta.old_file().path()
            {
                paths.push(old.to_string_lossy().to_string());
            }
            if let Some(new) = delta.new_file().path() {
                paths.push(new.to_string_lossy().to_string());
            }
        }

        Ok(Self::from_paths(paths))
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
