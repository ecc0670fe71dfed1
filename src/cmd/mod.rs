//! CLI command implementations.
//!
//! | Module   | Commands handled     |
//! |----------|----------------------|
//! | `plan`   | `Validate`, `Plan`   |
//! | `deploy` | `Deploy`             |
//! | `config` | `Config`             |

pub mod config;
pub mod deploy;
pub mod plan;

pub use config::cmd_config;
pub use deploy::{DeployOptions, cmd_deploy};
pub use plan::{cmd_plan, cmd_validate};

use anyhow::{Context, Result};
use rollout::changeset::Changeset;
use rollout::manifest::{Manifest, load_manifest};
use std::path::Path;

use super::ChangeArgs;

pub(crate) fn load_project_manifest(project_dir: &Path, manifest: &Path) -> Result<Manifest> {
    let path = project_dir.join(manifest);
    load_manifest(&path).with_context(|| format!("Invalid manifest {}", path.display()))
}

/// `None` means every service counts as affected.
pub(crate) fn changeset_from_args(
    project_dir: &Path,
    args: &ChangeArgs,
) -> Result<Option<Changeset>> {
    if !args.changed.is_empty() {
        return Ok(Some(Changeset::from_paths(args.changed.iter().cloned())));
    }
    match &args.base {
        Some(base) => Ok(Some(Changeset::from_git(
            project_dir,
            base,
            args.head.as_deref(),
        )?)),
        None => Ok(None),
    }
}
