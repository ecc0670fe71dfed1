pub mod changeset;
pub mod config;
pub mod dag;
pub mod env;
pub mod errors;
pub mod filter;
pub mod manifest;
pub mod platform;
pub mod release;
pub mod retry;
pub mod runner;
pub mod store;

pub use dag::resolve;
pub use errors::ManifestError;
pub use manifest::{Manifest, load_manifest, parse_manifest};
pub use release::{ReleaseCoordinator, ReleaseReport};
