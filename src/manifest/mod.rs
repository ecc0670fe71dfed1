//! Manifest model and loading.
//!
//! The engine only ever sees a validated [`Manifest`]; the YAML loader is one
//! way of producing it, and tests build manifests directly from [`Service`]
//! values.

mod loader;
mod model;

pub use loader::{load_manifest, parse_manifest};
pub use model::{
    BuildFilter, Database, DatabaseProperty, EnvValue, EnvVar, Manifest, RouteKind, RouteRule,
    Service, ServiceKind, ServiceProperty,
};
