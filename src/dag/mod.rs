//! DAG scheduling for parallel service deploys.
//!
//! This module turns a validated manifest into a dependency graph and drives
//! a deploy run over it.
//!
//! ## Architecture
//!
//! 1. **Builder** - Constructs the service graph from env references and
//!    route upstreams, rejecting cycles
//! 2. **Scheduler** - Per-run state machine: which services are ready,
//!    blocked, failed or live
//! 3. **Executor** - Runs builds in parallel under a concurrency budget, with
//!    retries, timeouts and cancellation
//!
//! ## Example
//!
//! ```no_run
//! use rollout::dag::DagBuilder;
//! use rollout::manifest::parse_manifest;
//!
//! # fn example() -> anyhow::Result<()> {
//! let manifest = parse_manifest(&std::fs::read_to_string("render.yaml")?)?;
//! let graph = DagBuilder::new(&manifest).build()?;
//!
//! // Groups of services that can build together
//! for (i, wave) in graph.compute_waves().iter().enumerate() {
//!     println!("Wave {}: {:?}", i, wave);
//! }
//! # Ok(())
//! # }
//! ```

mod builder;
mod executor;
mod scheduler;
pub(crate) mod state;

pub use builder::{DagBuilder, EdgeKind, Link, ServiceGraph, ServiceIndex, resolve};
pub use executor::{DeployExecutor, RunEvent, RunResult};
pub use scheduler::{DeployScheduler, ServiceNode};
pub use state::{ExecutionTimer, Failure, FailureKind, RunOutcome, ServiceRunState};
