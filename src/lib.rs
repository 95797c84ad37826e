//! # GRIDSIM - Opportunistic Batch Site Simulator
//!
//! A discrete-event simulator for opportunistic batch computing sites:
//! traced jobs arrive against elastic pools of worker drones, an
//! HTCondor-style scheduler matches them, and a cache/pipe fabric models
//! the data path. The output is a stream of timestamped monitoring records
//! used to evaluate scheduling and caching policies.
//!
//! ## Architecture
//!
//! - `kernel`: cooperative discrete-event executor and its primitives
//! - `classad`: expression parsing and three-valued evaluation
//! - `resources`: named resource vectors
//! - `job`: job records, lifecycle and trace replay
//! - `drone`: worker-node lifecycle and resource claims
//! - `pool`: static and elastic drone pools
//! - `controller`: demand controllers for elastic pools
//! - `scheduler`: greedy and matchmaking scheduling strategies
//! - `storage`: caches, pipe routing and the cache algorithm
//! - `monitor`: sample dispatch, statistics and record sinks
//! - `simulator`: orchestration of one simulation run
//! - `io`: job, pool and storage input readers

#![warn(clippy::all)]

pub mod classad;
pub mod controller;
pub mod drone;
pub mod io;
pub mod job;
pub mod kernel;
pub mod monitor;
pub mod pool;
pub mod resources;
pub mod scheduler;
pub mod simulator;
pub mod storage;

pub use job::{Job, JobDescription};
pub use resources::ResourceMap;
pub use simulator::{ControllerKind, PoolSetup, Simulator, StorageVariant};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
