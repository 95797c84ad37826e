//! Cooperative discrete-event kernel
//!
//! This module provides:
//! - A single-threaded executor over simulated time
//! - Task spawning with join/cancel handles and structured scopes
//! - Delay, absolute-time and interval primitives
//! - An async FIFO queue with close-terminated iteration
//! - Multi-dimensional blocking resource claims
//! - Fair-share throughput pipes with re-throttling
//!
//! Simulated time only advances when every runnable task has suspended;
//! tasks that become runnable at the same instant execute in the order
//! they were made runnable.

pub mod capacity;
pub mod executor;
pub mod pipe;
pub mod queue;

pub use capacity::{Capacities, Capacity, Claim, ResourcesUnavailable};
pub use executor::{Handle, Interval, Scope, Simulation, TaskHandle};
pub use pipe::{Pipe, PipeLoad};
pub use queue::Queue;
