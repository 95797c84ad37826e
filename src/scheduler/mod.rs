//! Job scheduling strategies
//!
//! This module provides:
//! - The [`JobScheduler`] contract shared by all strategies
//! - A distance-clustered greedy scheduler (`CondorJobScheduler`)
//! - A ClassAd matchmaker (`CondorClassadJobScheduler`) over ranked
//!   (auto)clusters

pub mod classad;
pub mod condor;
pub mod ranked;
pub mod wrapped;

use std::rc::Rc;

use async_trait::async_trait;

use crate::drone::Drone;
use crate::job::Job;

pub use classad::CondorClassadJobScheduler;
pub use condor::CondorJobScheduler;
pub use ranked::{RankedAutoClusters, RankedClusters, RankedNonClusters};
pub use wrapped::WrappedAd;

/// Contract between drones, pools and a scheduling strategy.
#[async_trait(?Send)]
pub trait JobScheduler {
    /// Make a drone available for matching.
    fn register_drone(&self, drone: Rc<Drone>);

    /// Remove a drone from matching.
    fn unregister_drone(&self, drone: &Rc<Drone>);

    /// Refresh the scheduler's view of a drone's free resources.
    fn update_drone(&self, drone: &Rc<Drone>);

    /// Snapshot of every registered drone.
    fn drone_list(&self) -> Vec<Rc<Drone>>;

    /// Jobs currently queued for matching.
    fn queued_jobs(&self) -> usize;

    /// Scheduling loop; returns once the job stream is closed, the queue is
    /// empty and no matched job is still in flight.
    async fn run(self: Rc<Self>);

    /// Notification from the executing drone. Failed jobs re-enter the
    /// matching cycle according to the strategy's requeue policy.
    async fn job_finished(&self, job: Rc<Job>);
}
