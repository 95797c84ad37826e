//! Worker node ("drone") lifecycle
//!
//! A drone boots for its scheduling duration, registers with the scheduler
//! and then serves jobs from its mailbox. Admission is enforced by the two
//! capacity views: `resources` accounts what jobs requested,
//! `used_resources` what they actually consume. Jobs whose claim cannot fit
//! the drone at all are refused; claims that merely have to wait block until
//! running jobs release them.

use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::job::Job;
use crate::kernel::{Capacities, Handle, Queue, Scope};
use crate::monitor::{Sample, SampleQueue};
use crate::resources::ResourceMap;
use crate::scheduler::JobScheduler;
use crate::storage::connection::Connection;

static DRONE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A simulated worker node.
pub struct Drone {
    name: String,
    handle: Handle,
    samples: SampleQueue,
    scheduler: Weak<dyn JobScheduler>,
    connection: Option<Rc<Connection>>,
    sitename: Option<String>,
    pool_resources: ResourceMap,
    resources: Capacities,
    used_resources: Capacities,
    valid_resource_keys: Vec<String>,
    scheduling_duration: f64,
    supply: Cell<f64>,
    jobs: Cell<usize>,
    mailbox: Queue<(Rc<Job>, bool)>,
}

impl Drone {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: Handle,
        samples: SampleQueue,
        scheduler: Weak<dyn JobScheduler>,
        pool_resources: ResourceMap,
        scheduling_duration: f64,
        ignore_resources: &[String],
        sitename: Option<String>,
        connection: Option<Rc<Connection>>,
    ) -> Rc<Self> {
        let name = format!("drone-{}", DRONE_COUNTER.fetch_add(1, Ordering::Relaxed));
        let valid_resource_keys = pool_resources
            .keys()
            .filter(|key| !ignore_resources.iter().any(|ignored| ignored == key))
            .map(str::to_string)
            .collect();
        Rc::new(Self {
            name,
            resources: Capacities::new(pool_resources.as_map()),
            used_resources: Capacities::new(pool_resources.as_map()),
            pool_resources,
            valid_resource_keys,
            handle,
            samples,
            scheduler,
            connection,
            sitename,
            scheduling_duration,
            supply: Cell::new(0.0),
            jobs: Cell::new(0),
            mailbox: Queue::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn samples(&self) -> &SampleQueue {
        &self.samples
    }

    pub fn connection(&self) -> Option<Rc<Connection>> {
        self.connection.clone()
    }

    pub fn sitename(&self) -> Option<&str> {
        self.sitename.as_deref()
    }

    pub fn pool_resources(&self) -> &ResourceMap {
        &self.pool_resources
    }

    /// Free resources assuming every job used exactly what it requested.
    pub fn unallocated_resources(&self) -> ResourceMap {
        self.resources
            .levels()
            .into_iter()
            .collect()
    }

    /// Free resources based on what running jobs actually use.
    pub fn available_resources(&self) -> ResourceMap {
        self.used_resources
            .levels()
            .into_iter()
            .collect()
    }

    pub fn supply(&self) -> f64 {
        self.supply.get()
    }

    /// A drone always asks for exactly one unit of itself.
    pub fn demand(&self) -> f64 {
        1.0
    }

    /// Number of jobs currently held by this drone, queued claims included.
    pub fn jobs(&self) -> usize {
        self.jobs.get()
    }

    fn reserved_fractions(&self) -> Vec<f64> {
        self.valid_resource_keys
            .iter()
            .map(|key| {
                let total = self.resources.total(key);
                if total > 0.0 {
                    (total - self.resources.level(key)) / total
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Largest reserved fraction across the accounted resources.
    pub fn allocation(&self) -> f64 {
        self.reserved_fractions()
            .into_iter()
            .fold(0.0, f64::max)
    }

    /// Smallest reserved fraction across the accounted resources.
    pub fn utilisation(&self) -> f64 {
        self.reserved_fractions()
            .into_iter()
            .fold(f64::INFINITY, f64::min)
            .min(1.0)
            .max(0.0)
    }

    /// Boot, register, then serve the mailbox until the simulation ends.
    pub async fn run(self: Rc<Self>) {
        self.handle.delay(self.scheduling_duration).await;
        self.supply.set(1.0);
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.register_drone(self.clone());
        }
        self.samples.put(Sample::Drone(self.clone()));
        let mut scope = Scope::new(&self.handle);
        while let Some((job, kill)) = self.mailbox.get().await {
            let drone = self.clone();
            scope.spawn(async move { drone.run_job(job, kill).await });
        }
        scope.collect().await;
    }

    /// Hand a matched job to this drone. Yields once so the drone can pick
    /// the job up within the same instant.
    pub async fn schedule_job(&self, job: Rc<Job>, kill: bool) {
        self.mailbox.put((job, kill));
        self.handle.instant().await;
    }

    /// Deregister and drain; the trailing tick absorbs in-flight handoffs.
    pub async fn shutdown(self: Rc<Self>) {
        self.supply.set(0.0);
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.unregister_drone(&self);
        }
        self.samples.put(Sample::Drone(self.clone()));
        self.handle.delay(1.0).await;
    }

    async fn run_job(self: Rc<Self>, job: Rc<Job>, kill: bool) {
        self.jobs.set(self.jobs.get() + 1);
        self.execute(&job, kill).await;
        self.jobs.set(self.jobs.get() - 1);
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.job_finished(job.clone()).await;
            scheduler.update_drone(&self);
        }
        self.samples.put(Sample::Drone(self.clone()));
    }

    async fn execute(self: &Rc<Self>, job: &Rc<Job>, kill: bool) {
        let requested_claim = match self.resources.claim(job.resources().as_map()).await {
            Ok(claim) => claim,
            Err(_) => {
                self.refuse(job);
                return;
            }
        };
        let used_claim = match self
            .used_resources
            .claim(job.used_resources().as_map())
            .await
        {
            Ok(claim) => claim,
            Err(_) => {
                drop(requested_claim);
                self.refuse(job);
                return;
            }
        };
        self.samples.put(Sample::Drone(self.clone()));
        if kill && self.overuses(job) {
            self.refuse(job);
        } else {
            if let Some(scheduler) = self.scheduler.upgrade() {
                scheduler.update_drone(self);
            }
            job.clone().run(self.clone()).await;
        }
        drop(used_claim);
        drop(requested_claim);
    }

    /// Any resource where observed usage exceeds the request.
    fn overuses(&self, job: &Rc<Job>) -> bool {
        job.resources().iter().any(|(key, requested)| {
            job.used_resources()
                .get(key)
                .map(|used| used > requested)
                .unwrap_or(false)
        })
    }

    fn refuse(self: &Rc<Self>, job: &Rc<Job>) {
        job.mark_failed_on(self, self.handle.now());
        self.samples.put(Sample::Job(job.clone()));
    }
}

impl std::fmt::Debug for Drone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drone")
            .field("name", &self.name)
            .field("supply", &self.supply.get())
            .field("jobs", &self.jobs.get())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job::JobDescription;
    use crate::kernel::Simulation;
    use async_trait::async_trait;

    /// Minimal scheduler stub recording finished jobs.
    pub(crate) struct DummyScheduler {
        pub finished: Queue<Rc<Job>>,
    }

    impl DummyScheduler {
        pub fn new() -> Rc<Self> {
            Rc::new(Self {
                finished: Queue::new(),
            })
        }
    }

    #[async_trait(?Send)]
    impl JobScheduler for DummyScheduler {
        fn register_drone(&self, _drone: Rc<Drone>) {}
        fn unregister_drone(&self, _drone: &Rc<Drone>) {}
        fn update_drone(&self, _drone: &Rc<Drone>) {}
        fn drone_list(&self) -> Vec<Rc<Drone>> {
            Vec::new()
        }
        fn queued_jobs(&self) -> usize {
            0
        }
        async fn run(self: Rc<Self>) {}
        async fn job_finished(&self, job: Rc<Job>) {
            self.finished.put(job);
        }
    }

    pub(crate) fn test_job(cores: f64, memory: f64, walltime: f64) -> Rc<Job> {
        Rc::new(
            Job::new(JobDescription {
                resources: ResourceMap::from([
                    ("cores", cores),
                    ("memory", memory),
                    ("walltime", 50.0),
                ]),
                used_resources: ResourceMap::from([
                    ("cores", cores),
                    ("memory", memory),
                    ("walltime", walltime),
                ]),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn test_drone(
        handle: &Handle,
        scheduler: &Rc<DummyScheduler>,
        cores: f64,
        memory: f64,
    ) -> Rc<Drone> {
        let weak: Weak<dyn JobScheduler> =
            Rc::downgrade(&(scheduler.clone() as Rc<dyn JobScheduler>));
        Drone::new(
            handle.clone(),
            Queue::new(),
            weak,
            ResourceMap::from([("cores", cores), ("memory", memory)]),
            0.0,
            &[],
            None,
            None,
        )
    }

    #[test]
    fn test_matching_job_runs_to_completion() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let drone = test_drone(&handle, &scheduler, 1.0, 1.0);
        let job = test_job(1.0, 1.0, 10.0);
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            let job = job.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                drone.schedule_job(job, false).await;
                scheduler.finished.get().await;
                scope.collect().await;
            }
        };
        let end = sim.run(root, None);
        assert_eq!(end, 10.0);
        assert_eq!(job.successful(), Some(true));
        assert_eq!(job.waiting_time(), 0.0);
    }

    #[test]
    fn test_oversized_job_is_refused_immediately() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let drone = test_drone(&handle, &scheduler, 1.0, 1.0);
        let job = test_job(2.0, 1.0, 10.0);
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            let job = job.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                drone.schedule_job(job, false).await;
                scheduler.finished.get().await;
                scope.collect().await;
            }
        };
        let end = sim.run(root, None);
        assert_eq!(end, 0.0);
        assert_eq!(job.successful(), Some(false));
        assert_eq!(job.waiting_time(), 0.0);
    }

    #[test]
    fn test_contending_jobs_serialise() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let drone = test_drone(&handle, &scheduler, 1.0, 1.0);
        let first = test_job(1.0, 1.0, 10.0);
        let second = test_job(1.0, 1.0, 10.0);
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            let first = first.clone();
            let second = second.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                drone.schedule_job(first, false).await;
                drone.schedule_job(second, false).await;
                scheduler.finished.get().await;
                scheduler.finished.get().await;
                scope.collect().await;
            }
        };
        let end = sim.run(root, None);
        assert_eq!(end, 20.0);
        assert_eq!(first.successful(), Some(true));
        assert_eq!(second.successful(), Some(true));
        let waits = [first.waiting_time(), second.waiting_time()];
        assert!(waits.contains(&0.0) && waits.contains(&10.0));
    }

    #[test]
    fn test_parallel_jobs_share_a_large_drone() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let drone = test_drone(&handle, &scheduler, 2.0, 2.0);
        let first = test_job(1.0, 1.0, 10.0);
        let second = test_job(1.0, 1.0, 10.0);
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            let first = first.clone();
            let second = second.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                drone.schedule_job(first, false).await;
                drone.schedule_job(second, false).await;
                scheduler.finished.get().await;
                scheduler.finished.get().await;
                scope.collect().await;
            }
        };
        let end = sim.run(root, None);
        assert_eq!(end, 10.0);
        assert_eq!(first.waiting_time(), 0.0);
        assert_eq!(second.waiting_time(), 0.0);
    }

    #[test]
    fn test_kill_on_overuse() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let drone = test_drone(&handle, &scheduler, 2.0, 4.0);
        // requests memory=1 but uses memory=2
        let job = Rc::new(
            Job::new(JobDescription {
                resources: ResourceMap::from([
                    ("cores", 1.0),
                    ("memory", 1.0),
                    ("walltime", 50.0),
                ]),
                used_resources: ResourceMap::from([
                    ("cores", 1.0),
                    ("memory", 2.0),
                    ("walltime", 10.0),
                ]),
                ..Default::default()
            })
            .unwrap(),
        );
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            let job = job.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                drone.schedule_job(job, true).await;
                scheduler.finished.get().await;
                scope.collect().await;
            }
        };
        let end = sim.run(root, None);
        assert_eq!(end, 0.0);
        assert_eq!(job.successful(), Some(false));
    }

    #[test]
    fn test_overuse_tolerated_without_kill_flag() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let drone = test_drone(&handle, &scheduler, 2.0, 4.0);
        let job = Rc::new(
            Job::new(JobDescription {
                resources: ResourceMap::from([
                    ("cores", 1.0),
                    ("memory", 1.0),
                    ("walltime", 50.0),
                ]),
                used_resources: ResourceMap::from([
                    ("cores", 1.0),
                    ("memory", 2.0),
                    ("walltime", 10.0),
                ]),
                ..Default::default()
            })
            .unwrap(),
        );
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            let job = job.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                drone.schedule_job(job, false).await;
                scheduler.finished.get().await;
                scope.collect().await;
            }
        };
        let end = sim.run(root, None);
        assert_eq!(end, 10.0);
        assert_eq!(job.successful(), Some(true));
    }

    #[test]
    fn test_allocation_and_utilisation_bounds() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let drone = test_drone(&handle, &scheduler, 2.0, 4.0);
        let job = test_job(1.0, 1.0, 10.0);
        let probe = drone.clone();
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                drone.schedule_job(job, false).await;
                handle.delay(5.0).await;
                // mid-flight: one of two cores, one of four memory units
                assert_eq!(drone.allocation(), 0.5);
                assert_eq!(drone.utilisation(), 0.25);
                scheduler.finished.get().await;
                scope.collect().await;
            }
        };
        sim.run(root, None);
        assert_eq!(probe.allocation(), 0.0);
        assert_eq!(probe.jobs(), 0);
    }
}
