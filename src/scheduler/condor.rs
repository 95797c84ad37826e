//! Distance-clustered greedy scheduler
//!
//! Drones live in buckets of near-identical free-resource vectors (L1
//! distance below one). Each scheduling pass walks the job queue in order
//! and costs every bucket representative: a cost at or below one starts the
//! job immediately, otherwise the cheapest feasible bucket wins. Matched
//! drones are re-bucketed under their post-match residual so later jobs in
//! the same pass see the reduced shape.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use async_trait::async_trait;

use crate::drone::Drone;
use crate::job::Job;
use crate::kernel::{Handle, Queue, Scope};
use crate::monitor::{Sample, SampleQueue, SchedulerSnapshot};
use crate::resources::ResourceMap;
use crate::scheduler::JobScheduler;

/// Ticks between scheduling passes.
const SCHEDULING_INTERVAL: f64 = 60.0;

/// Greedy cost-based scheduler in the style of the GridKa HTCondor setup.
pub struct CondorJobScheduler {
    handle: Handle,
    samples: SampleQueue,
    stream: Queue<Rc<Job>>,
    drone_cluster: RefCell<Vec<Vec<Rc<Drone>>>>,
    interval: f64,
    job_queue: RefCell<Vec<Rc<Job>>>,
    collecting: Cell<bool>,
    in_flight: Cell<usize>,
}

impl CondorJobScheduler {
    pub fn new(handle: Handle, samples: SampleQueue, stream: Queue<Rc<Job>>) -> Rc<Self> {
        Rc::new(Self {
            handle,
            samples,
            stream,
            drone_cluster: RefCell::new(Vec::new()),
            interval: SCHEDULING_INTERVAL,
            job_queue: RefCell::new(Vec::new()),
            collecting: Cell::new(true),
            in_flight: Cell::new(0),
        })
    }

    /// Place a drone into the bucket with the closest representative, or a
    /// fresh bucket when nothing lies within distance one. `resources`
    /// substitutes a synthetic residual for the drone's live availability.
    fn add_drone_with(&self, drone: Rc<Drone>, resources: Option<&ResourceMap>) {
        let own = resources
            .cloned()
            .unwrap_or_else(|| drone.unallocated_resources());
        let mut clusters = self.drone_cluster.borrow_mut();
        let mut best: Option<usize> = None;
        let mut best_distance = f64::INFINITY;
        for (index, cluster) in clusters.iter().enumerate() {
            let Some(representative) = cluster.first() else {
                continue;
            };
            let available = representative.unallocated_resources();
            let keys: BTreeSet<&str> = representative
                .pool_resources()
                .keys()
                .chain(drone.pool_resources().keys())
                .collect();
            let distance: f64 = keys
                .into_iter()
                .map(|key| {
                    (available.get(key).unwrap_or(0.0) - own.get(key).unwrap_or(0.0)).abs()
                })
                .sum();
            if distance < best_distance {
                best_distance = distance;
                best = Some(index);
            }
        }
        match best {
            Some(index) if best_distance < 1.0 => clusters[index].push(drone),
            _ => clusters.push(vec![drone]),
        }
    }

    fn remove_drone(&self, drone: &Rc<Drone>) {
        let mut clusters = self.drone_cluster.borrow_mut();
        for cluster in clusters.iter_mut() {
            cluster.retain(|member| !Rc::ptr_eq(member, drone));
        }
        clusters.retain(|cluster| !cluster.is_empty());
    }

    /// Cost a job against every bucket representative. Unsupported or
    /// oversubscribed resources rule a bucket out; a cost at or below one
    /// wins outright in bucket order.
    fn best_match(&self, job: &Rc<Job>) -> Option<Rc<Drone>> {
        let clusters = self.drone_cluster.borrow();
        let mut best: Option<(f64, Rc<Drone>)> = None;
        for cluster in clusters.iter() {
            let Some(drone) = cluster.first() else {
                continue;
            };
            let available = drone.unallocated_resources();
            let mut cost = 0.0;
            let mut feasible = true;
            for (key, requested) in job.resources().iter() {
                let have = available.get(key).unwrap_or(0.0);
                if have < requested {
                    feasible = false;
                    break;
                }
                if requested > 0.0 {
                    cost += 1.0 / (have / requested).floor();
                }
            }
            if !feasible {
                continue;
            }
            for key in drone.pool_resources().keys() {
                if !job.resources().contains(key) {
                    cost += available.get(key).unwrap_or(0.0);
                }
            }
            cost /= (job.resources().len() + drone.pool_resources().len()) as f64;
            if cost <= 1.0 {
                return Some(drone.clone());
            }
            match &best {
                Some((current, _)) if *current <= cost => {}
                _ => best = Some((cost, drone.clone())),
            }
        }
        best.map(|(_, drone)| drone)
    }

    async fn schedule_jobs(&self) {
        let jobs: Vec<Rc<Job>> = self.job_queue.borrow().clone();
        for job in jobs {
            let Some(best) = self.best_match(&job) else {
                continue;
            };
            best.schedule_job(job.clone(), false).await;
            // let the drone take its claim before costing the next job
            self.handle.instant().await;
            {
                let mut queue = self.job_queue.borrow_mut();
                if let Some(position) = queue.iter().position(|queued| Rc::ptr_eq(queued, &job)) {
                    queue.remove(position);
                }
            }
            self.samples
                .put(Sample::UserDemand(self.job_queue.borrow().len()));
            let residual = best.unallocated_resources().minus(job.resources());
            self.remove_drone(&best);
            self.add_drone_with(best, Some(&residual));
        }
    }

    async fn collect_jobs(self: Rc<Self>) {
        while let Some(job) = self.stream.get().await {
            self.job_queue.borrow_mut().push(job);
            self.in_flight.set(self.in_flight.get() + 1);
            self.samples
                .put(Sample::UserDemand(self.job_queue.borrow().len()));
        }
        self.collecting.set(false);
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let job_count = self
            .drone_cluster
            .borrow()
            .iter()
            .flatten()
            .map(|drone| drone.jobs())
            .sum();
        SchedulerSnapshot {
            name: "condor".into(),
            job_count,
        }
    }
}

#[async_trait(?Send)]
impl JobScheduler for CondorJobScheduler {
    fn register_drone(&self, drone: Rc<Drone>) {
        self.add_drone_with(drone, None);
    }

    fn unregister_drone(&self, drone: &Rc<Drone>) {
        self.remove_drone(drone);
    }

    fn update_drone(&self, drone: &Rc<Drone>) {
        self.remove_drone(drone);
        self.add_drone_with(drone.clone(), None);
    }

    fn drone_list(&self) -> Vec<Rc<Drone>> {
        self.drone_cluster.borrow().iter().flatten().cloned().collect()
    }

    fn queued_jobs(&self) -> usize {
        self.job_queue.borrow().len()
    }

    async fn run(self: Rc<Self>) {
        let mut scope = Scope::new(&self.handle);
        let collector = self.clone();
        scope.spawn(async move { collector.collect_jobs().await });
        let mut ticker = self.handle.interval(self.interval);
        loop {
            ticker.tick().await;
            // let same-instant completions settle before matching
            self.handle.instant().await;
            self.schedule_jobs().await;
            if !self.collecting.get()
                && self.job_queue.borrow().is_empty()
                && self.in_flight.get() == 0
            {
                break;
            }
            self.samples.put(Sample::Scheduler(self.snapshot()));
        }
        scope.collect().await;
    }

    async fn job_finished(&self, job: Rc<Job>) {
        self.in_flight.set(self.in_flight.get().saturating_sub(1));
        if job.successful() != Some(true) {
            log::debug!("requeueing failed job {}", job.name());
            self.stream.put(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDescription;
    use crate::kernel::Simulation;
    use crate::scheduler::JobScheduler;
    use std::rc::Weak;

    fn job(cores: f64, walltime: f64) -> Rc<Job> {
        Rc::new(
            Job::new(JobDescription {
                resources: ResourceMap::from([
                    ("cores", cores),
                    ("memory", 1.0),
                    ("walltime", walltime),
                ]),
                used_resources: ResourceMap::from([
                    ("cores", cores),
                    ("memory", 1.0),
                    ("walltime", walltime),
                ]),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn drone_for(
        sim: &Simulation,
        scheduler: &Rc<CondorJobScheduler>,
        cores: f64,
    ) -> Rc<Drone> {
        let weak: Weak<dyn JobScheduler> =
            Rc::downgrade(&(scheduler.clone() as Rc<dyn JobScheduler>));
        Drone::new(
            sim.handle(),
            scheduler.samples.clone(),
            weak,
            ResourceMap::from([("cores", cores), ("memory", 4.0)]),
            0.0,
            &[],
            None,
            None,
        )
    }

    #[test]
    fn test_two_jobs_on_one_drone_terminate_at_180() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let stream: Queue<Rc<Job>> = Queue::new();
        let scheduler = CondorJobScheduler::new(handle.clone(), Queue::new(), stream.clone());
        let drone = drone_for(&sim, &scheduler, 1.0);
        let first = job(1.0, 60.0);
        let second = job(1.0, 60.0);
        stream.put(first.clone());
        stream.put(second.clone());
        stream.close();
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                scope.spawn(scheduler.clone().run());
                scope.collect().await;
            }
        };
        let end = sim.run(root, None);
        assert_eq!(end, 180.0);
        assert_eq!(first.successful(), Some(true));
        assert_eq!(second.successful(), Some(true));
    }

    #[test]
    fn test_single_job_runs_after_first_interval() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let stream: Queue<Rc<Job>> = Queue::new();
        let scheduler = CondorJobScheduler::new(handle.clone(), Queue::new(), stream.clone());
        let drone = drone_for(&sim, &scheduler, 1.0);
        let only = job(1.0, 100.0);
        stream.put(only.clone());
        stream.close();
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                scope.spawn(scheduler.clone().run());
                scope.collect().await;
            }
        };
        let end = sim.run(root, None);
        // dispatched at t=60, runs 100 ticks, loop exits at the next tick
        assert_eq!(end, 180.0);
        assert_eq!(only.successful(), Some(true));
        assert_eq!(only.waiting_time(), 60.0);
    }

    #[test]
    fn test_unmatchable_job_stays_queued() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let stream: Queue<Rc<Job>> = Queue::new();
        let scheduler = CondorJobScheduler::new(handle.clone(), Queue::new(), stream.clone());
        let drone = drone_for(&sim, &scheduler, 1.0);
        let oversized = job(2.0, 10.0);
        stream.put(oversized.clone());
        stream.close();
        let root = {
            let handle = handle.clone();
            let scheduler = scheduler.clone();
            let drone = drone.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(drone.clone().run());
                scope.spawn_volatile(scheduler.clone().run());
                handle.delay(200.0).await;
                scope.collect().await;
            }
        };
        sim.run(root, Some(200.0));
        assert_eq!(oversized.successful(), None);
        assert_eq!(scheduler.queued_jobs(), 1);
    }

    #[test]
    fn test_drones_bucket_by_distance() {
        let sim = Simulation::new();
        let stream: Queue<Rc<Job>> = Queue::new();
        let scheduler = CondorJobScheduler::new(sim.handle(), Queue::new(), stream);
        let small_one = drone_for(&sim, &scheduler, 2.0);
        let small_two = drone_for(&sim, &scheduler, 2.0);
        let large = drone_for(&sim, &scheduler, 8.0);
        scheduler.register_drone(small_one);
        scheduler.register_drone(small_two);
        scheduler.register_drone(large);
        assert_eq!(scheduler.drone_cluster.borrow().len(), 2);
        assert_eq!(scheduler.drone_list().len(), 3);
    }
}
