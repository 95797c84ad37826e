//! ClassAd matchmaker
//!
//! Mimics the HTCondor negotiator: drones are presorted into ranked
//! (auto)clusters by the PreJobRank expression; every pass walks the job
//! queue in submission order, filters clusters by the job's requirements,
//! orders them by the job's rank, and picks the first drone whose own
//! requirements accept the job. Matching runs against a snapshot with
//! hypothetical residuals so real drone state stays untouched until the
//! matched jobs are dispatched.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;

use crate::classad::{
    evaluate, parse_classad, parse_expression, AttributeSource, ClassAd, ParseError,
};
use crate::drone::Drone;
use crate::job::Job;
use crate::kernel::{Handle, Queue, Scope};
use crate::monitor::{Sample, SampleQueue, SchedulerSnapshot};
use crate::scheduler::ranked::{Cluster, RankedAutoClusters, RankedClusters, RankedNonClusters};
use crate::scheduler::wrapped::WrappedAd;
use crate::scheduler::JobScheduler;

/// Default machine ad: a drone accepts jobs that fit its free cores.
pub const MACHINE_AD_DEFAULTS: &str = "requirements = target.requestcpus <= my.cpus";

/// Default job ad: a job wants enough free cores and memory.
pub const JOB_AD_DEFAULTS: &str =
    "requirements = my.requestcpus <= target.cpus && my.requestmemory <= target.memory";

/// Default PreJobRank: all drones tie.
pub const PRE_JOB_RANK_DEFAULTS: &str = "0";

/// Ticks between scheduling passes.
const SCHEDULING_INTERVAL: f64 = 60.0;

/// Quantization factors for autoclustering keys, in the units the wrapped
/// attributes report.
fn quantization_defaults() -> BTreeMap<String, f64> {
    [
        ("memory".to_string(), 128.0 * 1024.0 * 1024.0),
        ("disk".to_string(), 1024.0 * 1024.0),
        ("cores".to_string(), 1.0),
    ]
    .into_iter()
    .collect()
}

/// HTCondor-style matchmaking scheduler.
pub struct CondorClassadJobScheduler {
    handle: Handle,
    samples: SampleQueue,
    rng: Rc<RefCell<StdRng>>,
    stream: Queue<Rc<Job>>,
    drones: RefCell<Box<dyn RankedClusters>>,
    interval: f64,
    job_queue: RefCell<Vec<Rc<WrappedAd>>>,
    collecting: Cell<bool>,
    in_flight: Cell<usize>,
    wrapped_jobs: RefCell<HashMap<usize, Rc<WrappedAd>>>,
    wrapped_drones: RefCell<HashMap<usize, Rc<WrappedAd>>>,
    machine_ad: Rc<ClassAd>,
    job_ad: Rc<ClassAd>,
    next_wrapper: Cell<u64>,
}

impl CondorClassadJobScheduler {
    pub fn new(
        handle: Handle,
        samples: SampleQueue,
        rng: Rc<RefCell<StdRng>>,
        stream: Queue<Rc<Job>>,
        machine_ad: &str,
        job_ad: &str,
        pre_job_rank: &str,
        autocluster: bool,
    ) -> Result<Rc<Self>, ParseError> {
        let ranking = parse_expression(pre_job_rank)?;
        let drones: Box<dyn RankedClusters> = if autocluster {
            Box::new(RankedAutoClusters::new(quantization_defaults(), ranking))
        } else {
            Box::new(RankedNonClusters::new(quantization_defaults(), ranking))
        };
        Ok(Rc::new(Self {
            handle,
            samples,
            rng,
            stream,
            drones: RefCell::new(drones),
            interval: SCHEDULING_INTERVAL,
            job_queue: RefCell::new(Vec::new()),
            collecting: Cell::new(true),
            in_flight: Cell::new(0),
            wrapped_jobs: RefCell::new(HashMap::new()),
            wrapped_drones: RefCell::new(HashMap::new()),
            machine_ad: Rc::new(parse_classad(machine_ad)?),
            job_ad: Rc::new(parse_classad(job_ad)?),
            next_wrapper: Cell::new(0),
        }))
    }

    fn next_wrapper_id(&self) -> u64 {
        let id = self.next_wrapper.get();
        self.next_wrapper.set(id + 1);
        id
    }

    /// Find the best drone for `job` among the presorted cluster groups.
    ///
    /// 1. Drop clusters failing the job's requirements.
    /// 2. Within each PreJobRank tier, order clusters by the job's rank,
    ///    breaking ties randomly.
    /// 3. Return the first drone whose own requirements accept the job.
    fn match_job(
        &self,
        job: &Rc<WrappedAd>,
        mut groups: Vec<Vec<Cluster>>,
    ) -> Option<Rc<WrappedAd>> {
        if let Some(requirements) = job.ad().get("requirements") {
            groups = groups
                .into_iter()
                .map(|group| {
                    group
                        .into_iter()
                        .filter(|cluster| {
                            cluster
                                .first()
                                .map(|representative| {
                                    evaluate(
                                        requirements,
                                        &**job,
                                        Some(&**representative as &dyn AttributeSource),
                                    )
                                    .is_true()
                                })
                                .unwrap_or(false)
                        })
                        .collect()
                })
                .collect();
        }
        if let Some(rank) = job.ad().get("rank") {
            for group in &mut groups {
                let mut keyed: Vec<(f64, f64, Cluster)> = group
                    .drain(..)
                    .map(|cluster| {
                        let value = cluster
                            .first()
                            .map(|representative| {
                                evaluate(
                                    rank,
                                    &**job,
                                    Some(&**representative as &dyn AttributeSource),
                                )
                                .as_number()
                                .unwrap_or(0.0)
                            })
                            .unwrap_or(0.0);
                        (value, self.rng.borrow_mut().gen::<f64>(), cluster)
                    })
                    .collect();
                keyed.sort_by(|a, b| {
                    (b.0, b.1)
                        .partial_cmp(&(a.0, a.1))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                group.extend(keyed.into_iter().map(|(_, _, cluster)| cluster));
            }
        }
        for group in groups {
            for cluster in group {
                for drone in cluster {
                    match drone.ad().get("requirements") {
                        None => return Some(drone),
                        Some(requirements) => {
                            let verdict = evaluate(
                                requirements,
                                &*drone,
                                Some(&**job as &dyn AttributeSource),
                            );
                            if verdict.is_undefined() || verdict.is_true() {
                                return Some(drone);
                            }
                        }
                    }
                }
            }
        }
        None
    }

    async fn schedule_jobs(&self) {
        if self.drones.borrow().empty() {
            return;
        }
        let mut snapshot = self.drones.borrow().copy_snapshot();
        let mut matches: Vec<(usize, Rc<WrappedAd>, Rc<WrappedAd>)> = Vec::new();
        let queue: Vec<Rc<WrappedAd>> = self.job_queue.borrow().clone();
        for (index, wrapped_job) in queue.iter().enumerate() {
            let Some(wrapped_drone) = self.match_job(wrapped_job, snapshot.cluster_groups())
            else {
                if let Some(job) = wrapped_job.job() {
                    job.record_failed_match();
                }
                continue;
            };
            if let (Some(job), Some(drone)) = (wrapped_job.job(), wrapped_drone.drone()) {
                for (key, value) in job.resources().iter() {
                    let current = wrapped_drone.temp_get(key).unwrap_or_else(|| {
                        drone.unallocated_resources().get(key).unwrap_or(0.0)
                    });
                    wrapped_drone.temp_insert(key, current - value);
                }
            }
            snapshot.update(&wrapped_drone);
            matches.push((index, wrapped_job.clone(), wrapped_drone.clone()));
            if snapshot.empty() {
                break;
            }
        }
        if matches.is_empty() {
            return;
        }
        {
            let mut queue = self.job_queue.borrow_mut();
            for (index, _, _) in matches.iter().rev() {
                queue.remove(*index);
            }
        }
        for (_, wrapped_job, wrapped_drone) in &matches {
            wrapped_drone.clear_temporary_resources();
            if let (Some(job), Some(drone)) = (wrapped_job.job(), wrapped_drone.drone()) {
                drone.schedule_job(job, false).await;
                // let the drone take its claim before the next dispatch
                self.handle.instant().await;
            }
        }
        self.samples.put(Sample::Scheduler(self.snapshot()));
        self.samples
            .put(Sample::UserDemand(self.job_queue.borrow().len()));
    }

    async fn collect_jobs(self: Rc<Self>) {
        while let Some(job) = self.stream.get().await {
            let wrapper =
                WrappedAd::wrap_job(self.next_wrapper_id(), self.job_ad.clone(), job.clone());
            self.wrapped_jobs
                .borrow_mut()
                .insert(Rc::as_ptr(&job) as usize, wrapper.clone());
            self.job_queue.borrow_mut().push(wrapper);
            self.in_flight.set(self.in_flight.get() + 1);
            self.samples
                .put(Sample::UserDemand(self.job_queue.borrow().len()));
        }
        self.collecting.set(false);
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let job_count = self
            .drone_list()
            .iter()
            .map(|drone| drone.jobs())
            .sum();
        SchedulerSnapshot {
            name: "condor-classad".into(),
            job_count,
        }
    }
}

#[async_trait(?Send)]
impl JobScheduler for CondorClassadJobScheduler {
    fn register_drone(&self, drone: Rc<Drone>) {
        let wrapper = WrappedAd::wrap_drone(
            self.next_wrapper_id(),
            self.machine_ad.clone(),
            drone.clone(),
        );
        self.wrapped_drones
            .borrow_mut()
            .insert(Rc::as_ptr(&drone) as usize, wrapper.clone());
        self.drones.borrow_mut().add(wrapper);
    }

    fn unregister_drone(&self, drone: &Rc<Drone>) {
        let wrapper = self
            .wrapped_drones
            .borrow_mut()
            .remove(&(Rc::as_ptr(drone) as usize));
        if let Some(wrapper) = wrapper {
            self.drones.borrow_mut().remove(&wrapper);
        }
    }

    fn update_drone(&self, drone: &Rc<Drone>) {
        let wrapper = self
            .wrapped_drones
            .borrow()
            .get(&(Rc::as_ptr(drone) as usize))
            .cloned();
        if let Some(wrapper) = wrapper {
            self.drones.borrow_mut().update(&wrapper);
        }
    }

    fn drone_list(&self) -> Vec<Rc<Drone>> {
        self.drones
            .borrow()
            .clusters()
            .into_iter()
            .flatten()
            .filter_map(|wrapper| wrapper.drone())
            .collect()
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
        }
        scope.collect().await;
    }

    async fn job_finished(&self, job: Rc<Job>) {
        if job.successful() == Some(true) {
            self.in_flight.set(self.in_flight.get().saturating_sub(1));
            self.wrapped_jobs
                .borrow_mut()
                .remove(&(Rc::as_ptr(&job) as usize));
        } else {
            let wrapper = self
                .wrapped_jobs
                .borrow()
                .get(&(Rc::as_ptr(&job) as usize))
                .cloned();
            if let Some(wrapper) = wrapper {
                self.job_queue.borrow_mut().push(wrapper);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDescription;
    use crate::kernel::Simulation;
    use crate::resources::ResourceMap;
    use rand::SeedableRng;
    use std::rc::Weak;

    fn test_rng() -> Rc<RefCell<StdRng>> {
        Rc::new(RefCell::new(StdRng::seed_from_u64(1234)))
    }

    fn scheduler_with_defaults(
        sim: &Simulation,
        stream: &Queue<Rc<Job>>,
    ) -> Rc<CondorClassadJobScheduler> {
        CondorClassadJobScheduler::new(
            sim.handle(),
            Queue::new(),
            test_rng(),
            stream.clone(),
            MACHINE_AD_DEFAULTS,
            JOB_AD_DEFAULTS,
            PRE_JOB_RANK_DEFAULTS,
            false,
        )
        .unwrap()
    }

    fn job(cores: f64, memory_mib: f64, walltime: f64) -> Rc<Job> {
        Rc::new(
            Job::new(JobDescription {
                resources: ResourceMap::from([
                    ("cores", cores),
                    ("memory", memory_mib * 1024.0 * 1024.0),
                    ("walltime", walltime),
                ]),
                used_resources: ResourceMap::from([
                    ("cores", cores),
                    ("memory", memory_mib * 1024.0 * 1024.0),
                    ("walltime", walltime),
                ]),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn drone_for(
        sim: &Simulation,
        scheduler: &Rc<CondorClassadJobScheduler>,
        cores: f64,
        memory_mb: f64,
    ) -> Rc<Drone> {
        let weak: Weak<dyn JobScheduler> =
            Rc::downgrade(&(scheduler.clone() as Rc<dyn JobScheduler>));
        Drone::new(
            sim.handle(),
            scheduler.samples.clone(),
            weak,
            ResourceMap::from([
                ("cores", cores),
                ("memory", memory_mb * 1000.0 * 1000.0),
            ]),
            0.0,
            &[],
            None,
            None,
        )
    }

    #[test]
    fn test_matchmaker_runs_both_jobs_to_completion() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let stream: Queue<Rc<Job>> = Queue::new();
        let scheduler = scheduler_with_defaults(&sim, &stream);
        let drone = drone_for(&sim, &scheduler, 1.0, 8000.0);
        let first = job(1.0, 100.0, 60.0);
        let second = job(1.0, 100.0, 60.0);
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
    fn test_unmatchable_job_counts_failed_matches() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let stream: Queue<Rc<Job>> = Queue::new();
        let scheduler = scheduler_with_defaults(&sim, &stream);
        let drone = drone_for(&sim, &scheduler, 1.0, 8000.0);
        let oversized = job(2.0, 100.0, 10.0);
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
                handle.delay(150.0).await;
                scope.collect().await;
            }
        };
        sim.run(root, Some(150.0));
        assert_eq!(oversized.successful(), None);
        assert!(oversized.failed_matches() >= 1);
        assert_eq!(scheduler.queued_jobs(), 1);
    }

    #[test]
    fn test_matches_respect_machine_requirements() {
        let sim = Simulation::new();
        let stream: Queue<Rc<Job>> = Queue::new();
        let scheduler = scheduler_with_defaults(&sim, &stream);
        let small = drone_for(&sim, &scheduler, 1.0, 8000.0);
        let large = drone_for(&sim, &scheduler, 4.0, 8000.0);
        scheduler.register_drone(small);
        scheduler.register_drone(large.clone());
        let wide = job(4.0, 100.0, 10.0);
        let wrapper = WrappedAd::wrap_job(99, scheduler.job_ad.clone(), wide);
        let groups = scheduler.drones.borrow().cluster_groups();
        let matched = scheduler.match_job(&wrapper, groups).unwrap();
        assert!(Rc::ptr_eq(&matched.drone().unwrap(), &large));
    }

    #[test]
    fn test_prejobrank_orders_drones() {
        let sim = Simulation::new();
        let stream: Queue<Rc<Job>> = Queue::new();
        let scheduler = CondorClassadJobScheduler::new(
            sim.handle(),
            Queue::new(),
            test_rng(),
            stream,
            MACHINE_AD_DEFAULTS,
            JOB_AD_DEFAULTS,
            "my.cpus",
            false,
        )
        .unwrap();
        let small = drone_for(&sim, &scheduler, 1.0, 8000.0);
        let large = drone_for(&sim, &scheduler, 4.0, 8000.0);
        scheduler.register_drone(small);
        scheduler.register_drone(large.clone());
        let narrow = job(1.0, 100.0, 10.0);
        let wrapper = WrappedAd::wrap_job(99, scheduler.job_ad.clone(), narrow);
        let groups = scheduler.drones.borrow().cluster_groups();
        // both drones fit, but the higher prejobrank drone must win
        let matched = scheduler.match_job(&wrapper, groups).unwrap();
        assert!(Rc::ptr_eq(&matched.drone().unwrap(), &large));
    }

    #[test]
    fn test_hypothetical_residuals_do_not_leak() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let stream: Queue<Rc<Job>> = Queue::new();
        let scheduler = scheduler_with_defaults(&sim, &stream);
        let drone = drone_for(&sim, &scheduler, 2.0, 8000.0);
        let first = job(1.0, 100.0, 10.0);
        let second = job(1.0, 100.0, 10.0);
        stream.put(first);
        stream.put(second);
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
        sim.run(root, None);
        // both matched in one pass; temp residuals were cleared before
        // execution, so the wrapper reports live availability again
        let wrapper = scheduler
            .wrapped_drones
            .borrow()
            .values()
            .next()
            .cloned()
            .unwrap();
        assert_eq!(wrapper.temp_get("cores"), None);
        assert!(!wrapper.empty());
    }
}
