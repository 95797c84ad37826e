//! Simulation orchestration
//!
//! The simulator owns the executor, the monitoring channel, the seeded RNG
//! and every component built from the input readers. `run` wires pools,
//! controllers, monitoring, the connection and the scheduler into one root
//! scope; pools, controllers and monitoring are volatile children, so the
//! run ends when the scheduler and the job feeder are done (or at `until`).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::classad::ParseError;
use crate::controller::{Controller, CostController, LinearController, RelativeSupplyController};
use crate::drone::Drone;
use crate::io::pools::PoolConfig;
use crate::io::storage::StorageConfig;
use crate::job::{job_to_queue_scheduler, Job};
use crate::kernel::{Handle, Queue, Scope, Simulation};
use crate::monitor::sink::{LogSink, RecordSink};
use crate::monitor::{Monitoring, Sample, SampleQueue};
use crate::pool::Pool;
use crate::scheduler::classad::CondorClassadJobScheduler;
use crate::scheduler::condor::CondorJobScheduler;
use crate::scheduler::JobScheduler;
use crate::storage::element::{CacheStorage, FileBasedHitrateStorage, HitrateStorage};
use crate::storage::files::StoredFile;
use crate::storage::{Connection, StorageElement};

/// Ticks between periodic pool/cost samples.
const STATUS_INTERVAL: f64 = 60.0;

/// Configuration errors surfaced while wiring a simulation.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("a scheduler must be created before pools")]
    SchedulerMissing,

    #[error("a connection must be created before storage elements")]
    ConnectionMissing,

    #[error("static pools require a finite capacity")]
    UnboundedStaticPool,

    #[error("invalid classad expression: {0}")]
    ClassAd(#[from] ParseError),
}

/// How a pool reacts to demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSetup {
    Static,
    Elastic(ControllerKind),
}

/// Demand controller attached to an elastic pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    Linear,
    RelativeSupply,
    Cost,
}

/// Which storage model backs the caches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StorageVariant {
    /// Real residency with admission and eviction.
    Standard,
    /// Parametric split of every transfer by a fixed hitrate.
    Hitrate(f64),
    /// Per-request binary hit decision carried by the job trace.
    FileBasedHitrate,
}

/// Top-level owner of one simulation run.
pub struct Simulator {
    simulation: Simulation,
    handle: Handle,
    samples: SampleQueue,
    rng: Rc<RefCell<StdRng>>,
    run_id: String,
    job_stream: Queue<Rc<Job>>,
    jobs: RefCell<Vec<Job>>,
    pools: RefCell<Vec<Rc<Pool>>>,
    controllers: RefCell<Vec<Rc<dyn Controller>>>,
    scheduler: RefCell<Option<Rc<dyn JobScheduler>>>,
    connection: RefCell<Option<Rc<Connection>>>,
    sink: RefCell<Rc<dyn RecordSink>>,
    monitoring_enabled: Cell<bool>,
    duration: Cell<f64>,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        let simulation = Simulation::new();
        let handle = simulation.handle();
        Self {
            simulation,
            handle,
            samples: Queue::new(),
            rng: Rc::new(RefCell::new(StdRng::seed_from_u64(seed))),
            run_id: format!("gridsim-{}", chrono::Utc::now().timestamp()),
            job_stream: Queue::new(),
            jobs: RefCell::new(Vec::new()),
            pools: RefCell::new(Vec::new()),
            controllers: RefCell::new(Vec::new()),
            scheduler: RefCell::new(None),
            connection: RefCell::new(None),
            sink: RefCell::new(Rc::new(LogSink)),
            monitoring_enabled: Cell::new(false),
            duration: Cell::new(0.0),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Simulated time at which the last run ended.
    pub fn duration(&self) -> f64 {
        self.duration.get()
    }

    /// Route monitoring records somewhere other than the log facade.
    pub fn set_record_sink(&self, sink: Rc<dyn RecordSink>) {
        *self.sink.borrow_mut() = sink;
    }

    /// Queue a batch of jobs for replay against simulated time.
    pub fn create_job_generator(&self, jobs: Vec<Job>) {
        self.jobs.borrow_mut().extend(jobs);
    }

    /// Use the distance-clustered greedy scheduler.
    pub fn create_condor_scheduler(&self) {
        let scheduler = CondorJobScheduler::new(
            self.handle.clone(),
            self.samples.clone(),
            self.job_stream.clone(),
        );
        *self.scheduler.borrow_mut() = Some(scheduler);
    }

    /// Use the ClassAd matchmaker with the given expressions.
    pub fn create_classad_scheduler(
        &self,
        machine_ad: &str,
        job_ad: &str,
        pre_job_rank: &str,
        autocluster: bool,
    ) -> Result<(), SimulatorError> {
        let scheduler = CondorClassadJobScheduler::new(
            self.handle.clone(),
            self.samples.clone(),
            self.rng.clone(),
            self.job_stream.clone(),
            machine_ad,
            job_ad,
            pre_job_rank,
            autocluster,
        )?;
        *self.scheduler.borrow_mut() = Some(scheduler);
        Ok(())
    }

    /// Install a custom scheduling strategy.
    pub fn set_scheduler(&self, scheduler: Rc<dyn JobScheduler>) {
        *self.scheduler.borrow_mut() = Some(scheduler);
    }

    /// Create the connection module routing input-file transfers.
    pub fn create_connection(&self, remote_throughput: f64, caching: bool) {
        let connection = Connection::new(
            self.handle.clone(),
            self.samples.clone(),
            self.rng.clone(),
            remote_throughput,
            caching,
        );
        *self.connection.borrow_mut() = Some(connection);
    }

    /// Build storage elements of the chosen variant and register them with
    /// the connection.
    pub fn create_storage(
        &self,
        configs: Vec<StorageConfig>,
        variant: StorageVariant,
    ) -> Result<(), SimulatorError> {
        let connection = self
            .connection
            .borrow()
            .clone()
            .ok_or(SimulatorError::ConnectionMissing)?;
        for config in configs {
            let storage: Rc<dyn StorageElement> = match variant {
                StorageVariant::Standard => {
                    let preloaded = config
                        .files
                        .iter()
                        .map(|file| {
                            StoredFile::new(
                                file.filename.clone(),
                                file.filesize,
                                Some(file.storedsize),
                                file.cachedsince,
                                file.lastaccessed,
                                file.numberofaccesses,
                            )
                        })
                        .collect();
                    CacheStorage::new(
                        &self.handle,
                        self.samples.clone(),
                        config.name,
                        config.sitename,
                        config.size,
                        config.throughput,
                        preloaded,
                    )
                }
                StorageVariant::Hitrate(hitrate) => HitrateStorage::new(
                    &self.handle,
                    hitrate,
                    config.name,
                    config.sitename,
                    config.size,
                    config.throughput,
                ),
                StorageVariant::FileBasedHitrate => FileBasedHitrateStorage::new(
                    &self.handle,
                    config.name,
                    config.sitename,
                    config.size,
                    config.throughput,
                ),
            };
            connection.add_storage_element(storage);
        }
        Ok(())
    }

    /// Create pools (and controllers for elastic setups) from a pool export.
    pub fn create_pools(
        &self,
        configs: Vec<PoolConfig>,
        setup: PoolSetup,
    ) -> Result<(), SimulatorError> {
        let scheduler = self
            .scheduler
            .borrow()
            .clone()
            .ok_or(SimulatorError::SchedulerMissing)?;
        for config in configs {
            let factory = {
                let handle = self.handle.clone();
                let samples = self.samples.clone();
                let scheduler = Rc::downgrade(&scheduler);
                let connection = self.connection.borrow().clone();
                let resources = config.resources.clone();
                let sitename = config.sitename.clone();
                let ignored = vec!["disk".to_string()];
                Box::new(move |boot_delay: f64| {
                    Drone::new(
                        handle.clone(),
                        samples.clone(),
                        scheduler.clone(),
                        resources.clone(),
                        boot_delay,
                        &ignored,
                        sitename.clone(),
                        connection.clone(),
                    )
                })
            };
            let pool = match setup {
                PoolSetup::Static => {
                    if !config.capacity.is_finite() {
                        return Err(SimulatorError::UnboundedStaticPool);
                    }
                    Pool::fixed(self.handle.clone(), config.capacity as usize, None, factory)
                }
                PoolSetup::Elastic(kind) => {
                    let pool =
                        Pool::elastic(self.handle.clone(), config.capacity, None, factory);
                    let controller: Rc<dyn Controller> = match kind {
                        ControllerKind::Linear => {
                            LinearController::new(self.handle.clone(), pool.clone())
                        }
                        ControllerKind::RelativeSupply => {
                            RelativeSupplyController::new(self.handle.clone(), pool.clone())
                        }
                        ControllerKind::Cost => {
                            CostController::new(self.handle.clone(), pool.clone())
                        }
                    };
                    self.controllers.borrow_mut().push(controller);
                    pool
                }
            };
            self.pools.borrow_mut().push(pool);
        }
        Ok(())
    }

    /// Turn on the monitoring dispatcher with the default statistics.
    pub fn enable_monitoring(&self) {
        self.monitoring_enabled.set(true);
    }

    /// Execute the simulation, optionally bounded by `until`.
    pub fn run(&self, until: Option<f64>) -> f64 {
        let handle = self.handle.clone();
        let samples = self.samples.clone();
        let scheduler = self.scheduler.borrow().clone();
        let pools = self.pools.borrow().clone();
        let controllers = self.controllers.borrow().clone();
        let connection = self.connection.borrow().clone();
        let jobs = std::mem::take(&mut *self.jobs.borrow_mut());
        let stream = self.job_stream.clone();
        let monitoring = if self.monitoring_enabled.get() {
            let mut monitoring = Monitoring::new(
                handle.clone(),
                samples.clone(),
                self.sink.borrow().clone(),
                self.run_id.clone(),
            );
            monitoring.register_defaults();
            Some(monitoring)
        } else {
            None
        };
        let root = {
            let handle = handle.clone();
            async move {
                let mut scope = Scope::new(&handle);
                if let Some(monitoring) = monitoring {
                    scope.spawn_volatile(monitoring.run());
                }
                if let Some(connection) = &connection {
                    connection.enable_pipe_monitoring();
                }
                for pool in &pools {
                    scope.spawn_volatile(pool.clone().run());
                }
                for controller in controllers {
                    scope.spawn_volatile(controller.run());
                }
                {
                    let handle = handle.clone();
                    let samples = samples.clone();
                    let pools = pools.clone();
                    let scheduler = scheduler.clone();
                    scope.spawn_volatile(async move {
                        let mut ticker = handle.interval(STATUS_INTERVAL);
                        loop {
                            ticker.tick().await;
                            for pool in &pools {
                                samples.put(Sample::Pool(pool.clone()));
                            }
                            samples.put(Sample::Cost(cobald_cost(
                                &pools,
                                scheduler.as_deref(),
                            )));
                        }
                    });
                }
                if let Some(scheduler) = scheduler {
                    scope.spawn(scheduler.run());
                }
                scope.spawn(job_to_queue_scheduler(handle.clone(), jobs, stream));
                scope.collect().await;
            }
        };
        let duration = self.simulation.run(root, until);
        self.duration.set(duration);
        duration
    }
}

/// Aggregate cost signal: one unit per drone minus its mean reserved
/// fraction, plus the number of queued jobs.
fn cobald_cost(pools: &[Rc<Pool>], scheduler: Option<&dyn JobScheduler>) -> f64 {
    let mut result = scheduler.map(|s| s.queued_jobs()).unwrap_or(0) as f64;
    for pool in pools {
        for drone in pool.drones() {
            result += 1.0;
            let free = drone.unallocated_resources();
            let mut fraction_sum = 0.0;
            let mut count = 0;
            for (key, total) in drone.pool_resources().iter() {
                if total > 0.0 {
                    fraction_sum += (total - free.get(key).unwrap_or(0.0)) / total;
                    count += 1;
                }
            }
            if count > 0 {
                result -= fraction_sum / count as f64;
            }
        }
    }
    result
}
