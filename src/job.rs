//! Job model and queue replay
//!
//! A job carries the resources it requested and the resources it actually
//! used, as observed in the source trace. The drone enforces the requested
//! shape; the used shape drives execution time and kill decisions.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;

use crate::drone::Drone;
use crate::kernel::{Handle, Queue};
use crate::monitor::Sample;
use crate::resources::ResourceMap;

/// Job construction errors.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0:?} provides no walltime")]
    MissingWalltime(String),

    #[error("job {0:?} entered the queue at a negative time")]
    NegativeQueueTime(String),
}

/// Result type for job construction.
pub type JobResult<T> = Result<T, JobError>;

/// One input file requested by a job.
#[derive(Debug, Clone, Default)]
pub struct InputFile {
    pub filesize: Option<f64>,
    pub usedsize: Option<f64>,
    /// Per-site probability that a cache can serve this file.
    pub hitrates: BTreeMap<String, f64>,
}

impl InputFile {
    /// Bytes that actually move when this file is read.
    pub fn transfer_size(&self) -> f64 {
        self.usedsize.or(self.filesize).unwrap_or(0.0)
    }
}

/// Everything a reader knows about a job before it becomes live.
#[derive(Debug, Clone, Default)]
pub struct JobDescription {
    pub resources: ResourceMap,
    pub used_resources: ResourceMap,
    pub queue_date: f64,
    pub in_queue_since: f64,
    pub name: Option<String>,
    pub calculation_efficiency: Option<f64>,
    pub input_files: BTreeMap<String, InputFile>,
}

/// A simulated job.
pub struct Job {
    name: String,
    resources: ResourceMap,
    used_resources: ResourceMap,
    requested_walltime: Option<f64>,
    walltime: Cell<f64>,
    queue_date: f64,
    calculation_efficiency: Option<f64>,
    input_files: BTreeMap<String, InputFile>,
    in_queue_since: Cell<f64>,
    in_queue_until: Cell<f64>,
    drone: RefCell<Option<Rc<Drone>>>,
    success: Cell<Option<bool>>,
    failed_matches: Cell<u32>,
    read_from_cache: Cell<bool>,
}

static JOB_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

impl Job {
    pub fn new(description: JobDescription) -> JobResult<Self> {
        let JobDescription {
            mut resources,
            mut used_resources,
            queue_date,
            in_queue_since,
            name,
            calculation_efficiency,
            input_files,
        } = description;
        let name = name.unwrap_or_else(|| {
            let id = JOB_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            format!("job-{id}")
        });
        let used_walltime = used_resources.remove("walltime");
        let requested_walltime = resources.remove("walltime");
        let walltime = used_walltime
            .or(requested_walltime)
            .ok_or_else(|| JobError::MissingWalltime(name.clone()))?;
        if in_queue_since < 0.0 {
            return Err(JobError::NegativeQueueTime(name));
        }
        Ok(Self {
            name,
            resources,
            used_resources,
            requested_walltime,
            walltime: Cell::new(walltime),
            queue_date,
            calculation_efficiency,
            input_files,
            in_queue_since: Cell::new(in_queue_since),
            in_queue_until: Cell::new(f64::INFINITY),
            drone: RefCell::new(None),
            success: Cell::new(None),
            failed_matches: Cell::new(0),
            read_from_cache: Cell::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requested resources, without walltime.
    pub fn resources(&self) -> &ResourceMap {
        &self.resources
    }

    /// Observed resource usage, without walltime.
    pub fn used_resources(&self) -> &ResourceMap {
        &self.used_resources
    }

    pub fn requested_walltime(&self) -> Option<f64> {
        self.requested_walltime
    }

    /// Effective walltime; rewritten to the true elapsed time when an
    /// I/O-bound job completes.
    pub fn walltime(&self) -> f64 {
        self.walltime.get()
    }

    pub fn queue_date(&self) -> f64 {
        self.queue_date
    }

    pub fn input_files(&self) -> &BTreeMap<String, InputFile> {
        &self.input_files
    }

    pub fn in_queue_since(&self) -> f64 {
        self.in_queue_since.get()
    }

    pub fn in_queue_until(&self) -> f64 {
        self.in_queue_until.get()
    }

    /// Time spent queued; infinite while the job still waits.
    pub fn waiting_time(&self) -> f64 {
        self.in_queue_until.get() - self.in_queue_since.get()
    }

    pub fn successful(&self) -> Option<bool> {
        self.success.get()
    }

    pub fn failed_matches(&self) -> u32 {
        self.failed_matches.get()
    }

    pub fn record_failed_match(&self) {
        self.failed_matches.set(self.failed_matches.get() + 1);
    }

    pub fn drone(&self) -> Option<Rc<Drone>> {
        self.drone.borrow().clone()
    }

    pub fn read_from_cache(&self) -> bool {
        self.read_from_cache.get()
    }

    pub fn set_read_from_cache(&self, value: bool) {
        self.read_from_cache.set(value);
    }

    pub(crate) fn set_in_queue_since(&self, time: f64) {
        self.in_queue_since.set(time);
    }

    /// Terminal failure: cancellation, refused claim or kill.
    pub fn mark_failed(&self) {
        self.success.set(Some(false));
    }

    /// Failure attributed to `drone` at `now`; jobs refused before their
    /// body ran still get a finite waiting time.
    pub(crate) fn mark_failed_on(&self, drone: &Rc<Drone>, now: f64) {
        if self.in_queue_until.get().is_infinite() {
            self.in_queue_until.set(now);
        }
        *self.drone.borrow_mut() = Some(drone.clone());
        self.success.set(Some(false));
    }

    /// Pure compute time, scaled by the calculation efficiency when the
    /// trace recorded per-core usage.
    fn calculation_time(&self) -> f64 {
        match (self.calculation_efficiency, self.used_resources.get("cores")) {
            (Some(efficiency), Some(cores)) if efficiency > 0.0 => {
                cores / efficiency * self.walltime.get()
            }
            _ => self.walltime.get(),
        }
    }

    /// Execute on `drone`. Input-file jobs stream their files through the
    /// drone's connection concurrently with the calculation and afterwards
    /// record the true elapsed walltime.
    pub async fn run(self: Rc<Self>, drone: Rc<Drone>) {
        let handle = drone.handle();
        self.in_queue_until.set(handle.now());
        *self.drone.borrow_mut() = Some(drone.clone());
        drone.samples().put(Sample::Job(self.clone()));
        match drone.connection() {
            Some(connection) if !self.input_files.is_empty() => {
                let started = handle.now();
                let transfer = connection.transfer_files(&drone, &self);
                let calculate = handle.delay(self.calculation_time());
                futures::join!(transfer, calculate);
                self.walltime.set(handle.now() - started);
            }
            _ => handle.delay(self.walltime.get()).await,
        }
        self.success.set(Some(true));
        drone.samples().put(Sample::Job(self.clone()));
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("success", &self.success.get())
            .finish()
    }
}

/// Replay jobs against simulated time: the first job's submit time anchors
/// t=0 and each later job is released at its offset from that anchor. The
/// queue is closed when the trace ends.
pub async fn job_to_queue_scheduler(handle: Handle, jobs: Vec<Job>, queue: Queue<Rc<Job>>) {
    let mut base: Option<f64> = None;
    for job in jobs {
        let anchor = *base.get_or_insert(job.queue_date());
        let release = job.queue_date() - anchor;
        if handle.now() < release {
            handle.at(release).await;
        }
        job.set_in_queue_since(handle.now());
        queue.put(Rc::new(job));
    }
    queue.close();
}
