//! Monitoring dispatch
//!
//! Every state change of interest is pushed into a shared [`SampleQueue`].
//! The [`Monitoring`] task drains it and hands each sample to the statistics
//! whose whitelist accepts it; the records they produce are stamped with the
//! simulation time and run identifier and routed to the configured
//! [`sink::RecordSink`].

pub mod sink;
pub mod statistics;

use std::rc::Rc;

use serde_json::{Map, Value};

use crate::drone::Drone;
use crate::job::Job;
use crate::kernel::{Handle, PipeLoad, Queue};
use crate::pool::Pool;

/// Scheduler state snapshot taken when the scheduler samples itself.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub name: String,
    pub job_count: usize,
}

/// Storage state snapshot taken after cache mutations.
#[derive(Debug, Clone)]
pub struct StorageSnapshot {
    pub storage: String,
    pub used: f64,
    pub size: f64,
    pub files: usize,
}

/// Outcome of the per-job hitrate draw.
#[derive(Debug, Clone)]
pub struct HitrateInfo {
    pub hitrate: f64,
    pub volume: f64,
    pub provides_file: bool,
}

/// One observation pushed into the monitoring queue.
pub enum Sample {
    Drone(Rc<Drone>),
    Job(Rc<Job>),
    Pool(Rc<Pool>),
    Scheduler(SchedulerSnapshot),
    UserDemand(usize),
    Storage(StorageSnapshot),
    PipeStatus(PipeLoad),
    Hitrate(HitrateInfo),
    Cost(f64),
}

/// The process-wide monitoring channel, cloned into every producer.
pub type SampleQueue = Queue<Sample>;

/// A statistic turns accepted samples into log records.
pub trait Statistic {
    /// Identifier the records are logged under.
    fn name(&self) -> &'static str;

    /// Whitelist check: whether this statistic consumes the sample.
    fn accepts(&self, sample: &Sample) -> bool;

    /// Produce the records for one sample.
    fn records(&self, sample: &Sample) -> Vec<Map<String, Value>>;
}

/// Consumes the sample queue and dispatches to registered statistics.
pub struct Monitoring {
    handle: Handle,
    samples: SampleQueue,
    statistics: Vec<Box<dyn Statistic>>,
    sink: Rc<dyn sink::RecordSink>,
    run_id: String,
}

impl Monitoring {
    pub fn new(
        handle: Handle,
        samples: SampleQueue,
        sink: Rc<dyn sink::RecordSink>,
        run_id: String,
    ) -> Self {
        Self {
            handle,
            samples,
            statistics: Vec::new(),
            sink,
            run_id,
        }
    }

    /// Register a statistic; registration order is emission order.
    pub fn register_statistic(&mut self, statistic: Box<dyn Statistic>) {
        self.statistics.push(statistic);
    }

    /// Register the full default statistics set.
    pub fn register_defaults(&mut self) {
        for statistic in statistics::defaults() {
            self.register_statistic(statistic);
        }
    }

    pub async fn run(self) {
        while let Some(sample) = self.samples.get().await {
            for statistic in &self.statistics {
                if !statistic.accepts(&sample) {
                    continue;
                }
                for mut record in statistic.records(&sample) {
                    record.insert("run".into(), Value::String(self.run_id.clone()));
                    self.sink
                        .emit(statistic.name(), self.handle.now(), &record);
                }
            }
        }
    }
}
