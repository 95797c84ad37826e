//! Built-in statistics
//!
//! Each statistic declares the sample kinds it consumes and renders them
//! into flat records. Shapes follow the established log schema: cobald-style
//! status rows for drones, pools and schedulers, per-resource usage ratios,
//! job events, queue length, storage and pipe state, hitrate draws and the
//! aggregate cost signal.

use serde_json::{Map, Value};

use super::{Sample, Statistic};

fn number(value: f64) -> Value {
    // infinities are not representable in JSON; fold them to null
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// `cobald_status` rows for drones and pools.
pub struct CobaldStatus;

impl Statistic for CobaldStatus {
    fn name(&self) -> &'static str {
        "cobald_status"
    }

    fn accepts(&self, sample: &Sample) -> bool {
        matches!(sample, Sample::Drone(_) | Sample::Pool(_) | Sample::Scheduler(_))
    }

    fn records(&self, sample: &Sample) -> Vec<Map<String, Value>> {
        let mut record = Map::new();
        match sample {
            Sample::Drone(drone) => {
                record.insert("pool_type".into(), "drone".into());
                record.insert("pool".into(), drone.name().into());
                record.insert("allocation".into(), number(drone.allocation()));
                record.insert("utilisation".into(), number(drone.utilisation()));
                record.insert("demand".into(), number(drone.demand()));
                record.insert("supply".into(), number(drone.supply()));
                record.insert("job_count".into(), Value::from(drone.jobs()));
            }
            Sample::Pool(pool) => {
                record.insert("pool_type".into(), "pool".into());
                record.insert("pool".into(), pool.name().into());
                record.insert("allocation".into(), number(pool.allocation()));
                record.insert("utilisation".into(), number(pool.utilisation()));
                record.insert("demand".into(), number(pool.demand()));
                record.insert("supply".into(), number(pool.supply()));
            }
            Sample::Scheduler(snapshot) => {
                record.insert("pool_type".into(), "obs".into());
                record.insert("pool".into(), snapshot.name.clone().into());
                record.insert("job_count".into(), Value::from(snapshot.job_count));
            }
            _ => return Vec::new(),
        }
        vec![record]
    }
}

/// `resource_status` rows: per-resource used and requested ratios.
pub struct ResourceStatus;

impl Statistic for ResourceStatus {
    fn name(&self) -> &'static str {
        "resource_status"
    }

    fn accepts(&self, sample: &Sample) -> bool {
        matches!(sample, Sample::Drone(_))
    }

    fn records(&self, sample: &Sample) -> Vec<Map<String, Value>> {
        let Sample::Drone(drone) = sample else {
            return Vec::new();
        };
        let requested_free = drone.unallocated_resources();
        let used_free = drone.available_resources();
        drone
            .pool_resources()
            .iter()
            .map(|(resource, total)| {
                let mut record = Map::new();
                record.insert("resource_type".into(), resource.into());
                record.insert("pool".into(), drone.name().into());
                record.insert(
                    "used_ratio".into(),
                    number(1.0 - used_free.get(resource).unwrap_or(0.0) / total),
                );
                record.insert(
                    "requested_ratio".into(),
                    number(1.0 - requested_free.get(resource).unwrap_or(0.0) / total),
                );
                record
            })
            .collect()
    }
}

/// `user_demand` rows: job queue length.
pub struct UserDemand;

impl Statistic for UserDemand {
    fn name(&self) -> &'static str {
        "user_demand"
    }

    fn accepts(&self, sample: &Sample) -> bool {
        matches!(sample, Sample::UserDemand(_))
    }

    fn records(&self, sample: &Sample) -> Vec<Map<String, Value>> {
        let Sample::UserDemand(length) = sample else {
            return Vec::new();
        };
        let mut record = Map::new();
        record.insert("value".into(), Value::from(*length));
        vec![record]
    }
}

/// `job_event` rows: queueing, completion and failure details.
pub struct JobEvents;

impl Statistic for JobEvents {
    fn name(&self) -> &'static str {
        "job_event"
    }

    fn accepts(&self, sample: &Sample) -> bool {
        matches!(sample, Sample::Job(_))
    }

    fn records(&self, sample: &Sample) -> Vec<Map<String, Value>> {
        let Sample::Job(job) = sample else {
            return Vec::new();
        };
        let mut record = Map::new();
        record.insert("pool_type".into(), "drone".into());
        record.insert(
            "pool".into(),
            job.drone()
                .map(|drone| drone.name().to_string())
                .unwrap_or_else(|| "None".into())
                .into(),
        );
        record.insert("job".into(), job.name().into());
        match job.successful() {
            None => {
                record.insert("queue_time".into(), number(job.queue_date()));
                record.insert("waiting_time".into(), number(job.waiting_time()));
            }
            Some(true) => {
                record.insert("wall_time".into(), number(job.walltime()));
                record.insert("success".into(), Value::from(1));
            }
            Some(false) => {
                record.insert("success".into(), Value::from(0));
                let mut exceeded = false;
                for (resource, requested) in job.resources().iter() {
                    let usage = job
                        .used_resources()
                        .get(resource)
                        .unwrap_or(requested);
                    let reference = if requested > 0.0 {
                        requested
                    } else {
                        job.drone()
                            .and_then(|drone| drone.pool_resources().get(resource))
                            .unwrap_or(f64::INFINITY)
                    };
                    let ratio = usage / reference;
                    if ratio > 1.0 {
                        record.insert(format!("exceeded_{resource}"), number(ratio));
                        exceeded = true;
                    }
                }
                if !exceeded {
                    record.insert(
                        "refused_by".into(),
                        job.drone()
                            .map(|drone| drone.name().to_string())
                            .unwrap_or_else(|| "None".into())
                            .into(),
                    );
                }
            }
        }
        vec![record]
    }
}

/// `storage_status` rows: cache occupancy.
pub struct StorageStatus;

impl Statistic for StorageStatus {
    fn name(&self) -> &'static str {
        "storage_status"
    }

    fn accepts(&self, sample: &Sample) -> bool {
        matches!(sample, Sample::Storage(_))
    }

    fn records(&self, sample: &Sample) -> Vec<Map<String, Value>> {
        let Sample::Storage(snapshot) = sample else {
            return Vec::new();
        };
        let mut record = Map::new();
        record.insert("storage".into(), snapshot.storage.clone().into());
        record.insert("usedstorage".into(), number(snapshot.used));
        record.insert("storagesize".into(), number(snapshot.size));
        record.insert("numberoffiles".into(), Value::from(snapshot.files));
        vec![record]
    }
}

/// `pipe_status` rows: load samples emitted on every throttle.
pub struct PipeStatus;

impl Statistic for PipeStatus {
    fn name(&self) -> &'static str {
        "pipe_status"
    }

    fn accepts(&self, sample: &Sample) -> bool {
        matches!(sample, Sample::PipeStatus(_))
    }

    fn records(&self, sample: &Sample) -> Vec<Map<String, Value>> {
        let Sample::PipeStatus(load) = sample else {
            return Vec::new();
        };
        let mut record = Map::new();
        record.insert(
            "pipe".into(),
            load.pipename.clone().unwrap_or_else(|| "None".into()).into(),
        );
        record.insert("throughput".into(), number(load.available_throughput));
        record.insert(
            "requested_throughput".into(),
            number(load.requested_throughput),
        );
        record.insert("throughput_scale".into(), number(load.throughput_scale));
        record.insert("no_subscribers".into(), Value::from(load.no_subscriptions));
        vec![record]
    }
}

/// `hitrate_evaluation` rows: per-job cache provisioning draws.
pub struct HitrateEvaluation;

impl Statistic for HitrateEvaluation {
    fn name(&self) -> &'static str {
        "hitrate_evaluation"
    }

    fn accepts(&self, sample: &Sample) -> bool {
        matches!(sample, Sample::Hitrate(_))
    }

    fn records(&self, sample: &Sample) -> Vec<Map<String, Value>> {
        let Sample::Hitrate(info) = sample else {
            return Vec::new();
        };
        let mut record = Map::new();
        record.insert("hitrate".into(), number(info.hitrate));
        record.insert("volume".into(), number(info.volume));
        record.insert(
            "providesfile".into(),
            Value::from(if info.provides_file { 1 } else { 0 }),
        );
        vec![record]
    }
}

/// `cost` rows: the aggregate cobald cost signal.
pub struct Cost;

impl Statistic for Cost {
    fn name(&self) -> &'static str {
        "cost"
    }

    fn accepts(&self, sample: &Sample) -> bool {
        matches!(sample, Sample::Cost(_))
    }

    fn records(&self, sample: &Sample) -> Vec<Map<String, Value>> {
        let Sample::Cost(value) = sample else {
            return Vec::new();
        };
        let mut record = Map::new();
        record.insert("value".into(), number(*value));
        vec![record]
    }
}

/// The full default statistics set, in emission order.
pub fn defaults() -> Vec<Box<dyn Statistic>> {
    vec![
        Box::new(CobaldStatus),
        Box::new(ResourceStatus),
        Box::new(UserDemand),
        Box::new(JobEvents),
        Box::new(StorageStatus),
        Box::new(PipeStatus),
        Box::new(HitrateEvaluation),
        Box::new(Cost),
    ]
}
