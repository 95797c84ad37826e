//! ClassAd adapters for jobs and drones
//!
//! A wrapper couples an entity with its ad and surfaces the entity's live
//! quantities as ClassAd attributes, applying the HTCondor unit conventions
//! (memory in MiB/MB, disk in KiB). During a scheduling pass the `temp` map
//! overlays hypothetical post-match residuals on a drone without touching
//! real state; it is cleared before the job is handed over for execution.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::classad::{evaluate, AttributeSource, ClassAd, Value};
use crate::drone::Drone;
use crate::job::Job;

enum Entity {
    Job(Rc<Job>),
    Drone(Rc<Drone>),
}

/// A job or drone combined with its ClassAd.
pub struct WrappedAd {
    id: u64,
    ad: Rc<ClassAd>,
    entity: Entity,
    temp: RefCell<BTreeMap<String, f64>>,
}

impl WrappedAd {
    pub fn wrap_job(id: u64, ad: Rc<ClassAd>, job: Rc<Job>) -> Rc<Self> {
        Rc::new(Self {
            id,
            ad,
            entity: Entity::Job(job),
            temp: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn wrap_drone(id: u64, ad: Rc<ClassAd>, drone: Rc<Drone>) -> Rc<Self> {
        Rc::new(Self {
            id,
            ad,
            entity: Entity::Drone(drone),
            temp: RefCell::new(BTreeMap::new()),
        })
    }

    /// Identity within the scheduler's cluster bookkeeping.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ad(&self) -> &ClassAd {
        &self.ad
    }

    pub fn job(&self) -> Option<Rc<Job>> {
        match &self.entity {
            Entity::Job(job) => Some(job.clone()),
            Entity::Drone(_) => None,
        }
    }

    pub fn drone(&self) -> Option<Rc<Drone>> {
        match &self.entity {
            Entity::Drone(drone) => Some(drone.clone()),
            Entity::Job(_) => None,
        }
    }

    pub fn temp_get(&self, key: &str) -> Option<f64> {
        self.temp.borrow().get(key).copied()
    }

    pub fn temp_insert(&self, key: impl Into<String>, value: f64) {
        self.temp.borrow_mut().insert(key.into(), value);
    }

    pub fn clear_temporary_resources(&self) {
        self.temp.borrow_mut().clear();
    }

    /// Whether a wrapped drone has no schedulable core left, hypothetical
    /// residuals included.
    pub fn empty(&self) -> bool {
        match &self.entity {
            Entity::Job(_) => false,
            Entity::Drone(drone) => {
                let cores = self
                    .temp_get("cores")
                    .unwrap_or_else(|| drone.unallocated_resources().get("cores").unwrap_or(0.0));
                cores < 1.0
            }
        }
    }

    fn drone_quantity(&self, drone: &Rc<Drone>, key: &str) -> f64 {
        self.temp_get(key)
            .unwrap_or_else(|| drone.unallocated_resources().get(key).unwrap_or(0.0))
    }
}

impl AttributeSource for WrappedAd {
    fn attribute(&self, name: &str) -> Option<Value> {
        match &self.entity {
            Entity::Job(job) => match name {
                "requestcpus" => job.resources().get("cores").map(Value::Number),
                "requestmemory" => job
                    .resources()
                    .get("memory")
                    .map(|bytes| Value::Number(bytes / 1024.0 / 1024.0)),
                "requestdisk" => job
                    .resources()
                    .get("disk")
                    .map(|bytes| Value::Number(bytes / 1024.0)),
                "requestwalltime" => job.requested_walltime().map(Value::Number),
                "failed_matches" => Some(Value::Number(job.failed_matches() as f64)),
                _ => self
                    .ad
                    .get(name)
                    .map(|expr| evaluate(expr, self, None)),
            },
            Entity::Drone(drone) => match name {
                "cpus" => Some(Value::Number(self.drone_quantity(drone, "cores"))),
                "memory" => Some(Value::Number(
                    self.drone_quantity(drone, "memory") / 1000.0 / 1000.0,
                )),
                "disk" => Some(Value::Number(self.drone_quantity(drone, "disk") / 1024.0)),
                _ => self
                    .ad
                    .get(name)
                    .map(|expr| evaluate(expr, self, None)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classad::parse_classad;
    use crate::drone::tests::DummyScheduler;
    use crate::job::JobDescription;
    use crate::kernel::{Queue, Simulation};
    use crate::resources::ResourceMap;
    use crate::scheduler::JobScheduler;
    use std::rc::Weak;

    #[test]
    fn test_job_attributes_use_htcondor_units() {
        let job = Rc::new(
            Job::new(JobDescription {
                resources: ResourceMap::from([
                    ("cores", 2.0),
                    ("memory", 2048.0 * 1024.0 * 1024.0),
                    ("disk", 100.0 * 1024.0),
                    ("walltime", 60.0),
                ]),
                used_resources: ResourceMap::from([("walltime", 60.0)]),
                ..Default::default()
            })
            .unwrap(),
        );
        let ad = Rc::new(ClassAd::default());
        let wrapped = WrappedAd::wrap_job(0, ad, job);
        assert_eq!(wrapped.attribute("requestcpus"), Some(Value::Number(2.0)));
        assert_eq!(
            wrapped.attribute("requestmemory"),
            Some(Value::Number(2048.0))
        );
        assert_eq!(wrapped.attribute("requestdisk"), Some(Value::Number(100.0)));
        assert_eq!(
            wrapped.attribute("requestwalltime"),
            Some(Value::Number(60.0))
        );
    }

    #[test]
    fn test_drone_attributes_prefer_temporary_residuals() {
        let sim = Simulation::new();
        let scheduler = DummyScheduler::new();
        let weak: Weak<dyn JobScheduler> =
            Rc::downgrade(&(scheduler.clone() as Rc<dyn JobScheduler>));
        let drone = Drone::new(
            sim.handle(),
            Queue::new(),
            weak,
            ResourceMap::from([("cores", 4.0), ("memory", 8_000_000.0)]),
            0.0,
            &[],
            None,
            None,
        );
        let ad = Rc::new(parse_classad("requirements = target.requestcpus <= my.cpus").unwrap());
        let wrapped = WrappedAd::wrap_drone(0, ad, drone);
        assert_eq!(wrapped.attribute("cpus"), Some(Value::Number(4.0)));
        assert_eq!(wrapped.attribute("memory"), Some(Value::Number(8.0)));
        assert!(!wrapped.empty());
        wrapped.temp_insert("cores", 0.0);
        assert_eq!(wrapped.attribute("cpus"), Some(Value::Number(0.0)));
        assert!(wrapped.empty());
        wrapped.clear_temporary_resources();
        assert!(!wrapped.empty());
    }
}
