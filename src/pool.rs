//! Drone pools
//!
//! An elastic pool reconciles its drone count toward `min(demand, capacity)`
//! once per tick: missing drones are booted, surplus idle drones are shut
//! down. A static pool creates its full capacity up front and never adapts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::drone::Drone;
use crate::kernel::{Handle, Scope};

/// Boot delay for drones started by an elastic pool.
const ELASTIC_BOOT_DELAY: f64 = 10.0;

static POOL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Factory producing a drone with a given boot delay.
pub type DroneFactory = Box<dyn Fn(f64) -> Rc<Drone>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Elastic,
    Static,
}

/// A set of drones sharing one resource profile.
pub struct Pool {
    name: String,
    handle: Handle,
    kind: PoolKind,
    capacity: f64,
    level: Cell<f64>,
    demand: Cell<f64>,
    drones: RefCell<Vec<Rc<Drone>>>,
    make_drone: DroneFactory,
}

impl Pool {
    /// A pool that adapts its size to the regulated demand.
    pub fn elastic(
        handle: Handle,
        capacity: f64,
        name: Option<String>,
        make_drone: DroneFactory,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.unwrap_or_else(Self::next_name),
            handle,
            kind: PoolKind::Elastic,
            capacity,
            level: Cell::new(0.0),
            demand: Cell::new(1.0),
            drones: RefCell::new(Vec::new()),
            make_drone,
        })
    }

    /// A pool of fixed size; demand is pinned to capacity at creation.
    pub fn fixed(
        handle: Handle,
        capacity: usize,
        name: Option<String>,
        make_drone: DroneFactory,
    ) -> Rc<Self> {
        let drones: Vec<Rc<Drone>> = (0..capacity).map(|_| make_drone(0.0)).collect();
        Rc::new(Self {
            name: name.unwrap_or_else(Self::next_name),
            handle,
            kind: PoolKind::Static,
            capacity: capacity as f64,
            level: Cell::new(capacity as f64),
            demand: Cell::new(capacity as f64),
            drones: RefCell::new(drones),
            make_drone,
        })
    }

    fn next_name() -> String {
        format!("pool-{}", POOL_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn level(&self) -> f64 {
        self.level.get()
    }

    pub fn demand(&self) -> f64 {
        self.demand.get()
    }

    pub fn set_demand(&self, value: f64) {
        self.demand.set(value.max(0.0));
    }

    /// Drones currently owned by the pool.
    pub fn drones(&self) -> Vec<Rc<Drone>> {
        self.drones.borrow().clone()
    }

    /// Summed supply over all drones.
    pub fn supply(&self) -> f64 {
        self.drones.borrow().iter().map(|drone| drone.supply()).sum()
    }

    /// Mean drone allocation; an empty pool reads as fully allocated so
    /// controllers bootstrap it.
    pub fn allocation(&self) -> f64 {
        let drones = self.drones.borrow();
        if drones.is_empty() {
            return 1.0;
        }
        drones.iter().map(|drone| drone.allocation()).sum::<f64>() / drones.len() as f64
    }

    /// Mean drone utilisation; 1.0 for an empty pool, like `allocation`.
    pub fn utilisation(&self) -> f64 {
        let drones = self.drones.borrow();
        if drones.is_empty() {
            return 1.0;
        }
        drones.iter().map(|drone| drone.utilisation()).sum::<f64>() / drones.len() as f64
    }

    pub async fn run(self: Rc<Self>) {
        match self.kind {
            PoolKind::Static => self.run_static().await,
            PoolKind::Elastic => self.run_elastic().await,
        }
    }

    async fn run_static(self: &Rc<Self>) {
        let mut scope = Scope::new(&self.handle);
        for drone in self.drones.borrow().iter() {
            scope.spawn(drone.clone().run());
        }
        std::future::pending::<()>().await;
        scope.collect().await;
    }

    async fn run_elastic(self: &Rc<Self>) {
        let mut scope = Scope::new(&self.handle);
        loop {
            let target = self.demand.get().min(self.capacity);
            let mut need = target - self.level.get();
            while need > 0.0 {
                let drone = (self.make_drone)(ELASTIC_BOOT_DELAY);
                self.drones.borrow_mut().push(drone.clone());
                scope.spawn(drone.run());
                self.level.set(self.level.get() + 1.0);
                need -= 1.0;
            }
            while need < 0.0 {
                let idle = {
                    let drones = self.drones.borrow();
                    drones.iter().position(|drone| drone.jobs() == 0)
                };
                let Some(index) = idle else { break };
                let drone = self.drones.borrow_mut().remove(index);
                scope.spawn_volatile(drone.shutdown());
                self.level.set(self.level.get() - 1.0);
                need += 1.0;
            }
            self.handle.delay(1.0).await;
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("level", &self.level.get())
            .field("demand", &self.demand.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drone::tests::DummyScheduler;
    use crate::kernel::{Queue, Simulation};
    use crate::resources::ResourceMap;
    use crate::scheduler::JobScheduler;
    use std::rc::Weak;

    fn factory(handle: &Handle, scheduler: &Rc<DummyScheduler>) -> DroneFactory {
        let handle = handle.clone();
        let weak: Weak<dyn JobScheduler> =
            Rc::downgrade(&(scheduler.clone() as Rc<dyn JobScheduler>));
        Box::new(move |boot_delay| {
            Drone::new(
                handle.clone(),
                Queue::new(),
                weak.clone(),
                ResourceMap::from([("cores", 1.0), ("memory", 1.0)]),
                boot_delay,
                &[],
                None,
                None,
            )
        })
    }

    #[test]
    fn test_elastic_pool_reconciles_to_demand() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let pool = Pool::elastic(handle.clone(), 4.0, None, factory(&handle, &scheduler));
        pool.set_demand(2.0);
        let probe = pool.clone();
        let root = {
            let handle = handle.clone();
            let pool = pool.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(pool.clone().run());
                handle.delay(12.0).await;
                assert_eq!(pool.level(), 2.0);
                assert_eq!(pool.supply(), 2.0);
                pool.set_demand(0.0);
                handle.delay(3.0).await;
                scope.collect().await;
            }
        };
        sim.run(root, None);
        assert_eq!(probe.level(), 0.0);
    }

    #[test]
    fn test_demand_is_capped_by_capacity() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let pool = Pool::elastic(handle.clone(), 2.0, None, factory(&handle, &scheduler));
        pool.set_demand(10.0);
        let probe = pool.clone();
        let root = {
            let handle = handle.clone();
            let pool = pool.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(pool.clone().run());
                handle.delay(15.0).await;
                scope.collect().await;
            }
        };
        sim.run(root, None);
        assert_eq!(probe.level(), 2.0);
    }

    #[test]
    fn test_fixed_pool_boots_everything_at_once() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let pool = Pool::fixed(handle.clone(), 3, None, factory(&handle, &scheduler));
        assert_eq!(pool.demand(), 3.0);
        let probe = pool.clone();
        let root = {
            let handle = handle.clone();
            let pool = pool.clone();
            async move {
                let mut scope = Scope::new(&handle);
                scope.spawn_volatile(pool.clone().run());
                handle.delay(1.0).await;
                scope.collect().await;
            }
        };
        sim.run(root, None);
        assert_eq!(probe.supply(), 3.0);
        assert_eq!(probe.level(), 3.0);
    }

    #[test]
    fn test_negative_demand_clamps_to_zero() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let scheduler = DummyScheduler::new();
        let pool = Pool::elastic(handle.clone(), 4.0, None, factory(&handle, &scheduler));
        pool.set_demand(-3.0);
        assert_eq!(pool.demand(), 0.0);
        drop(sim);
    }
}
