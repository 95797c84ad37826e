//! Demand controllers for elastic pools
//!
//! Controllers periodically read a pool's allocation/utilisation signals and
//! steer its demand. The linear and relative-supply rules follow the cobald
//! control model; the cost controller additionally grows an integer cost
//! term while the pool stays busy.

use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;

use crate::kernel::Handle;
use crate::pool::Pool;

/// A demand regulation strategy attached to one pool.
#[async_trait(?Send)]
pub trait Controller {
    async fn run(self: Rc<Self>);
}

/// Multiplicative demand steps sized by `rate × interval`: demand shrinks
/// by that fraction while the pool runs under-utilised and grows by it while
/// the pool stays allocated. The growth branch floors at one drone so a
/// drained pool can bootstrap.
pub struct LinearController {
    handle: Handle,
    pool: Rc<Pool>,
    low_utilisation: f64,
    high_allocation: f64,
    rate: f64,
    interval: f64,
}

impl LinearController {
    pub fn new(handle: Handle, pool: Rc<Pool>) -> Rc<Self> {
        Rc::new(Self {
            handle,
            pool,
            low_utilisation: 0.5,
            high_allocation: 0.5,
            rate: 1.0,
            interval: 1.0,
        })
    }

    fn regulate(&self) {
        let step = self.rate * self.interval;
        if self.pool.utilisation() <= self.low_utilisation {
            self.pool
                .set_demand(self.pool.demand() * (1.0 - step).max(0.0));
        } else if self.pool.allocation() >= self.high_allocation {
            self.pool
                .set_demand((self.pool.demand() * (1.0 + step)).max(1.0));
        }
    }
}

#[async_trait(?Send)]
impl Controller for LinearController {
    async fn run(self: Rc<Self>) {
        loop {
            self.regulate();
            self.handle.delay(self.interval).await;
        }
    }
}

/// Scales demand relative to the current supply.
pub struct RelativeSupplyController {
    handle: Handle,
    pool: Rc<Pool>,
    low_utilisation: f64,
    high_allocation: f64,
    low_scale: f64,
    high_scale: f64,
    interval: f64,
}

impl RelativeSupplyController {
    pub fn new(handle: Handle, pool: Rc<Pool>) -> Rc<Self> {
        Rc::new(Self {
            handle,
            pool,
            low_utilisation: 0.5,
            high_allocation: 0.5,
            low_scale: 0.9,
            high_scale: 1.1,
            interval: 1.0,
        })
    }

    fn regulate(&self) {
        if self.pool.utilisation() <= self.low_utilisation {
            self.pool.set_demand(self.low_scale * self.pool.supply());
        } else if self.pool.allocation() >= self.high_allocation {
            self.pool.set_demand(self.high_scale * self.pool.supply());
        }
    }
}

#[async_trait(?Send)]
impl Controller for RelativeSupplyController {
    async fn run(self: Rc<Self>) {
        loop {
            self.regulate();
            self.handle.delay(self.interval).await;
        }
    }
}

/// Linear controller variant that bids an increasing integer cost while the
/// pool stays saturated and decays back once it drains.
pub struct CostController {
    handle: Handle,
    pool: Rc<Pool>,
    interval: f64,
    current_cost: Cell<i64>,
}

impl CostController {
    pub fn new(handle: Handle, pool: Rc<Pool>) -> Rc<Self> {
        Rc::new(Self {
            handle,
            pool,
            interval: 1.0,
            current_cost: Cell::new(1),
        })
    }

    pub fn current_cost(&self) -> i64 {
        self.current_cost.get()
    }

    fn regulate(&self) {
        let allocation: f64 = self
            .pool
            .drones()
            .iter()
            .map(|drone| drone.allocation())
            .sum();
        if self.pool.supply() - allocation <= 1.0 {
            if self.pool.utilisation() >= 0.8 {
                self.pool
                    .set_demand((allocation + self.current_cost.get() as f64).floor());
                self.current_cost.set(self.current_cost.get() + 1);
            } else {
                self.pool.set_demand(allocation);
                if self.current_cost.get() > 1 {
                    self.current_cost.set(self.current_cost.get() - 1);
                }
            }
        }
    }
}

#[async_trait(?Send)]
impl Controller for CostController {
    async fn run(self: Rc<Self>) {
        loop {
            self.regulate();
            self.handle.delay(self.interval).await;
        }
    }
}
