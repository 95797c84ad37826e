//! Bounded resource accounting
//!
//! [`Capacities`] tracks several named dimensions at once; a claim suspends
//! its task until every dimension fits simultaneously and releases on drop.
//! Waiters are served strictly first-come-first-served. [`Capacity`] is the
//! single-dimension variant used for byte accounting.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use thiserror::Error;

/// A claim exceeded the declared capacity of a dimension.
#[derive(Debug, Clone, Error)]
#[error("claim exceeds capacity of resource {resource:?}")]
pub struct ResourcesUnavailable {
    pub resource: String,
}

struct Waiter {
    id: u64,
    amounts: BTreeMap<String, f64>,
    waker: Option<Waker>,
}

struct Inner {
    capacity: BTreeMap<String, f64>,
    available: BTreeMap<String, f64>,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

impl Inner {
    fn fits(&self, amounts: &BTreeMap<String, f64>) -> bool {
        amounts
            .iter()
            .all(|(key, amount)| self.available.get(key).copied().unwrap_or(0.0) >= *amount)
    }

    fn take(&mut self, amounts: &BTreeMap<String, f64>) {
        for (key, amount) in amounts {
            if let Some(level) = self.available.get_mut(key) {
                *level -= amount;
            }
        }
    }

    fn put_back(&mut self, amounts: &BTreeMap<String, f64>) {
        for (key, amount) in amounts {
            if let Some(level) = self.available.get_mut(key) {
                *level = (*level + amount).min(self.capacity.get(key).copied().unwrap_or(0.0));
            }
        }
    }

    fn wake_head(&mut self) {
        if let Some(head) = self.waiters.front_mut() {
            if let Some(waker) = head.waker.take() {
                waker.wake();
            }
        }
    }
}

/// Multi-dimensional bounded resource with blocking claims.
pub struct Capacities {
    inner: Rc<RefCell<Inner>>,
}

impl Clone for Capacities {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Capacities {
    pub fn new(capacity: &BTreeMap<String, f64>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                capacity: capacity.clone(),
                available: capacity.clone(),
                waiters: VecDeque::new(),
                next_waiter: 0,
            })),
        }
    }

    /// Acquire `amounts` across all dimensions at once. Resolves to an error
    /// without suspending when any dimension exceeds the declared capacity;
    /// otherwise suspends until the claim fits.
    pub fn claim(&self, amounts: &BTreeMap<String, f64>) -> ClaimFuture {
        let invalid = {
            let inner = self.inner.borrow();
            amounts.iter().find_map(|(key, amount)| {
                match inner.capacity.get(key) {
                    Some(total) if *amount <= *total => None,
                    _ => Some(key.clone()),
                }
            })
        };
        ClaimFuture {
            inner: self.inner.clone(),
            amounts: amounts.clone(),
            invalid,
            waiter_id: None,
            granted: false,
        }
    }

    /// Remaining (unclaimed) level of each dimension.
    pub fn levels(&self) -> BTreeMap<String, f64> {
        self.inner.borrow().available.clone()
    }

    pub fn level(&self, key: &str) -> f64 {
        self.inner.borrow().available.get(key).copied().unwrap_or(0.0)
    }

    pub fn total(&self, key: &str) -> f64 {
        self.inner.borrow().capacity.get(key).copied().unwrap_or(0.0)
    }
}

/// Future side of [`Capacities::claim`].
pub struct ClaimFuture {
    inner: Rc<RefCell<Inner>>,
    amounts: BTreeMap<String, f64>,
    invalid: Option<String>,
    waiter_id: Option<u64>,
    granted: bool,
}

impl Future for ClaimFuture {
    type Output = Result<Claim, ResourcesUnavailable>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(resource) = self.invalid.clone() {
            return Poll::Ready(Err(ResourcesUnavailable { resource }));
        }
        let this = &mut *self;
        let mut inner = this.inner.borrow_mut();
        let id = match this.waiter_id {
            Some(id) => id,
            None => {
                let id = inner.next_waiter;
                inner.next_waiter += 1;
                inner.waiters.push_back(Waiter {
                    id,
                    amounts: this.amounts.clone(),
                    waker: None,
                });
                this.waiter_id = Some(id);
                id
            }
        };
        let at_head = inner.waiters.front().map(|w| w.id) == Some(id);
        if at_head && inner.fits(&this.amounts) {
            let amounts = this.amounts.clone();
            inner.take(&amounts);
            inner.waiters.pop_front();
            inner.wake_head();
            this.granted = true;
            drop(inner);
            return Poll::Ready(Ok(Claim {
                inner: this.inner.clone(),
                amounts,
            }));
        }
        if let Some(waiter) = inner.waiters.iter_mut().find(|w| w.id == id) {
            waiter.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Drop for ClaimFuture {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        if let Some(id) = self.waiter_id {
            let mut inner = self.inner.borrow_mut();
            inner.waiters.retain(|w| w.id != id);
            inner.wake_head();
        }
    }
}

/// Granted claim; releases its amounts when dropped.
pub struct Claim {
    inner: Rc<RefCell<Inner>>,
    amounts: BTreeMap<String, f64>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        let amounts = std::mem::take(&mut self.amounts);
        inner.put_back(&amounts);
        inner.wake_head();
    }
}

/// Single bounded counter, e.g. bytes resident in a cache.
pub struct Capacity {
    total: f64,
    used: Cell<f64>,
}

impl Capacity {
    pub fn new(total: f64) -> Self {
        Self {
            total,
            used: Cell::new(0.0),
        }
    }

    pub fn increase(&self, amount: f64) -> Result<(), ResourcesUnavailable> {
        let next = self.used.get() + amount;
        if next > self.total {
            return Err(ResourcesUnavailable {
                resource: "size".into(),
            });
        }
        self.used.set(next);
        Ok(())
    }

    pub fn decrease(&self, amount: f64) {
        self.used.set((self.used.get() - amount).max(0.0));
    }

    pub fn used(&self) -> f64 {
        self.used.get()
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn available(&self) -> f64 {
        self.total - self.used.get()
    }
}
