//! Fair-share throughput pipe
//!
//! Every subscriber requests a throughput cap (defaulting to the pipe's
//! limit). Rates follow max-min fairness by water-filling: subscribers whose
//! cap sits below the current equal share keep their full cap, and the
//! leftover splits evenly among the rest. With uniform caps everyone gets
//! `throughput / n`; a subscriber is never held below its own cap while
//! unclaimed throughput remains. Whenever the subscriber set changes,
//! in-flight transfers are woken to recompute their share, and the optional
//! monitor hook observes a load sample.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::kernel::executor::Handle;

/// Load snapshot emitted on every throttle event.
#[derive(Debug, Clone)]
pub struct PipeLoad {
    pub pipename: Option<String>,
    pub requested_throughput: f64,
    pub available_throughput: f64,
    pub throughput_scale: f64,
    pub no_subscriptions: usize,
}

struct Inner {
    throughput: f64,
    subscriptions: BTreeMap<u64, f64>,
    next_id: u64,
    epoch: u64,
    waiters: Vec<Waker>,
    label: Option<String>,
    monitor: Option<Box<dyn Fn(PipeLoad)>>,
    transferred: f64,
}

impl Inner {
    /// Aggregate requested/available ratio, reported with load samples.
    fn scale(&self) -> f64 {
        let requested: f64 = self.subscriptions.values().sum();
        (requested / self.throughput).max(1.0)
    }

    /// Max-min rate of one subscriber. Walking caps in ascending order,
    /// everyone below the running equal share is granted in full; the
    /// subscriber's own turn yields `min(cap, share)`. Subscribers with
    /// equal caps resolve to equal rates regardless of walk order.
    fn rate(&self, id: u64) -> f64 {
        let Some(&own) = self.subscriptions.get(&id) else {
            return 0.0;
        };
        let mut caps: Vec<f64> = self.subscriptions.values().copied().collect();
        caps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mut remaining = self.throughput;
        let mut left = caps.len();
        for cap in caps {
            let share = remaining / left as f64;
            if cap >= own {
                return own.min(share);
            }
            remaining -= cap.min(share);
            left -= 1;
        }
        0.0
    }

    fn sample(&self) -> PipeLoad {
        PipeLoad {
            pipename: self.label.clone(),
            requested_throughput: self.subscriptions.values().sum(),
            available_throughput: self.throughput,
            throughput_scale: self.scale(),
            no_subscriptions: self.subscriptions.len(),
        }
    }

    fn throttle(&mut self) {
        self.epoch += 1;
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
        if let Some(monitor) = &self.monitor {
            monitor(self.sample());
        }
    }
}

/// Throughput-limited transfer channel shared by concurrent subscribers.
pub struct Pipe {
    handle: Handle,
    inner: Rc<RefCell<Inner>>,
}

impl Clone for Pipe {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl Pipe {
    pub fn new(handle: &Handle, throughput: f64) -> Self {
        Self {
            handle: handle.clone(),
            inner: Rc::new(RefCell::new(Inner {
                throughput,
                subscriptions: BTreeMap::new(),
                next_id: 0,
                epoch: 0,
                waiters: Vec::new(),
                label: None,
                monitor: None,
                transferred: 0.0,
            })),
        }
    }

    pub fn throughput(&self) -> f64 {
        self.inner.borrow().throughput
    }

    /// Total volume transferred through this pipe so far.
    pub fn transferred(&self) -> f64 {
        self.inner.borrow().transferred
    }

    pub fn set_label(&self, label: impl Into<String>) {
        self.inner.borrow_mut().label = Some(label.into());
    }

    pub fn label(&self) -> Option<String> {
        self.inner.borrow().label.clone()
    }

    /// Install a hook observing a [`PipeLoad`] sample on every throttle.
    pub fn set_monitor(&self, monitor: Box<dyn Fn(PipeLoad)>) {
        self.inner.borrow_mut().monitor = Some(monitor);
    }

    /// Move `total` units through the pipe, suspending for the simulated
    /// duration. `cap` bounds this subscriber's own throughput.
    pub async fn transfer(&self, total: f64, cap: Option<f64>) {
        if total <= 0.0 {
            return;
        }
        let cap = cap.unwrap_or_else(|| self.throughput());
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscriptions.insert(id, cap);
            inner.throttle();
            id
        };
        let mut remaining = total;
        let threshold = total * 1e-12 + 1e-9;
        loop {
            let (rate, epoch) = {
                let inner = self.inner.borrow();
                (inner.rate(id), inner.epoch)
            };
            let started = self.handle.now();
            let finish = started + remaining / rate;
            ThrottleWait {
                handle: self.handle.clone(),
                inner: self.inner.clone(),
                finish,
                epoch,
            }
            .await;
            let elapsed = self.handle.now() - started;
            remaining -= elapsed * rate;
            if remaining <= threshold {
                break;
            }
        }
        let mut inner = self.inner.borrow_mut();
        inner.subscriptions.remove(&id);
        inner.transferred += total;
        inner.throttle();
    }
}

/// Resolves when the transfer's projected finish time arrives or the
/// subscriber set changes, whichever happens first.
struct ThrottleWait {
    handle: Handle,
    inner: Rc<RefCell<Inner>>,
    finish: f64,
    epoch: u64,
}

impl Future for ThrottleWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        {
            let inner = self.inner.borrow();
            if inner.epoch != self.epoch {
                return Poll::Ready(());
            }
        }
        if self.handle.now() >= self.finish {
            return Poll::Ready(());
        }
        self.inner.borrow_mut().waiters.push(cx.waker().clone());
        self.handle.register_timer(self.finish, cx.waker().clone());
        Poll::Pending
    }
}
