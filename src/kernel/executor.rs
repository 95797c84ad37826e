//! Single-threaded executor driving tasks over a simulated clock
//!
//! The executor keeps a ready queue of runnable tasks and a heap of timers
//! keyed by simulated time. It drains every runnable task, then jumps the
//! clock to the earliest pending timer and wakes everything due at that
//! instant. Timers due at the same instant fire in registration order.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::future::{FutureExt, LocalBoxFuture};
use ordered_float::OrderedFloat;
use parking_lot::Mutex;

type ReadyQueue = Mutex<VecDeque<u64>>;

struct TimerEntry {
    at: OrderedFloat<f64>,
    seq: u64,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // inverted so the BinaryHeap pops the earliest (time, seq) first
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

struct Core {
    now: f64,
    next_task: u64,
    next_seq: u64,
    tasks: HashMap<u64, Option<LocalBoxFuture<'static, ()>>>,
    timers: BinaryHeap<TimerEntry>,
}

impl Core {
    fn register_timer(&mut self, at: f64, waker: Waker) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(TimerEntry {
            at: OrderedFloat(at),
            seq,
            waker,
        });
    }
}

struct TaskWaker {
    id: u64,
    ready: Arc<ReadyQueue>,
}

impl std::task::Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.lock().push_back(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.lock().push_back(self.id);
    }
}

/// The simulation executor. Owns every task and the simulated clock.
pub struct Simulation {
    core: Rc<RefCell<Core>>,
    ready: Arc<ReadyQueue>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            core: Rc::new(RefCell::new(Core {
                now: 0.0,
                next_task: 0,
                next_seq: 0,
                tasks: HashMap::new(),
                timers: BinaryHeap::new(),
            })),
            ready: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// A cloneable handle for use inside tasks.
    pub fn handle(&self) -> Handle {
        Handle {
            core: self.core.clone(),
            ready: self.ready.clone(),
        }
    }

    /// Drive `root` (and everything it spawns) to completion, or up to
    /// `until` if given. Returns the simulated time at which the run ended.
    pub fn run<F>(&self, root: F, until: Option<f64>) -> f64
    where
        F: Future<Output = ()> + 'static,
    {
        self.handle().spawn(root);
        loop {
            self.drain_ready();
            let next = match self.core.borrow().timers.peek() {
                Some(entry) => entry.at.0,
                None => break,
            };
            if let Some(end) = until {
                if next > end {
                    self.core.borrow_mut().now = end;
                    break;
                }
            }
            let due = {
                let mut core = self.core.borrow_mut();
                core.now = next;
                let mut due = Vec::new();
                while core
                    .timers
                    .peek()
                    .map(|entry| entry.at.0 <= next)
                    .unwrap_or(false)
                {
                    if let Some(entry) = core.timers.pop() {
                        due.push(entry.waker);
                    }
                }
                due
            };
            for waker in due {
                waker.wake();
            }
        }
        // drop leftover tasks outside the core borrow so nested cancels are safe
        let leftovers: Vec<_> = {
            let mut core = self.core.borrow_mut();
            core.timers.clear();
            core.tasks.drain().collect()
        };
        drop(leftovers);
        let now = self.core.borrow().now;
        now
    }

    fn drain_ready(&self) {
        loop {
            let id = { self.ready.lock().pop_front() };
            let Some(id) = id else { break };
            let fut = {
                let mut core = self.core.borrow_mut();
                match core.tasks.get_mut(&id) {
                    Some(slot) => slot.take(),
                    None => None,
                }
            };
            let Some(mut fut) = fut else { continue };
            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                ready: self.ready.clone(),
            }));
            let mut cx = Context::from_waker(&waker);
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    self.core.borrow_mut().tasks.remove(&id);
                }
                Poll::Pending => {
                    let mut core = self.core.borrow_mut();
                    if let Some(slot) = core.tasks.get_mut(&id) {
                        *slot = Some(fut);
                    } else {
                        // cancelled while being polled
                        drop(core);
                        drop(fut);
                    }
                }
            }
        }
    }
}

/// Cheap handle to the executor, cloned into every component.
#[derive(Clone)]
pub struct Handle {
    core: Rc<RefCell<Core>>,
    ready: Arc<ReadyQueue>,
}

impl Handle {
    /// Current simulated time.
    pub fn now(&self) -> f64 {
        self.core.borrow().now
    }

    /// Suspend for `duration` ticks.
    pub fn delay(&self, duration: f64) -> Delay {
        let at = self.now() + duration.max(0.0);
        Delay {
            core: self.core.clone(),
            at,
        }
    }

    /// Suspend until the absolute simulated time `at`. Completes without
    /// suspension when `at` is not in the future.
    pub fn at(&self, at: f64) -> Delay {
        Delay {
            core: self.core.clone(),
            at,
        }
    }

    /// Yield once so that other tasks runnable at this instant get a turn.
    pub fn instant(&self) -> Instant {
        Instant { fired: false }
    }

    /// A restartable tick source firing every `period` ticks.
    pub fn interval(&self, period: f64) -> Interval {
        Interval {
            handle: self.clone(),
            period,
            next: self.now() + period,
        }
    }

    /// Register a wakeup at absolute time `at` (used by kernel primitives).
    pub(crate) fn register_timer(&self, at: f64, waker: Waker) {
        self.core.borrow_mut().register_timer(at, waker);
    }

    /// Spawn a task and return a handle to join or cancel it.
    pub fn spawn<F, T>(&self, fut: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let state = Rc::new(RefCell::new(JoinState {
            result: None,
            finished: false,
            cancelled: false,
            wakers: Vec::new(),
        }));
        let shared = state.clone();
        let wrapped = async move {
            let out = fut.await;
            let mut st = shared.borrow_mut();
            st.result = Some(out);
            st.finished = true;
            for waker in st.wakers.drain(..) {
                waker.wake();
            }
        };
        let id = {
            let mut core = self.core.borrow_mut();
            let id = core.next_task;
            core.next_task += 1;
            core.tasks.insert(id, Some(wrapped.boxed_local()));
            id
        };
        self.ready.lock().push_back(id);
        TaskHandle {
            id,
            core: self.core.clone(),
            state,
        }
    }
}

struct JoinState<T> {
    result: Option<T>,
    finished: bool,
    cancelled: bool,
    wakers: Vec<Waker>,
}

/// Handle to a spawned task.
pub struct TaskHandle<T> {
    id: u64,
    core: Rc<RefCell<Core>>,
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            core: self.core.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T> TaskHandle<T> {
    /// Whether the task has run to completion.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Drop the task. Joiners observe `None`.
    pub fn cancel(&self) {
        let fut = { self.core.borrow_mut().tasks.remove(&self.id) };
        {
            let mut st = self.state.borrow_mut();
            if !st.finished {
                st.cancelled = true;
                for waker in st.wakers.drain(..) {
                    waker.wake();
                }
            }
        }
        // dropping the future may cascade into nested cancels
        drop(fut);
    }

    /// Wait for the task; `None` if it was cancelled.
    pub async fn join(self) -> Option<T> {
        std::future::poll_fn(move |cx| {
            let mut st = self.state.borrow_mut();
            if st.finished {
                Poll::Ready(st.result.take())
            } else if st.cancelled {
                Poll::Ready(None)
            } else {
                st.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }
}

/// Future resolving once the clock reaches a fixed instant.
pub struct Delay {
    core: Rc<RefCell<Core>>,
    at: f64,
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let now = self.core.borrow().now;
        if now >= self.at {
            Poll::Ready(())
        } else {
            self.core
                .borrow_mut()
                .register_timer(self.at, cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Future that yields exactly once, enabling same-instant handoff.
pub struct Instant {
    fired: bool,
}

impl Future for Instant {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.fired {
            Poll::Ready(())
        } else {
            self.fired = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Periodic tick source; the first tick fires one period after creation.
pub struct Interval {
    handle: Handle,
    period: f64,
    next: f64,
}

impl Interval {
    /// Wait for the next tick; returns the tick's nominal time.
    pub async fn tick(&mut self) -> f64 {
        let due = self.next;
        self.handle.at(due).await;
        self.next = due + self.period;
        due
    }
}

/// Structured concurrency: children spawned into a scope are joined by
/// [`Scope::collect`]; volatile children are cancelled instead. Dropping a
/// scope cancels everything still running.
pub struct Scope {
    handle: Handle,
    children: Vec<(TaskHandle<()>, bool)>,
}

impl Scope {
    pub fn new(handle: &Handle) -> Self {
        Self {
            handle: handle.clone(),
            children: Vec::new(),
        }
    }

    /// Spawn a child that `collect` will wait for.
    pub fn spawn<F>(&mut self, fut: F) -> TaskHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task = self.handle.spawn(fut);
        self.children.push((task.clone(), false));
        task
    }

    /// Spawn a child that `collect` will cancel instead of waiting for.
    pub fn spawn_volatile<F>(&mut self, fut: F) -> TaskHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task = self.handle.spawn(fut);
        self.children.push((task.clone(), true));
        task
    }

    /// Join every persistent child in spawn order, then cancel volatiles.
    pub async fn collect(mut self) {
        let children = std::mem::take(&mut self.children);
        let mut volatiles = Vec::new();
        for (task, volatile) in children {
            if volatile {
                volatiles.push(task);
            } else {
                task.join().await;
            }
        }
        for task in volatiles {
            task.cancel();
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        for (task, _) in self.children.drain(..) {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_delay_advances_clock() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let end = sim.run(
            async move {
                handle.delay(20.0).await;
            },
            None,
        );
        assert_eq!(end, 20.0);
    }

    #[test]
    fn test_same_time_insertion_order() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let order = Rc::new(RefCell::new(Vec::new()));
        let root = {
            let handle = handle.clone();
            let order = order.clone();
            async move {
                let mut scope = Scope::new(&handle);
                for tag in 0..3 {
                    let handle = handle.clone();
                    let order = order.clone();
                    scope.spawn(async move {
                        handle.delay(5.0).await;
                        order.borrow_mut().push(tag);
                    });
                }
                scope.collect().await;
            }
        };
        sim.run(root, None);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_until_cuts_run_short() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let reached = Rc::new(Cell::new(false));
        let flag = reached.clone();
        let end = sim.run(
            async move {
                handle.delay(100.0).await;
                flag.set(true);
            },
            Some(30.0),
        );
        assert_eq!(end, 30.0);
        assert!(!reached.get());
    }

    #[test]
    fn test_cancel_skips_body() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let touched = Rc::new(Cell::new(false));
        let root = {
            let handle = handle.clone();
            let touched = touched.clone();
            async move {
                let inner = handle.clone();
                let flag = touched.clone();
                let task = handle.spawn(async move {
                    inner.delay(10.0).await;
                    flag.set(true);
                });
                handle.delay(5.0).await;
                task.cancel();
                handle.delay(10.0).await;
            }
        };
        sim.run(root, None);
        assert!(!touched.get());
    }

    #[test]
    fn test_interval_ticks() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let root = {
            let handle = handle.clone();
            let ticks = ticks.clone();
            async move {
                let mut interval = handle.interval(60.0);
                for _ in 0..3 {
                    let at = interval.tick().await;
                    ticks.borrow_mut().push(at);
                }
            }
        };
        sim.run(root, None);
        assert_eq!(*ticks.borrow(), vec![60.0, 120.0, 180.0]);
    }

    #[test]
    fn test_join_returns_value() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let seen = Rc::new(Cell::new(0));
        let root = {
            let handle = handle.clone();
            let seen = seen.clone();
            async move {
                let inner = handle.clone();
                let task = handle.spawn(async move {
                    inner.delay(3.0).await;
                    7
                });
                if let Some(value) = task.join().await {
                    seen.set(value);
                }
            }
        };
        sim.run(root, None);
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn test_volatile_children_cancelled_on_collect() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let root = {
            let handle = handle.clone();
            async move {
                let mut scope = Scope::new(&handle);
                let forever = handle.clone();
                scope.spawn_volatile(async move {
                    loop {
                        forever.delay(1.0).await;
                    }
                });
                let bounded = handle.clone();
                scope.spawn(async move {
                    bounded.delay(4.0).await;
                });
                scope.collect().await;
            }
        };
        let end = sim.run(root, None);
        assert_eq!(end, 4.0);
    }
}
