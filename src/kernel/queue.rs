//! Async FIFO queue used for job streams, drone mailboxes and monitoring
//!
//! Puts never block; consumers suspend until an item or close arrives.
//! After `close`, consumers drain the backlog and then observe `None`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::{Poll, Waker};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    wakers: Vec<Waker>,
}

/// Unbounded single-threaded FIFO channel.
pub struct Queue<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                items: VecDeque::new(),
                closed: false,
                wakers: Vec::new(),
            })),
        }
    }

    /// Enqueue an item. Items put after `close` are discarded.
    pub fn put(&self, item: T) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.items.push_back(item);
        for waker in inner.wakers.drain(..) {
            waker.wake();
        }
    }

    /// Dequeue the next item; `None` once the queue is closed and drained.
    pub async fn get(&self) -> Option<T> {
        std::future::poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            if let Some(item) = inner.items.pop_front() {
                Poll::Ready(Some(item))
            } else if inner.closed {
                Poll::Ready(None)
            } else {
                inner.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    /// Close the queue, terminating consumers once the backlog drains.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        for waker in inner.wakers.drain(..) {
            waker.wake();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }
}
