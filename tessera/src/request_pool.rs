use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};

use parking_lot::{Condvar, Mutex};
use tessera_error::{TesseraResult, tessera_bail};

use crate::RequestFuture;

struct Queue<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A first-in first-out queue of pending results.
///
/// Any number of threads may [`add`][Self::add]; [`next`][Self::next] hands items back in the
/// order they were added, however their requests complete. Waiting on the result itself is left
/// to the retrieval mode called on the returned future.
pub struct RequestPool<T = RequestFuture> {
    queue: Mutex<Queue<T>>,
    added: Condvar,
}

impl<T> RequestPool<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                closed: false,
            }),
            added: Condvar::new(),
        }
    }

    /// Appends `item`. Fails with `Closed` once the pool has been closed.
    pub fn add(&self, item: T) -> TesseraResult<()> {
        let mut queue = self.queue.lock();
        if queue.closed {
            tessera_bail!(Closed: "request pool is closed");
        }
        queue.items.push_back(item);
        drop(queue);
        self.added.notify_one();
        Ok(())
    }

    /// Pops the oldest item, blocking while the pool is empty and open.
    ///
    /// Returns `None` once the pool is closed and drained.
    pub fn next(&self) -> Option<T> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(item) = queue.items.pop_front() {
                return Some(item);
            }
            if queue.closed {
                return None;
            }
            self.added.wait(&mut queue);
        }
    }

    /// Pops the oldest item without blocking.
    pub fn try_next(&self) -> Option<T> {
        self.queue.lock().items.pop_front()
    }

    /// Refuses further items and wakes blocked consumers. Items already added can still be
    /// taken.
    pub fn close(&self) {
        self.queue.lock().closed = true;
        self.added.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    pub fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().items.is_empty()
    }
}

impl<T> Default for RequestPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for RequestPool<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("RequestPool")
            .field("len", &queue.items.len())
            .field("closed", &queue.closed)
            .finish()
    }
}
