//! A fixed work queue with a drifting head index, grounded in `add_to_queue`
//! in http.c: a plain array plus a head index, compacted (memmove the live
//! entries back to the front) rather than grown, whenever the tail runs out
//! of room but there's slack behind the head.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// `None` is the shutdown sentinel the main thread enqueues once per
/// worker so every worker wakes up, sees it, and exits its loop.
pub(crate) type Job<T> = Option<Arc<T>>;

struct Inner<T> {
    items: Vec<Job<T>>,
    head: usize,
}

pub(crate) struct ClientQueue<T> {
    state: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T> ClientQueue<T> {
    pub fn new() -> Self {
        ClientQueue {
            state: Mutex::new(Inner {
                items: Vec::new(),
                head: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, job: Job<T>) {
        let mut state = self.state.lock();
        // Compact before growing: if the head has drifted right and left
        // dead slack behind it, shift the live entries back to the front
        // first rather than reallocate.
        if state.head > 0 && state.items.len() == state.items.capacity() {
            let head = state.head;
            state.items.drain(..head);
            state.head = 0;
        }
        state.items.push(job);
        self.not_empty.notify_one();
    }

    /// Blocks until a job is available.
    pub fn pop(&self) -> Job<T> {
        let mut state = self.state.lock();
        loop {
            if state.head < state.items.len() {
                let job = state.items[state.head].take();
                state.head += 1;
                return job;
            }
            self.not_empty.wait(&mut state);
        }
    }
}

impl<T> Default for ClientQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
