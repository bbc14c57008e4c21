// SPDX-License-Identifier: MIT
//! Worker pool — bounded concurrent execution, decoupled from the tick loop.
//!
//! The tick thread submits and forgets; a slow agent can never stall
//! scheduling. The bound is a semaphore whose permit travels into the
//! spawned task and is released when the execution (and its completion
//! continuation) finishes, including on panic.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of executions currently running.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Submit `fut` if a worker slot is free.
    ///
    /// Returns `false` without running anything when the pool is saturated;
    /// the caller decides what backpressure means (the scheduler releases the
    /// agent's lock and retries on a later tick).
    pub fn try_dispatch<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    fut.await;
                    drop(permit);
                });
                true
            }
            Err(_) => {
                debug!(capacity = self.capacity, "worker pool saturated");
                false
            }
        }
    }
}
