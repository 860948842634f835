//! Bounded worker-permit pool.
//!
//! One permit is checked out per client operation before any backend work
//! starts, capping total concurrent backend calls. Release is RAII: the
//! permit returns to the pool on every exit path, failure and panic
//! included.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Default number of concurrent worker permits.
pub const DEFAULT_WORKERS: usize = 20;

struct PoolState {
    available: Mutex<usize>,
    cond: Condvar,
    capacity: usize,
}

/// Fixed-size permit pool.
#[derive(Clone)]
pub struct WorkerPool {
    state: Arc<PoolState>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::new(PoolState {
                available: Mutex::new(capacity),
                cond: Condvar::new(),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        *self.state.available.lock()
    }

    /// Acquire a permit, waiting at most `timeout`. `None` means the pool
    /// stayed exhausted for the whole wait.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<WorkerPermit> {
        let mut available = self.state.available.lock();
        while *available == 0 {
            if self.state.cond.wait_for(&mut available, timeout).timed_out() && *available == 0 {
                return None;
            }
        }
        *available -= 1;
        trace!(available = *available, "worker permit acquired");
        Some(WorkerPermit {
            state: self.state.clone(),
        })
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

/// RAII guard returning its permit on drop.
pub struct WorkerPermit {
    state: Arc<PoolState>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        let mut available = self.state.available.lock();
        *available += 1;
        self.state.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let pool = WorkerPool::new(2);
        let a = pool.acquire_timeout(Duration::from_millis(10)).unwrap();
        let _b = pool.acquire_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_exhaustion_times_out() {
        let pool = WorkerPool::new(1);
        let _held = pool.acquire_timeout(Duration::from_millis(10)).unwrap();
        assert!(pool.acquire_timeout(Duration::from_millis(30)).is_none());
    }

    #[test]
    fn test_released_across_threads() {
        let pool = WorkerPool::new(1);
        let held = pool.acquire_timeout(Duration::from_millis(10)).unwrap();

        let pool2 = pool.clone();
        let handle = std::thread::spawn(move || {
            pool2.acquire_timeout(Duration::from_secs(2)).is_some()
        });

        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(handle.join().unwrap());
    }
}
