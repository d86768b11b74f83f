//! Counting semaphore bounding the writer's unflushed pages.
//!
//! The write-boundary semaphore holds `file_length_bound / page_size`
//! permits; the writer takes one per sealed-but-unflushed page and returns
//! them when the pages reach the data writer. This keeps the writer from
//! outrunning the cache's capacity to retain pages that are not yet
//! durable.

use parking_lot::{Condvar, Mutex};

/// A simple counting semaphore.
pub struct Semaphore {
    available: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

impl Semaphore {
    /// Creates a semaphore with `capacity` permits, all available.
    pub fn new(capacity: usize) -> Self {
        Self { available: Mutex::new(capacity), released: Condvar::new(), capacity }
    }

    /// Total number of permits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquires `permits`, blocking until they are available.
    pub fn acquire(&self, permits: usize) {
        debug_assert!(permits <= self.capacity);
        let mut available = self.available.lock();
        while *available < permits {
            self.released.wait(&mut available);
        }
        *available -= permits;
    }

    /// Attempts to acquire `permits` without blocking.
    pub fn try_acquire(&self, permits: usize) -> bool {
        let mut available = self.available.lock();
        if *available >= permits {
            *available -= permits;
            true
        } else {
            false
        }
    }

    /// Returns `permits` to the semaphore.
    pub fn release(&self, permits: usize) {
        if permits == 0 {
            return;
        }
        let mut available = self.available.lock();
        *available = (*available + permits).min(self.capacity);
        self.released.notify_all();
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        *self.available.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_acquire_release() {
        let sem = Semaphore::new(4);
        sem.acquire(3);
        assert_eq!(sem.available(), 1);
        assert!(!sem.try_acquire(2));
        assert!(sem.try_acquire(1));
        sem.release(4);
        assert_eq!(sem.available(), 4);
    }

    #[test]
    fn test_release_never_exceeds_capacity() {
        let sem = Semaphore::new(2);
        sem.release(10);
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn test_blocking_acquire_wakes_on_release() {
        let sem = Arc::new(Semaphore::new(1));
        sem.acquire(1);

        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || {
                sem.acquire(1);
                sem.release(1);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        sem.release(1);
        waiter.join().expect("waiter panicked");
        assert_eq!(sem.available(), 1);
    }
}
