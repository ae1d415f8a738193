//! Counting semaphore used for the per-buffer fan-out/fan-in handshake

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
///
/// Conceptually an integer that is never less than zero: `post` increments
/// the count and `wait` decrements it, blocking while the count is zero.
///
/// Unlike a bare condition variable the "signal" is persistent: a post issued
/// before the matching wait is still observed by that wait. The driver thread
/// relies on this when it posts the start semaphore before a worker has
/// looped back around to wait on it.
pub struct Semaphore {
    count: Mutex<u32>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    /// Post to (increment) the semaphore, waking one waiter if necessary.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.condvar.notify_one();
    }

    /// Wait on (decrement) the semaphore, blocking while the count is zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.condvar.wait(&mut count);
        }
        *count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_post_before_wait_is_not_lost() {
        let semaphore = Semaphore::new(0);
        semaphore.post();
        semaphore.post();
        semaphore.wait();
        semaphore.wait(); // would hang if a post were lost
    }

    #[test]
    fn test_initial_count_is_consumable() {
        let semaphore = Semaphore::new(3);
        for _ in 0..3 {
            semaphore.wait();
        }
    }

    #[test]
    fn test_posts_wake_matching_number_of_waits() {
        let semaphore = Arc::new(Semaphore::new(0));
        let woken = Arc::new(AtomicU32::new(0));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let semaphore = Arc::clone(&semaphore);
                let woken = Arc::clone(&woken);
                std::thread::spawn(move || {
                    semaphore.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for _ in 0..4 {
            semaphore.post();
        }
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
    }
}
