use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

/// Permit-counting park/unpark primitive for a worker's helper thread.
///
/// Producers add permits when they want the helper awake; the helper consumes
/// one permit per wake. Permits accumulate while nobody sleeps, so a wake
/// request issued before the helper parks is never lost. The sleeper count is
/// approximate and only throttles notifications.
pub(crate) struct HelperWaker {
    permits: CachePadded<AtomicU64>,
    sleepers: AtomicUsize,
    m: Mutex<()>,
    cv: Condvar,
}

impl HelperWaker {
    pub(crate) fn new() -> Self {
        Self {
            permits: CachePadded::new(AtomicU64::new(0)),
            sleepers: AtomicUsize::new(0),
            m: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Adds `count` permits and notifies at most that many sleepers.
    pub(crate) fn release(&self, count: u64) {
        self.permits.fetch_add(count, Ordering::Release);
        if self.sleepers.load(Ordering::Relaxed) == 0 {
            return;
        }
        // Taking the mutex orders this notify after any sleeper that failed
        // its permit check but has not yet parked.
        drop(self.lock());
        let wake = count.min(self.sleepers.load(Ordering::Relaxed) as u64);
        for _ in 0..wake.max(1) {
            self.cv.notify_one();
        }
    }

    /// Consumes one permit if available.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut current = self.permits.load(Ordering::Acquire);
        while current > 0 {
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Parks until a permit arrives or `timeout` elapses. Returns whether a
    /// permit was consumed.
    pub(crate) fn acquire_timeout(&self, timeout: Duration) -> bool {
        if self.try_acquire() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        self.sleepers.fetch_add(1, Ordering::Relaxed);
        let acquired = loop {
            if self.try_acquire() {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            let (next, _timed_out) = self
                .cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard = next;
        };
        self.sleepers.fetch_sub(1, Ordering::Relaxed);
        acquired
    }

    #[cfg(test)]
    pub(crate) fn permits(&self) -> u64 {
        self.permits.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.m
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn permits_accumulate_without_sleepers() {
        let waker = HelperWaker::new();
        waker.release(1);
        waker.release(1);
        assert_eq!(waker.permits(), 2);
        assert!(waker.try_acquire());
        assert!(waker.try_acquire());
        assert!(!waker.try_acquire());
    }

    #[test]
    fn acquire_times_out_when_no_permit() {
        let waker = HelperWaker::new();
        let start = Instant::now();
        assert!(!waker.acquire_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn parked_thread_is_woken_by_release() {
        let waker = Arc::new(HelperWaker::new());
        let sleeper = {
            let waker = waker.clone();
            thread::spawn(move || waker.acquire_timeout(Duration::from_secs(5)))
        };
        // Give the sleeper a moment to park, then wake it.
        thread::sleep(Duration::from_millis(10));
        waker.release(1);
        assert!(sleeper.join().unwrap());
        assert_eq!(waker.permits(), 0);
    }
}
