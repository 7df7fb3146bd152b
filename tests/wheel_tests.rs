//! Integration tests for the expiry wheel: horizon sweeps, ordering across
//! ticks, and cancellation races.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use softwheel::{ExpiryWheel, ScheduleError, TimedEntry, WheelConfig};

#[test]
fn thousand_entries_fire_once_in_deadline_order() {
    let wheel = ExpiryWheel::new(WheelConfig {
        fine_slots: 256,
        coarse_slots: 64,
        reap_quota: 100,
        start_tick: 0,
    });
    let fired = Arc::new(Mutex::new(Vec::new()));

    let mut entries = Vec::new();
    for i in 0..1000u64 {
        // Deadlines uniformly spread over the fine ring's horizon.
        let timeout = 1 + (i % 255);
        let fired = fired.clone();
        let entry = TimedEntry::new(move || fired.lock().unwrap().push(timeout));
        wheel.schedule(&entry, timeout).unwrap();
        entries.push(entry);
    }
    assert_eq!(wheel.len(), 1000);

    for _ in 0..255 {
        wheel.tick();
    }

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 1000, "every entry fired exactly once");
    assert!(
        fired.windows(2).all(|pair| pair[0] <= pair[1]),
        "expiries are non-decreasing in deadline across ticks"
    );
    assert!(wheel.is_empty());
    for entry in &entries {
        assert!(!entry.is_pending());
    }
}

#[test]
fn entries_spanning_both_rings_all_fire() {
    let wheel = ExpiryWheel::new(WheelConfig {
        fine_slots: 16,
        coarse_slots: 16,
        reap_quota: 100,
        start_tick: 0,
    });
    let counter = Arc::new(AtomicUsize::new(0));

    let mut entries = Vec::new();
    for timeout in [1u64, 7, 15, 16, 40, 100, 200, 255] {
        let counter = counter.clone();
        let entry = TimedEntry::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        wheel.schedule(&entry, timeout).unwrap();
        entries.push(entry);
    }

    for _ in 0..256 {
        wheel.tick();
    }
    assert_eq!(counter.load(Ordering::Relaxed), entries.len());
    assert!(wheel.is_empty());
}

#[test]
fn cancel_from_another_thread_before_fire() {
    let wheel = Arc::new(ExpiryWheel::new(WheelConfig {
        fine_slots: 64,
        coarse_slots: 8,
        reap_quota: 100,
        start_tick: 0,
    }));
    let counter = Arc::new(AtomicUsize::new(0));
    let entry = {
        let counter = counter.clone();
        TimedEntry::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };

    wheel.schedule(&entry, 50).unwrap();
    let canceller = {
        let wheel = wheel.clone();
        let entry = entry.clone();
        thread::spawn(move || wheel.cancel(&entry))
    };
    assert!(canceller.join().unwrap());

    for _ in 0..64 {
        wheel.tick();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 0, "cancelled entry fired");
}

#[test]
fn cancel_and_reschedule_cycle() {
    let wheel = ExpiryWheel::new(WheelConfig {
        fine_slots: 8,
        coarse_slots: 8,
        reap_quota: 100,
        start_tick: 0,
    });
    let counter = Arc::new(AtomicUsize::new(0));
    let entry = {
        let counter = counter.clone();
        TimedEntry::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };

    // Cancel keeps winning over expiry as long as it lands first.
    for _ in 0..3 {
        wheel.schedule(&entry, 2).unwrap();
        assert!(wheel.cancel(&entry));
    }
    assert_eq!(counter.load(Ordering::Relaxed), 0);

    wheel.schedule(&entry, 2).unwrap();
    assert_eq!(
        wheel.schedule(&entry, 1),
        Err(ScheduleError::AlreadyScheduled)
    );
    wheel.tick();
    wheel.tick();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
    assert!(!wheel.cancel(&entry), "already fired, not pending");
}

#[test]
fn expiry_callback_may_reschedule_its_entry() {
    let wheel = Arc::new(ExpiryWheel::new(WheelConfig {
        fine_slots: 8,
        coarse_slots: 8,
        reap_quota: 100,
        start_tick: 0,
    }));
    let counter = Arc::new(AtomicUsize::new(0));
    let rearm: Arc<std::sync::OnceLock<(Arc<ExpiryWheel>, Arc<TimedEntry>)>> =
        Arc::new(std::sync::OnceLock::new());
    let entry = {
        let counter = counter.clone();
        let rearm = rearm.clone();
        TimedEntry::new(move || {
            if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                let (wheel, entry) = rearm.get().expect("rearm cell set");
                wheel.schedule(entry, 2).unwrap();
            }
        })
    };
    rearm.set((wheel.clone(), entry.clone())).ok().unwrap();

    wheel.schedule(&entry, 1).unwrap();
    for _ in 0..4 {
        wheel.tick();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 2);
    assert!(wheel.is_empty());
}

#[test]
fn heavy_slot_backlog_eventually_drains_via_ticks_alone() {
    let wheel = ExpiryWheel::new(WheelConfig {
        fine_slots: 8,
        coarse_slots: 8,
        reap_quota: 3,
        start_tick: 0,
    });
    let counter = Arc::new(AtomicUsize::new(0));
    let entries: Vec<_> = (0..10)
        .map(|_| {
            let counter = counter.clone();
            let entry = TimedEntry::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            wheel.schedule(&entry, 1).unwrap();
            entry
        })
        .collect();

    // Four tick calls: 3 + 3 + 3 + 1, with the cursor held in place.
    for _ in 0..4 {
        wheel.tick();
    }
    assert_eq!(counter.load(Ordering::Relaxed), entries.len());
    assert!(wheel.is_empty());
}
