use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

const ENTRY_IDLE: u8 = 0;
const ENTRY_PENDING: u8 = 1;

/// External clock driver hooks. The wheel never generates its own time base;
/// it tells the driver when ticking becomes necessary (population 0 to 1) and
/// when it stops being necessary (population back to 0).
pub trait TickSource: Send + Sync {
    fn arm(&self) {}
    fn disarm(&self) {}
}

struct NullTickSource;

impl TickSource for NullTickSource {}

/// Wheel geometry. Both rings are powers of two; one fine slot per tick, one
/// coarse slot per full fine revolution.
#[derive(Debug, Clone, Copy)]
pub struct WheelConfig {
    pub fine_slots: usize,
    pub coarse_slots: usize,
    /// Entries fired per `tick` or `reap_backlog` call before the rest is
    /// left as backlog.
    pub reap_quota: usize,
    /// Initial tick counter, for tests exercising counter wraparound.
    pub start_tick: u64,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            fine_slots: 256,
            coarse_slots: 64,
            reap_quota: 100,
            start_tick: 0,
        }
    }
}

/// A bounded-lifetime record awaiting expiry.
///
/// The caller owns the entry and its callback; while the entry is linked the
/// wheel holds one strong reference so expiry cannot race with the owner
/// dropping it. An entry is in exactly one slot list or in none, and may be
/// rescheduled after it fired or was cancelled.
pub struct TimedEntry {
    state: AtomicU8,
    /// Absolute deadline tick. Written under the wheel lock; wraparound is
    /// expected and handled with modular distance math only.
    deadline: AtomicU64,
    /// Slot links and position. Guarded by the wheel lock.
    node: UnsafeCell<EntryNode>,
    callback: Box<dyn Fn() + Send + Sync>,
}

// SAFETY: `node` is only touched while holding the owning wheel's mutex; the
// remaining fields are atomics and an immutable callback.
unsafe impl Send for TimedEntry {}
unsafe impl Sync for TimedEntry {}

impl TimedEntry {
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            state: AtomicU8::new(ENTRY_IDLE),
            deadline: AtomicU64::new(0),
            node: UnsafeCell::new(EntryNode::new()),
            callback: Box::new(callback),
        })
    }

    /// Advisory: whether the entry currently sits on the wheel.
    #[inline(always)]
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == ENTRY_PENDING
    }

    #[inline(always)]
    fn fire(&self) {
        (self.callback)();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Fine,
    Coarse,
}

struct EntryNode {
    prev: *mut TimedEntry,
    next: *mut TimedEntry,
    tier: Tier,
    slot: usize,
}

impl EntryNode {
    fn new() -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            tier: Tier::Fine,
            slot: 0,
        }
    }
}

/// Doubly-linked FIFO of entries sharing a slot. All operations require the
/// wheel lock; pointers are strong references taken at link time.
struct SlotList {
    head: *mut TimedEntry,
    tail: *mut TimedEntry,
}

impl SlotList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    unsafe fn push_back(&mut self, entry: *mut TimedEntry) {
        let node = unsafe { node_mut(entry) };
        node.prev = self.tail;
        node.next = ptr::null_mut();
        if self.tail.is_null() {
            self.head = entry;
        } else {
            unsafe { node_mut(self.tail) }.next = entry;
        }
        self.tail = entry;
    }

    unsafe fn pop_front(&mut self) -> *mut TimedEntry {
        let entry = self.head;
        if entry.is_null() {
            return entry;
        }
        let node = unsafe { node_mut(entry) };
        self.head = node.next;
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        } else {
            unsafe { node_mut(self.head) }.prev = ptr::null_mut();
        }
        node.prev = ptr::null_mut();
        node.next = ptr::null_mut();
        entry
    }

    unsafe fn unlink(&mut self, entry: *mut TimedEntry) {
        let node = unsafe { node_mut(entry) };
        if node.prev.is_null() {
            self.head = node.next;
        } else {
            unsafe { node_mut(node.prev) }.next = node.next;
        }
        if node.next.is_null() {
            self.tail = node.prev;
        } else {
            unsafe { node_mut(node.next) }.prev = node.prev;
        }
        node.prev = ptr::null_mut();
        node.next = ptr::null_mut();
    }
}

/// Caller must hold the wheel lock.
unsafe fn node_mut<'a>(entry: *mut TimedEntry) -> &'a mut EntryNode {
    unsafe { &mut *(*entry).node.get() }
}

struct WheelInner {
    fine: Box<[SlotList]>,
    coarse: Box<[SlotList]>,
    fine_cursor: usize,
    coarse_cursor: usize,
    current_tick: u64,
    /// The current fine slot still holds entries a quota-limited reap left
    /// behind; the cursor must not advance past them.
    backlog: bool,
    count: u64,
    armed: bool,
    closed: bool,
}

// SAFETY: the raw slot pointers are only dereferenced under the mutex that
// owns this value.
unsafe impl Send for WheelInner {}

impl Drop for WheelInner {
    fn drop(&mut self) {
        // Release the strong references of anything still linked, without
        // firing. Orderly teardown goes through force_expire_all first.
        for list in self.fine.iter_mut().chain(self.coarse.iter_mut()) {
            loop {
                let entry = unsafe { list.pop_front() };
                if entry.is_null() {
                    break;
                }
                unsafe { (*entry).state.store(ENTRY_IDLE, Ordering::Release) };
                drop(unsafe { Arc::from_raw(entry) });
            }
        }
    }
}

/// Result of one `tick` or `reap_backlog` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    /// Expiry callbacks invoked by this call.
    pub fired: usize,
    /// The reached slot still holds entries beyond the reap quota.
    pub backlog: bool,
}

/// Two-tier circular expiry wheel.
///
/// Short timeouts land in a fine ring with one slot per tick; longer ones sit
/// in a coarse ring and cascade back into the fine ring as their revolution
/// comes up. A single mutex serializes all structural mutation, which keeps
/// the slot invariants trivial; the wheel was never meant to be a scalability
/// point. Expiry callbacks always run outside the lock, after unlinking, so
/// they may freely reschedule or cancel entries.
pub struct ExpiryWheel {
    fine_mask: usize,
    coarse_mask: usize,
    fine_shift: u32,
    reap_quota: usize,
    inner: Mutex<WheelInner>,
    /// Mirror of the linked-entry count for lock-free empty checks. Written
    /// only under the lock.
    population: AtomicU64,
    tick_source: Arc<dyn TickSource>,
    stats: WheelStats,
}

impl ExpiryWheel {
    pub fn new(config: WheelConfig) -> Self {
        Self::with_tick_source(config, Arc::new(NullTickSource))
    }

    pub fn with_tick_source(config: WheelConfig, tick_source: Arc<dyn TickSource>) -> Self {
        assert!(
            config.fine_slots.is_power_of_two() && config.fine_slots >= 2,
            "fine_slots must be a power of 2"
        );
        assert!(
            config.coarse_slots.is_power_of_two() && config.coarse_slots >= 2,
            "coarse_slots must be a power of 2"
        );
        assert!(config.reap_quota > 0, "reap_quota must be nonzero");
        // One coarse advance per fine revolution, so each coarse slot spans
        // exactly the fine ring. A coarse slot narrower than the fine span
        // would let cascaded entries outrun the fine ring.
        let coarse_slot_span = config.fine_slots as u64;
        assert!(coarse_slot_span >= config.fine_slots as u64);

        let fine = (0..config.fine_slots)
            .map(|_| SlotList::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let coarse = (0..config.coarse_slots)
            .map(|_| SlotList::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            fine_mask: config.fine_slots - 1,
            coarse_mask: config.coarse_slots - 1,
            fine_shift: config.fine_slots.trailing_zeros(),
            reap_quota: config.reap_quota,
            inner: Mutex::new(WheelInner {
                fine,
                coarse,
                fine_cursor: 0,
                coarse_cursor: 0,
                current_tick: config.start_tick,
                backlog: false,
                count: 0,
                armed: false,
                closed: false,
            }),
            population: AtomicU64::new(0),
            tick_source,
            stats: WheelStats::new(),
        }
    }

    /// Links `entry` to expire `timeout_ticks` from now.
    ///
    /// A zero timeout fires the callback synchronously, outside the lock,
    /// without ever linking the entry. Once the wheel has been shut down via
    /// `force_expire_all`, every schedule degenerates to the synchronous
    /// path so teardown stays terminal.
    pub fn schedule(
        &self,
        entry: &Arc<TimedEntry>,
        timeout_ticks: u64,
    ) -> Result<(), ScheduleError> {
        let mut arm = false;
        let fire_now;
        {
            let mut inner = self.inner.lock();
            if entry.state.load(Ordering::Relaxed) == ENTRY_PENDING {
                return Err(ScheduleError::AlreadyScheduled);
            }
            fire_now = timeout_ticks == 0 || inner.closed;
            if !fire_now {
                let deadline = inner.current_tick.wrapping_add(timeout_ticks);
                entry.deadline.store(deadline, Ordering::Relaxed);
                let ptr = Arc::into_raw(entry.clone()) as *mut TimedEntry;
                // SAFETY: holding the wheel lock; ptr is freshly unlinked.
                unsafe { self.link(&mut inner, ptr, timeout_ticks) };
                entry.state.store(ENTRY_PENDING, Ordering::Release);
                inner.count += 1;
                self.population.store(inner.count, Ordering::Release);
                if inner.count == 1 && !inner.armed {
                    inner.armed = true;
                    arm = true;
                }
            }
        }
        self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
        if arm {
            self.tick_source.arm();
        }
        if fire_now {
            trace!("zero timeout, firing synchronously");
            entry.fire();
            self.stats.fired.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Unlinks `entry` if it is pending. Returns whether it was. Cancelling
    /// an entry whose slot was already reaped (callback in flight or done)
    /// returns false and never fires the callback twice.
    pub fn cancel(&self, entry: &Arc<TimedEntry>) -> bool {
        let mut disarm = false;
        let was_pending = {
            let mut inner = self.inner.lock();
            if entry.state.load(Ordering::Relaxed) != ENTRY_PENDING {
                false
            } else {
                let ptr = Arc::as_ptr(entry) as *mut TimedEntry;
                // SAFETY: holding the wheel lock and the entry is linked.
                let (tier, slot) = unsafe {
                    let node = node_mut(ptr);
                    (node.tier, node.slot)
                };
                unsafe {
                    match tier {
                        Tier::Fine => inner.fine[slot].unlink(ptr),
                        Tier::Coarse => inner.coarse[slot].unlink(ptr),
                    }
                }
                entry.state.store(ENTRY_IDLE, Ordering::Release);
                inner.count -= 1;
                self.population.store(inner.count, Ordering::Release);
                if inner.backlog {
                    let cursor = inner.fine_cursor;
                    inner.backlog = !inner.fine[cursor].is_empty();
                }
                if inner.count == 0 && inner.armed {
                    inner.armed = false;
                    disarm = true;
                }
                // SAFETY: reclaims the strong reference taken at link time.
                drop(unsafe { Arc::from_raw(ptr) });
                true
            }
        };
        if disarm {
            self.tick_source.disarm();
        }
        if was_pending {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        was_pending
    }

    /// Advances the wheel by one tick and fires due entries.
    ///
    /// If the previous call left backlog, this call keeps reaping that slot
    /// instead of advancing, so slot FIFO order and the tick count stay
    /// coherent. At most `reap_quota` callbacks run per call; a remainder is
    /// reported via `TickOutcome::backlog`.
    pub fn tick(&self) -> TickOutcome {
        let mut batch = Vec::new();
        let mut disarm = false;
        let backlog;
        {
            let mut inner = self.inner.lock();
            if !inner.backlog {
                inner.current_tick = inner.current_tick.wrapping_add(1);
                inner.fine_cursor = (inner.fine_cursor + 1) & self.fine_mask;
                if inner.fine_cursor == 0 {
                    inner.coarse_cursor = (inner.coarse_cursor + 1) & self.coarse_mask;
                    // SAFETY: holding the wheel lock.
                    unsafe { self.cascade(&mut inner) };
                }
            }
            backlog = self.reap_current_slot(&mut inner, &mut batch, &mut disarm);
        }
        self.finish_reap(batch, backlog, disarm)
    }

    /// Continues reaping a backlogged slot without advancing time. Intended
    /// for a dispatch vector that finishes what a quota-limited tick left
    /// behind. No-op when there is no backlog.
    pub fn reap_backlog(&self) -> TickOutcome {
        let mut batch = Vec::new();
        let mut disarm = false;
        let backlog;
        {
            let mut inner = self.inner.lock();
            if !inner.backlog {
                return TickOutcome::default();
            }
            backlog = self.reap_current_slot(&mut inner, &mut batch, &mut disarm);
        }
        self.finish_reap(batch, backlog, disarm)
    }

    /// Fires every remaining entry in slot order (not deadline order) and
    /// closes the wheel. Later schedules fire synchronously; `tick` becomes a
    /// no-op apart from advancing time.
    pub fn force_expire_all(&self) -> usize {
        let mut batch = Vec::new();
        let mut disarm = false;
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.backlog = false;
            let fine_len = self.fine_mask + 1;
            for offset in 0..fine_len {
                let slot = (inner.fine_cursor + offset) & self.fine_mask;
                Self::drain_slot(&mut inner.fine[slot], &mut batch);
            }
            let coarse_len = self.coarse_mask + 1;
            for offset in 0..coarse_len {
                let slot = (inner.coarse_cursor + offset) & self.coarse_mask;
                Self::drain_slot(&mut inner.coarse[slot], &mut batch);
            }
            inner.count = 0;
            self.population.store(0, Ordering::Release);
            if inner.armed {
                inner.armed = false;
                disarm = true;
            }
        }
        if disarm {
            self.tick_source.disarm();
        }
        let expired = batch.len();
        if expired > 0 {
            debug!(count = expired, "force-expiring remaining entries");
        }
        for entry in batch {
            entry.fire();
        }
        self.stats.fired.fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.population.load(Ordering::Acquire) == 0
    }

    #[inline(always)]
    pub fn len(&self) -> u64 {
        self.population.load(Ordering::Acquire)
    }

    pub fn current_tick(&self) -> u64 {
        self.inner.lock().current_tick
    }

    pub fn stats(&self) -> WheelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Places `ptr` at `distance > 0` ticks ahead. Caller holds the lock.
    unsafe fn link(&self, inner: &mut WheelInner, ptr: *mut TimedEntry, distance: u64) {
        debug_assert!(distance > 0);
        let fine_len = (self.fine_mask + 1) as u64;
        let node = unsafe { node_mut(ptr) };
        if distance < fine_len {
            let slot = (inner.fine_cursor + distance as usize) & self.fine_mask;
            node.tier = Tier::Fine;
            node.slot = slot;
            unsafe { inner.fine[slot].push_back(ptr) };
        } else {
            // Beyond-horizon timeouts park in the farthest coarse slot and
            // take additional revolutions through the cascade.
            let revolutions = ((distance >> self.fine_shift) as usize).min(self.coarse_mask);
            let slot = (inner.coarse_cursor + revolutions) & self.coarse_mask;
            node.tier = Tier::Coarse;
            node.slot = slot;
            unsafe { inner.coarse[slot].push_back(ptr) };
        }
    }

    /// Re-buckets the reached coarse slot into the fine ring. Entries due
    /// right now join the current fine slot, which the caller reaps next.
    /// Caller holds the lock.
    unsafe fn cascade(&self, inner: &mut WheelInner) {
        let slot = inner.coarse_cursor;
        let mut moved = 0u64;
        loop {
            let ptr = unsafe { inner.coarse[slot].pop_front() };
            if ptr.is_null() {
                break;
            }
            let deadline = unsafe { (*ptr).deadline.load(Ordering::Relaxed) };
            let residual = deadline.wrapping_sub(inner.current_tick);
            if residual == 0 {
                let cursor = inner.fine_cursor;
                let node = unsafe { node_mut(ptr) };
                node.tier = Tier::Fine;
                node.slot = cursor;
                unsafe { inner.fine[cursor].push_back(ptr) };
            } else {
                unsafe { self.link(inner, ptr, residual) };
            }
            moved += 1;
        }
        if moved > 0 {
            trace!(slot, moved, "cascaded coarse slot into fine ring");
            self.stats.cascaded.fetch_add(moved, Ordering::Relaxed);
        }
    }

    /// Reaps up to `reap_quota` entries from the current fine slot into
    /// `batch`. Returns whether backlog remains. Caller holds the lock.
    fn reap_current_slot(
        &self,
        inner: &mut WheelInner,
        batch: &mut Vec<Arc<TimedEntry>>,
        disarm: &mut bool,
    ) -> bool {
        let slot = inner.fine_cursor;
        while batch.len() < self.reap_quota {
            let ptr = unsafe { inner.fine[slot].pop_front() };
            if ptr.is_null() {
                break;
            }
            // SAFETY: reclaims the strong reference taken at link time.
            let entry = unsafe { Arc::from_raw(ptr) };
            entry.state.store(ENTRY_IDLE, Ordering::Release);
            inner.count -= 1;
            batch.push(entry);
        }
        inner.backlog = !inner.fine[slot].is_empty();
        self.population.store(inner.count, Ordering::Release);
        if inner.count == 0 && inner.armed {
            inner.armed = false;
            *disarm = true;
        }
        inner.backlog
    }

    fn finish_reap(
        &self,
        batch: Vec<Arc<TimedEntry>>,
        backlog: bool,
        disarm: bool,
    ) -> TickOutcome {
        if disarm {
            self.tick_source.disarm();
        }
        if backlog {
            self.stats.deferred.fetch_add(1, Ordering::Relaxed);
            debug!(quota = self.reap_quota, "reap quota spent, leaving backlog");
        }
        let fired = batch.len();
        for entry in batch {
            entry.fire();
        }
        self.stats.fired.fetch_add(fired as u64, Ordering::Relaxed);
        TickOutcome { fired, backlog }
    }

    fn drain_slot(list: &mut SlotList, batch: &mut Vec<Arc<TimedEntry>>) {
        loop {
            let ptr = unsafe { list.pop_front() };
            if ptr.is_null() {
                break;
            }
            let entry = unsafe { Arc::from_raw(ptr) };
            entry.state.store(ENTRY_IDLE, Ordering::Release);
            batch.push(entry);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// The entry is already linked on the wheel.
    #[error("entry is already scheduled on the wheel")]
    AlreadyScheduled,
}

struct WheelStats {
    scheduled: AtomicU64,
    cancelled: AtomicU64,
    fired: AtomicU64,
    cascaded: AtomicU64,
    deferred: AtomicU64,
}

impl WheelStats {
    fn new() -> Self {
        Self {
            scheduled: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            cascaded: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> WheelStatsSnapshot {
        WheelStatsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            cascaded: self.cascaded.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the wheel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WheelStatsSnapshot {
    pub scheduled: u64,
    pub cancelled: u64,
    pub fired: u64,
    pub cascaded: u64,
    pub deferred: u64,
}
