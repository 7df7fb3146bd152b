use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_utils::CachePadded;
use tracing::{debug, trace};

use crate::signal::Pending;
use crate::task::{Task, TaskStack};
use crate::vector::{RegisterError, VectorId, VectorTable, HI_TASK_VECTOR, TASK_VECTOR};
use crate::waker::HelperWaker;

/// Upper bound on dispatch passes per `dispatch_pending` call. Work left over
/// after the budget is spent is handed to the helper thread, never dropped.
pub const MAX_RESTART: u32 = 10;

const HELPER_PARK_TIMEOUT: Duration = Duration::from_millis(50);

thread_local! {
    static ACTIVE_WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Whether raises outside a dispatch pass may wake a background helper.
    /// Disabled workers only run vectors when the caller dispatches.
    pub helper: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self { helper: true }
    }
}

/// Outcome of one `dispatch_pending` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOutcome {
    /// Vector handlers invoked across all passes of this call.
    pub vectors_run: u32,
    /// The restart budget ran out with work still pending.
    pub deferred: bool,
}

/// One dispatch worker, the user-space stand-in for a CPU's deferred-work
/// context.
///
/// Producers raise vectors from any thread; the worker (or its helper thread)
/// drains them with `dispatch_pending`. A worker never runs two dispatch
/// passes concurrently, and vector handlers must not block.
pub struct Worker {
    id: u32,
    table: Arc<VectorTable>,
    pending: CachePadded<Pending>,
    run_list: TaskStack,
    hi_run_list: TaskStack,
    waker: HelperWaker,
    in_dispatch: AtomicBool,
    shutdown: AtomicBool,
    helper_enabled: bool,
    helper_started: AtomicBool,
    helper: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(id: u32, table: Arc<VectorTable>) -> Arc<Self> {
        Self::with_options(id, table, WorkerOptions::default())
    }

    pub fn with_options(id: u32, table: Arc<VectorTable>, options: WorkerOptions) -> Arc<Self> {
        Arc::new(Self {
            id,
            table,
            pending: CachePadded::new(Pending::new()),
            run_list: TaskStack::new(),
            hi_run_list: TaskStack::new(),
            waker: HelperWaker::new(),
            in_dispatch: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            helper_enabled: options.helper,
            helper_started: AtomicBool::new(false),
            helper: parking_lot::Mutex::new(None),
            stats: WorkerStats::new(),
        })
    }

    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline(always)]
    pub fn table(&self) -> &Arc<VectorTable> {
        &self.table
    }

    /// Marks vector `id` pending on this worker. Safe from any thread. When
    /// the caller is not inside this worker's dispatch pass the helper is
    /// woken, in case no inline dispatch is imminent.
    pub fn raise(self: &Arc<Self>, id: VectorId) {
        let result = self.pending.set(id);
        if result.was_set && !self.dispatching_here() {
            trace!(worker = self.id, vector = id, "raise outside dispatch");
            self.wake_helper();
        }
    }

    /// Schedules `task` on the normal task vector. Idempotent while pending.
    pub fn schedule(self: &Arc<Self>, task: &Arc<Task>) {
        if !task.try_mark_scheduled() {
            return;
        }
        self.run_list.push(task.clone());
        self.raise(TASK_VECTOR);
    }

    /// Schedules `task` on the high-priority vector, which runs before every
    /// other vector in a pass.
    pub fn schedule_hi(self: &Arc<Self>, task: &Arc<Task>) {
        if !task.try_mark_scheduled() {
            return;
        }
        self.hi_run_list.push(task.clone());
        self.raise(HI_TASK_VECTOR);
    }

    /// Drains pending vectors.
    ///
    /// Each pass snapshots and clears the whole mask, then runs the set
    /// vectors in ascending id order. Producer activity during a pass re-sets
    /// bits and triggers a bounded number of restart passes with a
    /// cooperative yield in between; past `MAX_RESTART`, remaining work is
    /// left visibly pending and the helper takes over.
    pub fn dispatch_pending(self: &Arc<Self>) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        if self.in_dispatch.swap(true, Ordering::Acquire) {
            // Another thread is mid-pass on this worker; it will observe any
            // bits we set, or hand off to the helper.
            return outcome;
        }
        let previous = ACTIVE_WORKER.with(|cell| cell.replace(Arc::as_ptr(self)));

        let mut budget = MAX_RESTART;
        loop {
            let mask = self.pending.snapshot_clear();
            if mask == 0 {
                break;
            }
            self.stats.dispatch_passes.fetch_add(1, Ordering::Relaxed);

            let mut bits = mask;
            while bits != 0 {
                let id = bits.trailing_zeros() as VectorId;
                bits &= bits - 1;
                match self.table.get(id) {
                    Some(entry) => {
                        trace!(worker = self.id, vector = id, label = entry.label(), "run vector");
                        entry.invoke(self);
                        outcome.vectors_run += 1;
                        self.stats.vector_runs.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        debug!(worker = self.id, vector = id, "raised vector has no handler");
                    }
                }
            }

            budget -= 1;
            if self.pending.is_empty() {
                break;
            }
            if budget == 0 {
                outcome.deferred = true;
                self.stats.handoffs.fetch_add(1, Ordering::Relaxed);
                debug!(worker = self.id, "restart budget exhausted, deferring");
                self.wake_helper();
                break;
            }
            self.stats.restarts.fetch_add(1, Ordering::Relaxed);
            thread::yield_now();
        }

        ACTIVE_WORKER.with(|cell| cell.set(previous));
        self.in_dispatch.store(false, Ordering::Release);
        outcome
    }

    /// Stops the helper and drains everything still pending on the calling
    /// thread. Returns when the worker is quiescent. Scheduled-but-disabled
    /// tasks must be enabled (or killed) first or the drain cannot finish.
    pub fn stop(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::Release);
        self.waker.release(1);
        let handle = self.helper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        while !self.pending.is_empty() {
            self.dispatch_pending();
            thread::yield_now();
        }
        debug!(worker = self.id, "worker quiesced");
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    fn dispatching_here(&self) -> bool {
        ACTIVE_WORKER.with(|cell| ptr::eq(cell.get(), self))
    }

    fn wake_helper(self: &Arc<Self>) {
        if !self.helper_enabled || self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.ensure_helper();
        self.stats.helper_wakes.fetch_add(1, Ordering::Relaxed);
        self.waker.release(1);
    }

    fn ensure_helper(self: &Arc<Self>) {
        if self.helper_started.load(Ordering::Acquire) {
            return;
        }
        let mut slot = self.helper.lock();
        if self.helper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("softwheel-helper-{}", self.id))
            .spawn(move || helper_loop(worker));
        match spawned {
            Ok(handle) => {
                debug!(worker = self.id, "helper thread started");
                *slot = Some(handle);
            }
            Err(error) => {
                // Leave the work pending; the next inline dispatch picks it up.
                self.helper_started.store(false, Ordering::Release);
                debug!(worker = self.id, %error, "failed to spawn helper thread");
            }
        }
    }
}

fn helper_loop(worker: Arc<Worker>) {
    while !worker.shutdown.load(Ordering::Acquire) {
        if !worker.pending.is_empty() {
            worker.dispatch_pending();
            thread::yield_now();
            continue;
        }
        worker.waker.acquire_timeout(HELPER_PARK_TIMEOUT);
    }
    debug!(worker = worker.id, "helper thread exiting");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskClass {
    Hi,
    Normal,
}

/// Registers the built-in task vectors on `table`. Workers sharing the table
/// then honor `schedule` and `schedule_hi`.
pub fn install_task_vectors(table: &VectorTable) -> Result<(), RegisterError> {
    table.register(HI_TASK_VECTOR, "task-hi", |worker| {
        run_task_list(worker, TaskClass::Hi)
    })?;
    table.register(TASK_VECTOR, "task", |worker| {
        run_task_list(worker, TaskClass::Normal)
    })?;
    Ok(())
}

/// Runs one detached batch of scheduled tasks.
///
/// A task whose RUN guard is held elsewhere, or whose disable count is
/// nonzero, is pushed back and the vector re-raised so a later pass retries.
fn run_task_list(worker: &Arc<Worker>, class: TaskClass) {
    let (list, vector) = match class {
        TaskClass::Hi => (&worker.hi_run_list, HI_TASK_VECTOR),
        TaskClass::Normal => (&worker.run_list, TASK_VECTOR),
    };
    for task in list.take_all() {
        if task.try_lock_run() {
            if task.disable_depth() == 0 {
                let was_scheduled = task.clear_scheduled();
                debug_assert!(was_scheduled, "task on run list without SCHED");
                task.run();
                task.unlock_run();
                worker.stats.task_runs.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            task.unlock_run();
        }
        trace!(worker = worker.id, "task busy or disabled, requeueing");
        list.push(task);
        worker.stats.task_requeues.fetch_add(1, Ordering::Relaxed);
        worker.raise(vector);
    }
}

struct WorkerStats {
    dispatch_passes: AtomicU64,
    vector_runs: AtomicU64,
    restarts: AtomicU64,
    handoffs: AtomicU64,
    helper_wakes: AtomicU64,
    task_runs: AtomicU64,
    task_requeues: AtomicU64,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            dispatch_passes: AtomicU64::new(0),
            vector_runs: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            handoffs: AtomicU64::new(0),
            helper_wakes: AtomicU64::new(0),
            task_runs: AtomicU64::new(0),
            task_requeues: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            dispatch_passes: self.dispatch_passes.load(Ordering::Relaxed),
            vector_runs: self.vector_runs.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
            helper_wakes: self.helper_wakes.load(Ordering::Relaxed),
            task_runs: self.task_runs.load(Ordering::Relaxed),
            task_requeues: self.task_requeues.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub dispatch_passes: u64,
    pub vector_runs: u64,
    pub restarts: u64,
    pub handoffs: u64,
    pub helper_wakes: u64,
    pub task_runs: u64,
    pub task_requeues: u64,
}
