use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

/// Task is linked on a worker's run list (or about to be).
pub(crate) const TASK_SCHED: u8 = 1 << 0;
/// Task's callback is executing on some worker. Doubles as the cross-worker
/// reentrancy guard: only the holder of this bit may run the callback.
pub(crate) const TASK_RUN: u8 = 1 << 1;

/// A unit of deferred work with a single-flight execution guarantee.
///
/// Created once by its owner, scheduled onto a worker arbitrarily many times.
/// Scheduling is idempotent while the task is pending, and the RUN bit keeps
/// two workers from executing the same task concurrently. The worker's run
/// list holds a strong reference for every pending schedule, so a task is
/// never dropped out from under an in-flight run.
pub struct Task {
    state: AtomicU8,
    disable_depth: AtomicU32,
    /// Intrusive link for the owning worker's run list. Meaningful only while
    /// SCHED is set and the task sits on a list.
    pub(crate) next: AtomicPtr<Task>,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl Task {
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            state: AtomicU8::new(0),
            disable_depth: AtomicU32::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            callback: Box::new(callback),
        })
    }

    /// Claims the SCHED bit. Returns false if the task was already pending.
    #[inline(always)]
    pub(crate) fn try_mark_scheduled(&self) -> bool {
        self.state.fetch_or(TASK_SCHED, Ordering::AcqRel) & TASK_SCHED == 0
    }

    /// Clears SCHED before the callback runs so the callback may re-arm
    /// itself. Returns whether the bit was set.
    #[inline(always)]
    pub(crate) fn clear_scheduled(&self) -> bool {
        self.state.fetch_and(!TASK_SCHED, Ordering::AcqRel) & TASK_SCHED != 0
    }

    #[inline(always)]
    pub fn is_scheduled(&self) -> bool {
        self.state.load(Ordering::Acquire) & TASK_SCHED != 0
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) & TASK_RUN != 0
    }

    #[inline(always)]
    pub(crate) fn try_lock_run(&self) -> bool {
        self.state.fetch_or(TASK_RUN, Ordering::AcqRel) & TASK_RUN == 0
    }

    #[inline(always)]
    pub(crate) fn unlock_run(&self) {
        self.state.fetch_and(!TASK_RUN, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn run(&self) {
        (self.callback)();
    }

    /// Increments the disable count and waits out any in-flight run. A
    /// disabled task stays pending but is skipped and re-queued by dispatch.
    pub fn disable(&self) {
        self.disable_depth.fetch_add(1, Ordering::AcqRel);
        while self.is_running() {
            std::hint::spin_loop();
        }
    }

    pub fn enable(&self) {
        let prev = self.disable_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "enable without matching disable");
    }

    #[inline(always)]
    pub fn disable_depth(&self) -> u32 {
        self.disable_depth.load(Ordering::Acquire)
    }

    /// Blocking cancel. Waits for any pending schedule to be consumed and any
    /// in-flight run to finish, then leaves the task idle.
    ///
    /// Must not be called from the task's own callback, and requires the
    /// owning worker to still be dispatching; a schedule parked on a stopped
    /// worker never drains and this call would spin forever.
    pub fn kill(&self) {
        // Claim SCHED from a clear state. While the claim is held, producers
        // see the task as pending and schedule() is a no-op.
        while self.state.fetch_or(TASK_SCHED, Ordering::AcqRel) & TASK_SCHED != 0 {
            while self.is_scheduled() {
                thread::yield_now();
            }
        }
        while self.is_running() {
            std::hint::spin_loop();
        }
        self.state.fetch_and(!TASK_SCHED, Ordering::Release);
    }
}

/// Lock-free intrusive LIFO list of scheduled tasks.
///
/// Push is a Treiber-stack insert so producers never block; the owning worker
/// detaches the whole list at once. LIFO drain order relative to scheduling
/// within one pass is load-bearing and covered by tests.
pub(crate) struct TaskStack {
    head: AtomicPtr<Task>,
}

impl TaskStack {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes a strong reference onto the list. The reference is reclaimed by
    /// the drain iterator (or by Drop at teardown).
    pub(crate) fn push(&self, task: Arc<Task>) {
        let node = Arc::into_raw(task) as *mut Task;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `node` came from Arc::into_raw above and is not yet
            // visible to any consumer, so the link store cannot race.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detaches the whole list. The iterator yields tasks newest-first.
    pub(crate) fn take_all(&self) -> TaskDrain {
        TaskDrain {
            cursor: self.head.swap(ptr::null_mut(), Ordering::AcqRel),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        // Release the strong references of anything still queued.
        for _task in self.take_all() {}
    }
}

// SAFETY: the stack only stores pointers produced by Arc::into_raw and every
// node is owned by exactly one list or drain iterator at a time.
unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

pub(crate) struct TaskDrain {
    cursor: *mut Task,
}

impl Iterator for TaskDrain {
    type Item = Arc<Task>;

    fn next(&mut self) -> Option<Arc<Task>> {
        if self.cursor.is_null() {
            return None;
        }
        // SAFETY: cursor was pushed via Arc::into_raw and the list is
        // detached, so this iterator is its sole owner.
        let task = unsafe { Arc::from_raw(self.cursor) };
        self.cursor = task.next.swap(ptr::null_mut(), Ordering::Relaxed);
        Some(task)
    }
}

impl Drop for TaskDrain {
    fn drop(&mut self) {
        while self.next().is_some() {}
    }
}

// SAFETY: same ownership argument as TaskStack; a drain is a detached list.
unsafe impl Send for TaskDrain {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_mark_is_idempotent() {
        let task = Task::new(|| {});
        assert!(task.try_mark_scheduled());
        assert!(!task.try_mark_scheduled());
        assert!(task.clear_scheduled());
        assert!(!task.clear_scheduled());
    }

    #[test]
    fn run_lock_excludes_second_owner() {
        let task = Task::new(|| {});
        assert!(task.try_lock_run());
        assert!(!task.try_lock_run());
        task.unlock_run();
        assert!(task.try_lock_run());
        task.unlock_run();
    }

    #[test]
    fn kill_on_idle_task_returns_immediately() {
        let task = Task::new(|| {});
        task.kill();
        assert!(!task.is_scheduled());
        assert!(!task.is_running());
    }

    #[test]
    fn disable_enable_tracks_depth() {
        let task = Task::new(|| {});
        task.disable();
        task.disable();
        assert_eq!(task.disable_depth(), 2);
        task.enable();
        assert_eq!(task.disable_depth(), 1);
        task.enable();
        assert_eq!(task.disable_depth(), 0);
    }

    #[test]
    fn stack_drains_lifo() {
        let stack = TaskStack::new();
        let a = Task::new(|| {});
        let b = Task::new(|| {});
        let c = Task::new(|| {});
        stack.push(a.clone());
        stack.push(b.clone());
        stack.push(c.clone());

        let drained: Vec<_> = stack.take_all().collect();
        assert_eq!(drained.len(), 3);
        assert!(Arc::ptr_eq(&drained[0], &c));
        assert!(Arc::ptr_eq(&drained[1], &b));
        assert!(Arc::ptr_eq(&drained[2], &a));
        assert!(stack.is_empty());
    }

    #[test]
    fn dropping_stack_releases_queued_tasks() {
        let a = Task::new(|| {});
        let b = Task::new(|| {});
        {
            let stack = TaskStack::new();
            stack.push(a.clone());
            stack.push(b.clone());
        }
        // The queued references were released by Drop.
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(Arc::strong_count(&b), 1);
    }
}
