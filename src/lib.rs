//! Low-level deferred-execution primitives: a per-worker soft-dispatch engine
//! and a two-tier expiry wheel.
//!
//! The dispatch side (signal, vector, task, worker) runs registered callback
//! vectors out of a pending bitmask with a bounded restart budget, handing
//! leftover work to a background helper thread. The timing side (wheel) batches
//! many short-lived timed entries into circular slot lists reaped by an
//! externally driven tick. The API surface is intentionally low-level so
//! higher-level schedulers can be built on top; callers own all task and entry
//! memory.

pub mod engine;
pub mod signal;
pub mod task;
pub mod vector;
pub mod waker;
pub mod wheel;
pub mod worker;

pub use engine::{Engine, EngineConfig};
pub use signal::{Pending, SetResult, VECTOR_CAPACITY};
pub use task::Task;
pub use vector::{
    RegisterError, VectorId, VectorTable, HI_TASK_VECTOR, TASK_VECTOR, TIMER_VECTOR,
};
pub use wheel::{
    ExpiryWheel, ScheduleError, TickOutcome, TickSource, TimedEntry, WheelConfig,
    WheelStatsSnapshot,
};
pub use worker::{
    install_task_vectors, DispatchOutcome, Worker, WorkerOptions, WorkerStatsSnapshot, MAX_RESTART,
};
