use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::vector::{VectorTable, TIMER_VECTOR};
use crate::wheel::{ExpiryWheel, TickOutcome, TickSource, WheelConfig};
use crate::worker::{install_task_vectors, Worker, WorkerOptions};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Dispatch workers to create, one per conceptual CPU.
    pub workers: usize,
    /// Whether workers may spawn background helper threads.
    pub helpers: bool,
    pub wheel: WheelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            helpers: true,
            wheel: WheelConfig::default(),
        }
    }
}

/// Facade tying the dispatch workers and the expiry wheel together.
///
/// The engine installs the built-in task vectors plus a reserved timer vector
/// whose handler finishes quota-limited wheel reaps, and enforces the
/// shutdown order: quiesce every worker first, then force-expire the wheel,
/// so a late expiry callback can never schedule onto a stopped worker.
pub struct Engine {
    table: Arc<VectorTable>,
    workers: Vec<Arc<Worker>>,
    wheel: Arc<ExpiryWheel>,
    stopped: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_tick_source(config, None)
    }

    pub fn with_tick_source(
        config: EngineConfig,
        tick_source: Option<Arc<dyn TickSource>>,
    ) -> Self {
        assert!(config.workers >= 1, "engine needs at least one worker");

        let table = VectorTable::new();
        install_task_vectors(&table).expect("task vectors registered on fresh table");

        let wheel = Arc::new(match tick_source {
            Some(source) => ExpiryWheel::with_tick_source(config.wheel, source),
            None => ExpiryWheel::new(config.wheel),
        });
        {
            let wheel = wheel.clone();
            table
                .register(TIMER_VECTOR, "timer", move |worker| {
                    let outcome = wheel.reap_backlog();
                    if outcome.backlog {
                        worker.raise(TIMER_VECTOR);
                    }
                })
                .expect("timer vector registered on fresh table");
        }

        let options = WorkerOptions {
            helper: config.helpers,
        };
        let workers = (0..config.workers)
            .map(|id| Worker::with_options(id as u32, table.clone(), options))
            .collect();

        Self {
            table,
            workers,
            wheel,
            stopped: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn table(&self) -> &Arc<VectorTable> {
        &self.table
    }

    #[inline(always)]
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    #[inline(always)]
    pub fn worker(&self, index: usize) -> &Arc<Worker> {
        &self.workers[index]
    }

    #[inline(always)]
    pub fn wheel(&self) -> &Arc<ExpiryWheel> {
        &self.wheel
    }

    /// Drives the wheel one tick. A quota-limited reap hands its remainder to
    /// worker 0 through the timer vector instead of waiting for the next tick.
    pub fn tick(&self) -> TickOutcome {
        let outcome = self.wheel.tick();
        if outcome.backlog {
            self.workers[0].raise(TIMER_VECTOR);
        }
        outcome
    }

    /// Drains and stops everything. Workers are quiesced before the wheel is
    /// force-expired. Idempotent; also invoked by Drop.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("engine shutdown: quiescing workers");
        for worker in &self.workers {
            worker.stop();
        }
        debug!("engine shutdown: force-expiring wheel");
        self.wheel.force_expire_all();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::wheel::TimedEntry;

    fn inline_engine(wheel: WheelConfig) -> Engine {
        Engine::new(EngineConfig {
            workers: 1,
            helpers: false,
            wheel,
        })
    }

    #[test]
    fn builtin_vectors_are_reserved() {
        let engine = inline_engine(WheelConfig::default());
        assert!(engine.table().is_registered(crate::vector::HI_TASK_VECTOR));
        assert!(engine.table().is_registered(TIMER_VECTOR));
        assert!(engine.table().is_registered(crate::vector::TASK_VECTOR));
    }

    #[test]
    fn backlog_is_finished_by_timer_vector() {
        let engine = inline_engine(WheelConfig {
            fine_slots: 8,
            coarse_slots: 8,
            reap_quota: 2,
            start_tick: 0,
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let entries: Vec<_> = (0..7)
            .map(|_| {
                let counter = counter.clone();
                TimedEntry::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for entry in &entries {
            engine.wheel().schedule(entry, 1).unwrap();
        }

        let outcome = engine.tick();
        assert_eq!(outcome.fired, 2);
        assert!(outcome.backlog);

        // The raised timer vector finishes the slot over dispatch passes.
        engine.worker(0).dispatch_pending();
        assert_eq!(counter.load(Ordering::Relaxed), 7);
        assert!(engine.wheel().is_empty());
    }

    #[test]
    fn shutdown_force_expires_pending_entries() {
        let engine = inline_engine(WheelConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let entry = {
            let counter = counter.clone();
            TimedEntry::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
        };
        engine.wheel().schedule(&entry, 1000).unwrap();

        engine.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        // Idempotent.
        engine.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
