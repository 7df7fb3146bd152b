use std::sync::Arc;
use std::sync::OnceLock;

use crate::signal::VECTOR_CAPACITY;
use crate::worker::Worker;

/// Identifies a dispatch vector slot, `0..VECTOR_CAPACITY`.
pub type VectorId = u8;

/// High-priority task vector. Lowest id so it runs first in a pass.
pub const HI_TASK_VECTOR: VectorId = 0;
/// Reserved for wheel backlog continuation.
pub const TIMER_VECTOR: VectorId = 1;
/// Normal task vector.
pub const TASK_VECTOR: VectorId = 2;

pub type VectorFn = dyn Fn(&Arc<Worker>) + Send + Sync;

pub(crate) struct VectorEntry {
    label: &'static str,
    handler: Box<VectorFn>,
}

impl VectorEntry {
    #[inline(always)]
    pub(crate) fn label(&self) -> &'static str {
        self.label
    }

    #[inline(always)]
    pub(crate) fn invoke(&self, worker: &Arc<Worker>) {
        (self.handler)(worker);
    }
}

/// Registry of dispatch vectors, shared by every worker.
///
/// Registration happens once at startup; entries are immutable afterwards, so
/// dispatch reads are lock-free.
pub struct VectorTable {
    entries: [OnceLock<VectorEntry>; VECTOR_CAPACITY],
}

impl VectorTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: std::array::from_fn(|_| OnceLock::new()),
        })
    }

    /// Registers `handler` on vector `id`. Must precede any raise of `id`.
    pub fn register<F>(
        &self,
        id: VectorId,
        label: &'static str,
        handler: F,
    ) -> Result<(), RegisterError>
    where
        F: Fn(&Arc<Worker>) + Send + Sync + 'static,
    {
        let Some(slot) = self.entries.get(id as usize) else {
            return Err(RegisterError::OutOfRange(id));
        };
        let entry = VectorEntry {
            label,
            handler: Box::new(handler),
        };
        slot.set(entry)
            .map_err(|_| RegisterError::AlreadyRegistered(id))
    }

    #[inline(always)]
    pub(crate) fn get(&self, id: VectorId) -> Option<&VectorEntry> {
        self.entries.get(id as usize).and_then(|slot| slot.get())
    }

    pub fn is_registered(&self, id: VectorId) -> bool {
        self.get(id).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// The vector slot already has a handler.
    #[error("vector {0} is already registered")]
    AlreadyRegistered(VectorId),
    /// The id does not fit the pending mask.
    #[error("vector {0} is out of range")]
    OutOfRange(VectorId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = VectorTable::new();
        table.register(4, "first", |_| {}).unwrap();
        assert_eq!(
            table.register(4, "second", |_| {}),
            Err(RegisterError::AlreadyRegistered(4))
        );
        assert!(table.is_registered(4));
    }

    #[test]
    fn out_of_range_is_rejected() {
        let table = VectorTable::new();
        assert_eq!(
            table.register(32, "nope", |_| {}),
            Err(RegisterError::OutOfRange(32))
        );
        assert!(!table.is_registered(32));
    }

    #[test]
    fn lookup_of_unregistered_vector_is_none() {
        let table = VectorTable::new();
        assert!(!table.is_registered(9));
    }
}
