//! Recycling allocator for record containers.
//!
//! High-throughput streaming allocates and drops one map per row. The pool
//! keeps cleared maps (with their table capacity) on a bounded free list so
//! sources can reuse them. Output never depends on whether a record came
//! from the pool.

use super::Record;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Default bound on the free list.
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

/// Thread-safe free list of cleared records.
#[derive(Debug)]
pub struct RecordPool {
    free: Mutex<Vec<Record>>,
    capacity: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

/// Counters describing pool effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordPoolStats {
    pub allocated: u64,
    pub reused: u64,
    pub idle: usize,
}

impl Default for RecordPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl RecordPool {
    /// Create a pool retaining at most `capacity` idle records.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Take a cleared record, allocating when the free list is empty.
    pub fn get(&self) -> Record {
        let recycled = self.lock_free().pop();
        match recycled {
            Some(record) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                record
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Record::new()
            }
        }
    }

    /// Clear a record and return it to the free list.
    pub fn put(&self, mut record: Record) {
        record.clear();
        let mut free = self.lock_free();
        if free.len() < self.capacity {
            free.push(record);
        }
    }

    /// Return a batch of records.
    pub fn put_all(&self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.put(record);
        }
    }

    pub fn stats(&self) -> RecordPoolStats {
        RecordPoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: self.lock_free().len(),
        }
    }

    // A panic while holding the lock leaves only cleared maps behind, so the
    // poisoned state is still usable.
    fn lock_free(&self) -> std::sync::MutexGuard<'_, Vec<Record>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }
}
