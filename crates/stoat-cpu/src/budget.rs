use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use stoat_core::{Error, Result};

// MemoryBudget — explicit, device-owned allocation accounting
//
// Each CpuDevice may carry a budget; every storage allocation reserves its
// bytes up front and releases them when the storage drops. Exceeding the
// budget is Error::OutOfMemory, which the trainer answers with adaptive
// batch splitting.
//
// There is deliberately no global allocator table: the budget lives on the
// device handle, is created by whoever constructs the device, and dies
// with it.

/// Byte budget shared by all storages of one device.
#[derive(Debug)]
pub struct MemoryBudget {
    label: String,
    limit: usize,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(label: impl Into<String>, limit: usize) -> Arc<Self> {
        Arc::new(MemoryBudget {
            label: label.into(),
            limit,
            used: AtomicUsize::new(0),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Reserve `bytes`, or fail with OutOfMemory when the budget would be
    /// exceeded. Compare-and-swap loop: concurrent reservations from
    /// several worker threads must not oversubscribe.
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.limit {
                return Err(Error::OutOfMemory {
                    device: self.label.clone(),
                    requested: bytes,
                    available: self.limit.saturating_sub(current),
                });
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => current = seen,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release() {
        let b = MemoryBudget::new("cpu:0", 100);
        b.reserve(60).unwrap();
        assert_eq!(b.used(), 60);
        assert!(b.reserve(60).is_err());
        b.release(60);
        b.reserve(100).unwrap();
    }

    #[test]
    fn oom_reports_availability() {
        let b = MemoryBudget::new("cpu:0", 10);
        b.reserve(4).unwrap();
        match b.reserve(8) {
            Err(Error::OutOfMemory {
                requested,
                available,
                ..
            }) => {
                assert_eq!(requested, 8);
                assert_eq!(available, 6);
            }
            other => panic!("expected OutOfMemory, got {other:?}"),
        }
    }
}
