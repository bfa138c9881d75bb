//! Fault injection for store backends.
//!
//! [`FaultyBackend`] wraps a real backend and fails reads or writes on
//! demand, so tests can check what a sync cycle leaves behind when the store
//! goes away mid-cycle.

use heka_storage::{KvBackend, StorageError, StorageResult, WriteBatch};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A backend wrapper that fails on command.
pub struct FaultyBackend {
    inner: Arc<dyn KvBackend>,
    fail_after_writes: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    tripped: AtomicBool,
}

impl FaultyBackend {
    /// Wraps `inner` with no faults armed.
    pub fn new(inner: Arc<dyn KvBackend>) -> Self {
        Self {
            inner,
            fail_after_writes: AtomicUsize::new(usize::MAX),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            tripped: AtomicBool::new(false),
        }
    }

    /// Lets `n` more write batches through, then fails every write.
    pub fn fail_writes_after(&self, n: usize) {
        let done = self.writes.load(Ordering::SeqCst);
        self.fail_after_writes
            .store(done.saturating_add(n), Ordering::SeqCst);
    }

    /// Makes every read fail while set.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Disarms all faults.
    pub fn reset(&self) {
        self.fail_after_writes.store(usize::MAX, Ordering::SeqCst);
        self.fail_reads.store(false, Ordering::SeqCst);
        self.tripped.store(false, Ordering::SeqCst);
    }

    /// Whether any injected fault has fired since the last reset.
    pub fn has_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Write batches that reached the inner backend.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn read_fault(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            self.tripped.store(true, Ordering::SeqCst);
            return Err(simulated("read"));
        }
        Ok(())
    }
}

fn simulated(op: &str) -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("simulated {op} failure"),
    ))
}

impl KvBackend for FaultyBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.read_fault()?;
        self.inner.get(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        if self.writes.load(Ordering::SeqCst) >= self.fail_after_writes.load(Ordering::SeqCst) {
            self.tripped.store(true, Ordering::SeqCst);
            return Err(simulated("write"));
        }
        self.inner.write_batch(batch)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.read_fault()?;
        self.inner.keys_with_prefix(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heka_storage::InMemoryBackend;

    fn backend() -> FaultyBackend {
        FaultyBackend::new(Arc::new(InMemoryBackend::new()))
    }

    #[test]
    fn passes_through_when_disarmed() {
        let backend = backend();
        backend.put("a", b"1").unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.writes(), 1);
        assert!(!backend.has_tripped());
    }

    #[test]
    fn fails_writes_after_budget() {
        let backend = backend();
        backend.fail_writes_after(1);
        backend.put("a", b"1").unwrap();
        assert!(backend.put("b", b"2").is_err());
        assert!(backend.has_tripped());
        assert_eq!(backend.get("b").unwrap(), None);

        backend.reset();
        backend.put("b", b"2").unwrap();
        assert_eq!(backend.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn fails_reads_while_set() {
        let backend = backend();
        backend.put("a", b"1").unwrap();
        backend.set_fail_reads(true);
        assert!(backend.get("a").is_err());
        assert!(backend.keys_with_prefix("").is_err());
        backend.set_fail_reads(false);
        assert!(backend.get("a").is_ok());
    }
}
