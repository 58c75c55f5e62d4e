//! Tuning record caches.
//!
//! [`RecordCache`] keeps records for the lifetime of an executor, keyed by
//! operator identity. [`DiskRecordCache`] optionally persists JIT records
//! across processes, keyed by the operator signature, and is only used when a
//! cache directory is configured.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::PerfRecord;
use crate::error::Result;
use crate::graph::OpId;

#[derive(Default)]
pub struct RecordCache {
    records: Mutex<HashMap<OpId, Arc<PerfRecord>>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, op: OpId) -> Option<Arc<PerfRecord>> {
        self.records
            .lock()
            .expect("record cache poisoned")
            .get(&op)
            .cloned()
    }

    pub fn insert(&self, op: OpId, record: PerfRecord) -> Arc<PerfRecord> {
        let record = Arc::new(record);
        self.records
            .lock()
            .expect("record cache poisoned")
            .insert(op, Arc::clone(&record));
        record
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("record cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().expect("record cache poisoned").clear();
    }
}

pub struct DiskRecordCache {
    dir: PathBuf,
}

impl DiskRecordCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, signature: u64) -> PathBuf {
        self.dir.join(format!("record_{signature:016x}.bin"))
    }

    /// Returns the stored record for `signature`, ignoring files that fail to
    /// decode or belong to another signature.
    pub fn load(&self, signature: u64) -> Result<Option<PerfRecord>> {
        let path = self.path_for(signature);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let record: PerfRecord = match bincode::deserialize(&bytes) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "discarding unreadable tuning record");
                return Ok(None);
            }
        };
        match record.as_jit() {
            Some(jit) if jit.signature() == signature => {
                tracing::debug!(path = %path.display(), "tuning record loaded from disk");
                Ok(Some(record))
            }
            _ => {
                tracing::warn!(path = %path.display(), "discarding tuning record with mismatched signature");
                Ok(None)
            }
        }
    }

    /// Persists JIT records; other records carry no artifact and are skipped.
    pub fn store(&self, record: &PerfRecord) -> Result<()> {
        let Some(jit) = record.as_jit() else {
            return Ok(());
        };
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(jit.signature());
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, bincode::serialize(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::kernel::JitRecord;
    use crate::runtime::LaunchConfig;

    fn scratch_dir(tag: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("tunegraph_{tag}_{}_{stamp}", std::process::id()))
    }

    #[test]
    fn jit_record_persists_by_signature() {
        let dir = scratch_dir("disk_cache");
        let cache = DiskRecordCache::new(&dir);
        let record = PerfRecord::Jit(JitRecord::new(
            0xfeed,
            "mem_bound_1_kernel0",
            LaunchConfig::linear(1, 64),
            vec![1, 2, 3],
            "ok",
            0.25,
        ));
        cache.store(&record).unwrap();
        assert_eq!(cache.load(0xfeed).unwrap(), Some(record));
        assert_eq!(cache.load(0xbeef).unwrap(), None);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn mismatched_signature_on_disk_is_ignored() {
        let dir = scratch_dir("disk_cache_mismatch");
        let cache = DiskRecordCache::new(&dir);
        let record = PerfRecord::Jit(JitRecord::new(
            1,
            "k",
            LaunchConfig::linear(1, 1),
            Vec::new(),
            "",
            1.0,
        ));
        fs::create_dir_all(&dir).unwrap();
        fs::write(cache.path_for(2), bincode::serialize(&record).unwrap()).unwrap();
        assert_eq!(cache.load(2).unwrap(), None);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn timed_records_are_not_persisted() {
        let dir = scratch_dir("disk_cache_timed");
        let cache = DiskRecordCache::new(&dir);
        cache.store(&PerfRecord::Timed { time_ms: 1.0 }).unwrap();
        assert!(!dir.exists());
    }
}
