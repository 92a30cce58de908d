//! Keyed per-volume lock records.
//!
//! Two instances of [`VolumeLocks`] exist per interception layer: one keyed
//! by volume id and one keyed by volume name. Records are created lazily on
//! first lookup and shared through `Arc`, so a reference stays valid for the
//! lifetime of the process.

use crate::trylock::{TryMutex, TryMutexGuard};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

/// Per-key lock record: the serial-access mutex plus the set of methods
/// whose last outcome on this key was a failure.
#[derive(Debug, Default)]
pub(crate) struct VolumeLock {
    serial: TryMutex,
    in_error: Mutex<HashSet<&'static str>>,
}

impl VolumeLock {
    /// Bounded-wait acquisition of the serial-access mutex.
    pub(crate) async fn try_lock(&self, timeout: Duration) -> Option<TryMutexGuard> {
        self.serial.try_lock(timeout).await
    }

    /// Whether `method` last failed on this key.
    pub(crate) fn method_in_error(&self, method: &str) -> bool {
        self.in_error.lock().contains(method)
    }

    /// Record the outcome of a completed procedure for `method`: a failure
    /// sets the mark, a success clears it. Only called while the serial
    /// mutex is held.
    pub(crate) fn record_outcome(&self, method: &'static str, failed: bool) {
        let mut in_error = self.in_error.lock();
        if failed {
            in_error.insert(method);
        } else {
            in_error.remove(method);
        }
    }
}

/// Lazily populated map from key to lock record.
///
/// The table never evicts: records and their in-error marks accumulate for
/// every distinct key observed since process start.
#[derive(Debug, Default)]
pub(crate) struct VolumeLocks {
    records: Mutex<HashMap<String, Arc<VolumeLock>>>,
}

impl VolumeLocks {
    /// The lock record for `key`, created on first use.
    /// The table mutex is held for the lookup only, never across the
    /// record's own mutex.
    pub(crate) fn get_or_create(&self, key: &str) -> Arc<VolumeLock> {
        let mut records = self.records.lock();
        match records.get(key) {
            Some(record) => record.clone(),
            None => {
                let record = Arc::new(VolumeLock::default());
                records.insert(key.to_string(), record.clone());
                record
            }
        }
    }
}
