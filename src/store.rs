//! Shared store of currently active alarms.
//!
//! Mutated by the message-bus subscriber, read by the control loop.
//! All mutations are linearizable under a single lock; `snapshot()` is a
//! defensive copy and never a torn read.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::AlarmRecord;

#[derive(Default)]
struct AlarmSet {
    records: HashMap<String, AlarmRecord>,
    /// Alarm-ids in arrival order
    order: Vec<String>,
}

/// Arrival-ordered map of alarm-id to record.
#[derive(Default)]
pub struct AlarmSetStore {
    inner: Mutex<AlarmSet>,
}

impl AlarmSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a record.
    ///
    /// An existing record keeps its arrival position and first-seen
    /// timestamp; only the payload fields are refreshed.
    pub fn upsert(&self, mut record: AlarmRecord) {
        let mut set = self.inner.lock().unwrap();
        match set.records.get(&record.id) {
            Some(existing) => {
                record.first_seen = existing.first_seen;
            }
            None => {
                set.order.push(record.id.clone());
            }
        }
        set.records.insert(record.id.clone(), record);
    }

    /// Remove a record, returning whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let mut set = self.inner.lock().unwrap();
        if set.records.remove(id).is_some() {
            set.order.retain(|entry| entry != id);
            true
        } else {
            false
        }
    }

    /// Defensive copy of the current alarm set, in arrival order.
    pub fn snapshot(&self) -> Vec<AlarmRecord> {
        let set = self.inner.lock().unwrap();
        set.order
            .iter()
            .filter_map(|id| set.records.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
