//! Layer 3: The mutation record store.
//!
//! Exclusive owner of MutationRecords. Single writer per correlation id
//! (the engine core); any number of readers (merger, UI). Enforced at the
//! type level by `&mut self` on every mutating method.
//!
//! In-memory only. Callers that want persistence across reloads snapshot
//! `list()` and re-upsert on startup.

use std::collections::BTreeMap;

use super::identity::{CorrelationId, TargetKey};
use super::record::MutationRecord;

pub struct RecordStore<P, T> {
    records: BTreeMap<CorrelationId, MutationRecord<P, T>>,
}

impl<P, T> RecordStore<P, T> {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    pub fn upsert(&mut self, record: MutationRecord<P, T>) {
        self.records.insert(record.correlation_id, record);
    }

    pub fn get(&self, id: &CorrelationId) -> Option<&MutationRecord<P, T>> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &CorrelationId) -> Option<&mut MutationRecord<P, T>> {
        self.records.get_mut(id)
    }

    pub fn remove(&mut self, id: &CorrelationId) -> Option<MutationRecord<P, T>> {
        self.records.remove(id)
    }

    /// All records in stable `(created_at, correlation_id)` order.
    ///
    /// This is the order the merger splices placeholders in, so it must be
    /// deterministic across calls with unchanged contents.
    pub fn list(&self) -> Vec<&MutationRecord<P, T>> {
        let mut records: Vec<&MutationRecord<P, T>> = self.records.values().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.correlation_id.cmp(&b.correlation_id))
        });
        records
    }

    /// Newest non-superseded record for a target, if any.
    ///
    /// At most one should exist by construction; ties break on correlation
    /// id for determinism.
    pub fn active_for_target(&self, target: &TargetKey) -> Option<&MutationRecord<P, T>> {
        self.records
            .values()
            .filter(|rec| !rec.is_superseded() && rec.target == *target)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.correlation_id.cmp(&b.correlation_id))
            })
    }

    /// Link an old attempt to the newer one replacing it. The old record
    /// stays in the store until its in-flight result arrives and is
    /// discarded by identity.
    pub fn mark_superseded(&mut self, old: &CorrelationId, new: CorrelationId) -> bool {
        match self.records.get_mut(old) {
            Some(record) => {
                record.superseded_by = Some(new);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<P, T> Default for RecordStore<P, T> {
    fn default() -> Self {
        Self::new()
    }
}
