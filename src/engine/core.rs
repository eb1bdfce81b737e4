//! The engine core: submit, complete, poll, retry, discard.
//!
//! Owns the record store, the canonical snapshot slot, and the clock.
//! Exactly one logical writer drives it (the runtime's engine thread, or a
//! test); readers get values out via `merged_view` and the status
//! broadcast. Every state-affecting event publishes a status change, so
//! subscribers re-render from the latest state rather than on a timer.

use thiserror::Error;

use crate::config::Config;
use crate::core::identity::{CorrelationId, TargetKey};
use crate::core::limits::Limits;
use crate::core::merge::{Matcher, MergedView, StaleSkip, reconcile};
use crate::core::record::{MutationRecord, MutationStatus, SubmitFailure, SubmitOk};
use crate::core::snapshot::{Canonical, SnapshotSlot};
use crate::core::store::RecordStore;
use crate::core::time::Clock;

use super::broadcast::{
    BroadcastError, StatusBroadcaster, StatusChange, StatusFilter, StatusPhase, StatusSubscription,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Caller bug: the operation is not legal for the record's status.
    #[error("record {correlation_id} is {found}, expected {expected}")]
    InvalidState {
        correlation_id: CorrelationId,
        found: &'static str,
        expected: &'static str,
    },

    #[error("unknown correlation id {0}")]
    UnknownCorrelation(CorrelationId),

    /// The target has a confirmed mutation still awaiting canonical
    /// observation; submitting over it needs an explicit replace intent.
    #[error("target {target} has a confirmed mutation awaiting reconciliation")]
    AwaitingReconciliation { target: TargetKey },

    #[error("tracked mutation limit reached ({max_tracked_records})")]
    Overloaded { max_tracked_records: usize },

    /// The runtime shut down and can no longer service calls.
    #[error("engine terminated")]
    Terminated,
}

/// What to do when the target already has an outstanding record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SupersedeIntent {
    /// Supersede unresolved (pending/failed) attempts silently; refuse to
    /// replace a confirmed value still awaiting reconciliation.
    #[default]
    UnresolvedOnly,
    /// Replace whatever is outstanding, confirmed or not.
    Replace,
}

/// How a submit completion was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionOutcome {
    Confirmed,
    Failed,
    /// Correlation id not in the store; result dropped.
    IgnoredUnknown,
    /// A newer attempt superseded this one; result dropped, record pruned.
    IgnoredSuperseded,
    /// The record was already resolved; duplicate result dropped.
    IgnoredResolved,
}

/// Result of applying one poll cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Applied {
        satisfied: Vec<CorrelationId>,
        stale_skips: Vec<StaleSkip>,
    },
    /// Snapshot exceeded `max_snapshot_items`; cycle skipped, prior state
    /// stays visible.
    SkippedOversize { items: usize, max: usize },
}

pub struct EngineCore<P, T, M> {
    store: RecordStore<P, T>,
    snapshot: SnapshotSlot<T>,
    clock: Clock,
    matcher: M,
    broadcaster: StatusBroadcaster,
    limits: Limits,
}

impl<P, T, M> EngineCore<P, T, M>
where
    P: Clone,
    T: Canonical + Clone,
    M: Matcher<P, T>,
{
    pub fn new(config: &Config, matcher: M) -> Self {
        Self {
            store: RecordStore::new(),
            snapshot: SnapshotSlot::new(),
            clock: Clock::new(),
            matcher,
            broadcaster: StatusBroadcaster::new(&config.limits),
            limits: config.limits.clone(),
        }
    }

    /// Create a pending record for `payload` on `target`.
    ///
    /// The optimistic placeholder is visible in `merged_view` as soon as
    /// this returns; the caller (runtime) then invokes the transport and
    /// feeds the result to `complete`.
    pub fn submit(
        &mut self,
        payload: P,
        target: TargetKey,
        intent: SupersedeIntent,
    ) -> Result<CorrelationId, EngineError> {
        if self.store.len() >= self.limits.max_tracked_records {
            tracing::warn!(
                max = self.limits.max_tracked_records,
                "mutation store full, rejecting submit"
            );
            return Err(EngineError::Overloaded {
                max_tracked_records: self.limits.max_tracked_records,
            });
        }

        let prior = self
            .store
            .active_for_target(&target)
            .map(|rec| (rec.correlation_id, Gate::of(rec)));

        let correlation_id = CorrelationId::generate();
        let mut supersedes = None;

        if let Some((prior_id, gate)) = prior {
            match gate {
                Gate::Pending => {
                    // Result of the old attempt will be discarded by
                    // identity when it arrives.
                    self.store.mark_superseded(&prior_id, correlation_id);
                    supersedes = Some(prior_id);
                }
                Gate::Failed => {
                    // Nothing in flight for a failed record; retire it now.
                    self.store.remove(&prior_id);
                    supersedes = Some(prior_id);
                }
                Gate::Confirmed => match intent {
                    SupersedeIntent::Replace => {
                        self.store.remove(&prior_id);
                        supersedes = Some(prior_id);
                    }
                    SupersedeIntent::UnresolvedOnly => {
                        return Err(EngineError::AwaitingReconciliation { target });
                    }
                },
            }
            self.publish(prior_id, target.clone(), StatusPhase::Superseded);
        }

        let created_at = self.clock.tick();
        let mut record = MutationRecord::pending(correlation_id, target.clone(), payload, created_at);
        record.supersedes = supersedes;
        self.store.upsert(record);

        tracing::debug!(%correlation_id, %target, "mutation submitted");
        self.publish(correlation_id, target, StatusPhase::Pending);
        Ok(correlation_id)
    }

    /// Apply the transport's result for one attempt.
    ///
    /// Results for unknown, superseded, or already-resolved records are
    /// dropped; ordering is decided by correlation identity, never by
    /// arrival order.
    pub fn complete(
        &mut self,
        correlation_id: CorrelationId,
        result: Result<SubmitOk<T>, SubmitFailure>,
    ) -> CompletionOutcome {
        match self.gate(&correlation_id) {
            Lookup::Unknown => {
                tracing::debug!(%correlation_id, "completion for unknown record dropped");
                return CompletionOutcome::IgnoredUnknown;
            }
            Lookup::Superseded => {
                self.store.remove(&correlation_id);
                tracing::debug!(%correlation_id, "completion for superseded record dropped");
                return CompletionOutcome::IgnoredSuperseded;
            }
            Lookup::Live => {}
        }

        match result {
            Ok(ok) => {
                if let Some(token) = &ok.freshness {
                    self.clock.receive(token);
                }
                let confirmed_at = self.clock.tick();
                let Some(record) = self.store.get_mut(&correlation_id) else {
                    return CompletionOutcome::IgnoredUnknown;
                };
                let target = record.target.clone();
                let server_id = ok.server_id.clone();
                match record.confirm(ok, confirmed_at) {
                    Ok(()) => {
                        tracing::debug!(%correlation_id, %server_id, "mutation confirmed");
                        self.publish(correlation_id, target, StatusPhase::Confirmed);
                        CompletionOutcome::Confirmed
                    }
                    Err(err) => {
                        tracing::warn!(%err, "duplicate completion dropped");
                        CompletionOutcome::IgnoredResolved
                    }
                }
            }
            Err(failure) => {
                let Some(record) = self.store.get_mut(&correlation_id) else {
                    return CompletionOutcome::IgnoredUnknown;
                };
                let target = record.target.clone();
                let message = failure.message.clone();
                match record.fail(failure) {
                    Ok(()) => {
                        tracing::debug!(%correlation_id, %message, "mutation failed");
                        self.publish(correlation_id, target, StatusPhase::Failed);
                        CompletionOutcome::Failed
                    }
                    Err(err) => {
                        tracing::warn!(%err, "duplicate completion dropped");
                        CompletionOutcome::IgnoredResolved
                    }
                }
            }
        }
    }

    /// Replace the canonical snapshot, reconcile, and prune records the
    /// snapshot now covers.
    pub fn apply_poll(&mut self, items: Vec<T>) -> PollOutcome {
        if items.len() > self.limits.max_snapshot_items {
            tracing::warn!(
                items = items.len(),
                max = self.limits.max_snapshot_items,
                "oversize snapshot, skipping poll cycle"
            );
            return PollOutcome::SkippedOversize {
                items: items.len(),
                max: self.limits.max_snapshot_items,
            };
        }

        for item in &items {
            if let Some(token) = item.freshness() {
                self.clock.receive(&token);
            }
        }
        let taken_at = self.clock.tick();
        self.snapshot.replace(items, taken_at);

        let outcome = {
            let records = self.store.list();
            reconcile(self.snapshot.items(), &records, &self.matcher)
        };

        for skip in &outcome.stale_skips {
            tracing::debug!(
                server_id = %skip.server_id,
                target = %skip.target,
                canonical_ms = skip.canonical.wall_ms,
                local_ms = skip.local.wall_ms,
                "stale canonical value skipped"
            );
        }

        for id in &outcome.satisfied {
            if let Some(record) = self.store.remove(id) {
                self.publish(*id, record.target, StatusPhase::Reconciled);
            }
        }

        PollOutcome::Applied {
            satisfied: outcome.satisfied,
            stale_skips: outcome.stale_skips,
        }
    }

    /// Resubmit a failed mutation with an unchanged payload.
    ///
    /// The old correlation id is retired permanently; the new record keeps
    /// the old `created_at` so the placeholder stays in its visual slot.
    pub fn retry(&mut self, correlation_id: CorrelationId) -> Result<CorrelationId, EngineError> {
        {
            let record = self
                .store
                .get(&correlation_id)
                .ok_or(EngineError::UnknownCorrelation(correlation_id))?;
            if !matches!(record.status, MutationStatus::Failed { .. }) {
                return Err(EngineError::InvalidState {
                    correlation_id,
                    found: record.status.name(),
                    expected: "failed",
                });
            }
        }
        let old = self
            .store
            .remove(&correlation_id)
            .expect("record exists; checked above");

        let new_id = CorrelationId::generate();
        let mut record =
            MutationRecord::pending(new_id, old.target.clone(), old.payload, old.created_at);
        record.attempt = old.attempt + 1;
        self.store.upsert(record);

        tracing::debug!(old = %correlation_id, new = %new_id, attempt = old.attempt + 1, "retrying mutation");
        self.publish(correlation_id, old.target.clone(), StatusPhase::Superseded);
        self.publish(new_id, old.target, StatusPhase::Pending);
        Ok(new_id)
    }

    /// Drop a failed mutation the user gave up on.
    pub fn discard(&mut self, correlation_id: CorrelationId) -> Result<(), EngineError> {
        {
            let record = self
                .store
                .get(&correlation_id)
                .ok_or(EngineError::UnknownCorrelation(correlation_id))?;
            if !matches!(record.status, MutationStatus::Failed { .. }) {
                return Err(EngineError::InvalidState {
                    correlation_id,
                    found: record.status.name(),
                    expected: "failed",
                });
            }
        }
        let record = self
            .store
            .remove(&correlation_id)
            .expect("record exists; checked above");
        self.publish(correlation_id, record.target, StatusPhase::Discarded);
        Ok(())
    }

    /// The view the UI renders: latest snapshot merged with outstanding
    /// records. Pure recompute; cheap enough to call per render.
    pub fn merged_view(&self) -> MergedView<P, T> {
        let records = self.store.list();
        reconcile(self.snapshot.items(), &records, &self.matcher).view
    }

    pub fn subscribe(&self, filter: StatusFilter) -> Result<StatusSubscription, BroadcastError> {
        self.broadcaster.subscribe(filter)
    }

    pub fn record(&self, correlation_id: &CorrelationId) -> Option<&MutationRecord<P, T>> {
        self.store.get(correlation_id)
    }

    pub fn tracked_records(&self) -> usize {
        self.store.len()
    }

    fn gate(&self, correlation_id: &CorrelationId) -> Lookup {
        match self.store.get(correlation_id) {
            None => Lookup::Unknown,
            Some(record) if record.is_superseded() => Lookup::Superseded,
            Some(_) => Lookup::Live,
        }
    }

    fn publish(&self, correlation_id: CorrelationId, target: TargetKey, phase: StatusPhase) {
        let change = StatusChange {
            correlation_id,
            target,
            phase,
        };
        if let Err(err) = self.broadcaster.publish(change) {
            tracing::warn!(%err, "status broadcast failed");
        }
    }
}

enum Lookup {
    Unknown,
    Superseded,
    Live,
}

enum Gate {
    Pending,
    Confirmed,
    Failed,
}

impl Gate {
    fn of<P, T>(record: &MutationRecord<P, T>) -> Self {
        match record.status {
            MutationStatus::Pending => Gate::Pending,
            MutationStatus::Confirmed { .. } => Gate::Confirmed,
            MutationStatus::Failed { .. } => Gate::Failed,
        }
    }
}
