//! Layer 5: Reconciliation merge - the core algorithm.
//!
//! `reconcile` combines the latest canonical snapshot with outstanding
//! mutation records into the view the UI renders. Pure and deterministic:
//! same inputs, same output, no clocks, no I/O, no store mutation. Record
//! pruning is the caller's job, driven by the `satisfied` report.

use std::collections::BTreeMap;

use super::identity::{CorrelationId, ServerId, TargetKey};
use super::record::{MutationRecord, MutationStatus, SubmitFailure};
use super::snapshot::Canonical;
use super::time::WriteStamp;

/// Caller-supplied equality heuristic for matching a pending payload to a
/// canonical item when the backend echoes neither server id nor
/// correlation id in time (e.g. same author + same body + close
/// timestamp). Used for matching only, never for freshness decisions.
pub trait Matcher<P, T> {
    fn matches(&self, payload: &P, item: &T) -> bool;
}

/// Default matcher: no heuristic, rely on server ids and echoes alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHeuristic;

impl<P, T> Matcher<P, T> for NoHeuristic {
    fn matches(&self, _payload: &P, _item: &T) -> bool {
        false
    }
}

/// One entry of the merged view.
#[derive(Clone, Debug, PartialEq)]
pub enum ViewEntry<P, T> {
    /// Authoritative item, as polled.
    Canonical { item: T },
    /// Optimistic placeholder awaiting a submit result.
    Pending {
        correlation_id: CorrelationId,
        target: TargetKey,
        payload: P,
        created_at: WriteStamp,
        attempt: u32,
    },
    /// Submit failed; kept at its slot with the failure for the retry
    /// affordance. Never silently removed.
    Failed {
        correlation_id: CorrelationId,
        target: TargetKey,
        payload: P,
        created_at: WriteStamp,
        attempt: u32,
        failure: SubmitFailure,
    },
    /// Confirmed by the server but not yet observed in a snapshot (or
    /// guarding against a stale one); renders the server-echoed item.
    Confirmed {
        correlation_id: CorrelationId,
        target: TargetKey,
        server_id: ServerId,
        item: T,
        created_at: WriteStamp,
    },
}

impl<P, T> ViewEntry<P, T> {
    /// `None` for canonical entries.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            ViewEntry::Canonical { .. } => None,
            ViewEntry::Pending { correlation_id, .. }
            | ViewEntry::Failed { correlation_id, .. }
            | ViewEntry::Confirmed { correlation_id, .. } => Some(*correlation_id),
        }
    }

    pub fn is_optimistic(&self) -> bool {
        !matches!(self, ViewEntry::Canonical { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ViewEntry::Failed { .. })
    }
}

/// Ordered combination of canonical items and unresolved placeholders.
///
/// Invariants: no correlation id appears twice; no logical target is
/// represented by more than one visible entry.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedView<P, T> {
    entries: Vec<ViewEntry<P, T>>,
}

impl<P, T> MergedView<P, T> {
    pub fn entries(&self) -> &[ViewEntry<P, T>] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ViewEntry<P, T>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A canonical value discarded because local state is newer. Not an error;
/// traced by the engine so stale-poll decisions stay observable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleSkip {
    pub server_id: ServerId,
    pub target: TargetKey,
    pub canonical: WriteStamp,
    pub local: WriteStamp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergeOutcome<P, T> {
    pub view: MergedView<P, T>,
    /// Confirmed (or evidently-applied) records the snapshot now covers.
    /// The caller removes these from the store; the merger never does.
    pub satisfied: Vec<CorrelationId>,
    pub stale_skips: Vec<StaleSkip>,
}

/// Merge a canonical snapshot with mutation records.
///
/// Record handling:
/// - superseded records are invisible; only the newest attempt per target
///   is considered
/// - pending/failed records with no canonical correspondence become
///   placeholders; correspondence is checked by correlation echo first,
///   then the caller's matcher
/// - a placeholder for a single-slot resource replaces the slot's
///   canonical item instead of appearing beside it
/// - confirmed records are dropped in favor of the canonical item carrying
///   their server id, but only once the canonical freshness token has
///   caught up; a staler token keeps the locally-confirmed value visible
///   and reports a `StaleSkip`
pub fn reconcile<P, T, M>(
    snapshot: &[T],
    records: &[&MutationRecord<P, T>],
    matcher: &M,
) -> MergeOutcome<P, T>
where
    P: Clone,
    T: Canonical + Clone,
    M: Matcher<P, T>,
{
    let mut by_server: BTreeMap<ServerId, usize> = BTreeMap::new();
    let mut by_echo: BTreeMap<CorrelationId, usize> = BTreeMap::new();
    let mut by_slot: BTreeMap<TargetKey, usize> = BTreeMap::new();
    for (idx, item) in snapshot.iter().enumerate() {
        by_server.insert(item.server_id(), idx);
        if let Some(echo) = item.correlation() {
            by_echo.insert(echo, idx);
        }
        if let Some(slot) = item.target() {
            by_slot.insert(slot, idx);
        }
    }

    // Stable processing order regardless of how the caller collected refs.
    let mut ordered: Vec<&MutationRecord<P, T>> = records.to_vec();
    ordered.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.correlation_id.cmp(&b.correlation_id))
    });

    // At most one visible record per target: the newest attempt wins.
    let mut winner: BTreeMap<&TargetKey, CorrelationId> = BTreeMap::new();
    for rec in &ordered {
        if rec.is_superseded() {
            continue;
        }
        // ordered is ascending, so the last write per target is the newest
        winner.insert(&rec.target, rec.correlation_id);
    }

    let mut replacements: BTreeMap<usize, ViewEntry<P, T>> = BTreeMap::new();
    let mut placeholders: Vec<ViewEntry<P, T>> = Vec::new();
    let mut satisfied: Vec<CorrelationId> = Vec::new();
    let mut stale_skips: Vec<StaleSkip> = Vec::new();

    for rec in &ordered {
        if rec.is_superseded() {
            continue;
        }
        if winner.get(&rec.target) != Some(&rec.correlation_id) {
            continue;
        }

        match &rec.status {
            MutationStatus::Confirmed {
                server_id,
                item,
                freshness,
                ..
            } => {
                let entry = ViewEntry::Confirmed {
                    correlation_id: rec.correlation_id,
                    target: rec.target.clone(),
                    server_id: server_id.clone(),
                    item: item.clone(),
                    created_at: rec.created_at.clone(),
                };
                match by_server.get(server_id) {
                    // Freshness guard: canonical wins unless both sides
                    // carry a token and the canonical one is strictly
                    // older. A slow poll answering with pre-mutation state
                    // must not flicker the UI back.
                    Some(&idx) => match (snapshot[idx].freshness(), freshness) {
                        (Some(canonical), Some(local)) if canonical < *local => {
                            stale_skips.push(StaleSkip {
                                server_id: server_id.clone(),
                                target: rec.target.clone(),
                                canonical,
                                local: local.clone(),
                            });
                            replacements.insert(idx, entry);
                        }
                        _ => satisfied.push(rec.correlation_id),
                    },
                    None => match by_slot.get(&rec.target) {
                        // Slot resource republished under a different server
                        // id: the slot item is still the old value.
                        Some(&idx) => {
                            replacements.insert(idx, entry);
                        }
                        None => placeholders.push(entry),
                    },
                }
            }
            MutationStatus::Pending => {
                if by_echo.contains_key(&rec.correlation_id) {
                    // The canonical item *is* this mutation; the in-flight
                    // submit result becomes irrelevant and will be dropped
                    // by identity when it lands.
                    satisfied.push(rec.correlation_id);
                } else if snapshot.iter().any(|item| matcher.matches(&rec.payload, item)) {
                    // Heuristic correspondence hides the placeholder but is
                    // too weak to retire the record; the submit result will.
                } else {
                    let entry = ViewEntry::Pending {
                        correlation_id: rec.correlation_id,
                        target: rec.target.clone(),
                        payload: rec.payload.clone(),
                        created_at: rec.created_at.clone(),
                        attempt: rec.attempt,
                    };
                    match by_slot.get(&rec.target) {
                        Some(&idx) => {
                            replacements.insert(idx, entry);
                        }
                        None => placeholders.push(entry),
                    }
                }
            }
            MutationStatus::Failed { failure } => {
                let applied_anyway = by_echo.contains_key(&rec.correlation_id)
                    || snapshot.iter().any(|item| matcher.matches(&rec.payload, item));
                if applied_anyway {
                    // The submit "failed" (timeout, dropped response) but
                    // the mutation is canonically there. No result is in
                    // flight for a failed record, so retire it outright.
                    satisfied.push(rec.correlation_id);
                } else {
                    let entry = ViewEntry::Failed {
                        correlation_id: rec.correlation_id,
                        target: rec.target.clone(),
                        payload: rec.payload.clone(),
                        created_at: rec.created_at.clone(),
                        attempt: rec.attempt,
                        failure: failure.clone(),
                    };
                    match by_slot.get(&rec.target) {
                        Some(&idx) => {
                            replacements.insert(idx, entry);
                        }
                        None => placeholders.push(entry),
                    }
                }
            }
        }
    }

    let mut entries: Vec<ViewEntry<P, T>> = Vec::with_capacity(snapshot.len() + placeholders.len());
    for (idx, item) in snapshot.iter().enumerate() {
        match replacements.remove(&idx) {
            Some(entry) => entries.push(entry),
            None => entries.push(ViewEntry::Canonical { item: item.clone() }),
        }
    }
    entries.extend(placeholders);

    MergeOutcome {
        view: MergedView { entries },
        satisfied,
        stale_skips,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::{ServerId, TargetKey};
    use crate::core::record::{MutationRecord, SubmitOk};

    #[derive(Clone, Debug, PartialEq)]
    struct Item {
        id: String,
        body: String,
        echo: Option<CorrelationId>,
        token: Option<WriteStamp>,
        slot: Option<String>,
    }

    impl Item {
        fn new(id: &str, body: &str) -> Self {
            Self {
                id: id.to_string(),
                body: body.to_string(),
                echo: None,
                token: None,
                slot: None,
            }
        }

        fn with_echo(mut self, echo: CorrelationId) -> Self {
            self.echo = Some(echo);
            self
        }

        fn with_token(mut self, wall_ms: u64) -> Self {
            self.token = Some(WriteStamp::new(wall_ms, 0));
            self
        }

        fn with_slot(mut self, slot: &str) -> Self {
            self.slot = Some(slot.to_string());
            self
        }
    }

    impl Canonical for Item {
        fn server_id(&self) -> ServerId {
            ServerId::new(self.id.clone()).unwrap()
        }

        fn freshness(&self) -> Option<WriteStamp> {
            self.token.clone()
        }

        fn correlation(&self) -> Option<CorrelationId> {
            self.echo
        }

        fn target(&self) -> Option<TargetKey> {
            self.slot.as_ref().map(|s| TargetKey::parse(s.clone()).unwrap())
        }
    }

    /// Matches on equal body text.
    struct BodyMatcher;

    impl Matcher<String, Item> for BodyMatcher {
        fn matches(&self, payload: &String, item: &Item) -> bool {
            *payload == item.body
        }
    }

    fn pending(target: &str, payload: &str, wall_ms: u64) -> MutationRecord<String, Item> {
        MutationRecord::pending(
            CorrelationId::generate(),
            TargetKey::parse(target).unwrap(),
            payload.to_string(),
            WriteStamp::new(wall_ms, 0),
        )
    }

    fn confirmed(
        target: &str,
        payload: &str,
        wall_ms: u64,
        server_id: &str,
        item: Item,
        freshness: Option<u64>,
    ) -> MutationRecord<String, Item> {
        let mut rec = pending(target, payload, wall_ms);
        rec.confirm(
            SubmitOk {
                server_id: ServerId::new(server_id).unwrap(),
                item,
                freshness: freshness.map(|ms| WriteStamp::new(ms, 0)),
            },
            WriteStamp::new(wall_ms + 1, 0),
        )
        .unwrap();
        rec
    }

    fn failed(target: &str, payload: &str, wall_ms: u64) -> MutationRecord<String, Item> {
        let mut rec = pending(target, payload, wall_ms);
        rec.fail(SubmitFailure::clean("network error")).unwrap();
        rec
    }

    fn assert_no_duplicates(view: &MergedView<String, Item>) {
        let mut seen = std::collections::BTreeSet::new();
        for entry in view.iter() {
            if let Some(id) = entry.correlation_id() {
                assert!(seen.insert(id), "correlation id {id} appears twice");
            }
        }
    }

    #[test]
    fn pending_record_becomes_placeholder_on_empty_snapshot() {
        let rec = pending("msg:1", "hi", 100);
        let outcome = reconcile(&[], &[&rec], &NoHeuristic);

        assert_eq!(outcome.view.len(), 1);
        assert!(matches!(
            &outcome.view.entries()[0],
            ViewEntry::Pending { payload, .. } if payload == "hi"
        ));
        assert!(outcome.satisfied.is_empty());
    }

    #[test]
    fn confirmed_record_stays_until_snapshot_catches_up() {
        let rec = confirmed("msg:1", "hi", 100, "m42", Item::new("m42", "hi"), None);
        let outcome = reconcile(&[], &[&rec], &NoHeuristic);

        assert_eq!(outcome.view.len(), 1);
        assert!(matches!(
            &outcome.view.entries()[0],
            ViewEntry::Confirmed { server_id, .. } if server_id.as_str() == "m42"
        ));
        assert!(outcome.satisfied.is_empty());
    }

    #[test]
    fn confirmed_record_is_satisfied_once_server_id_appears() {
        let rec = confirmed("msg:1", "hi", 100, "m42", Item::new("m42", "hi"), None);
        let snapshot = vec![Item::new("m42", "hi")];
        let outcome = reconcile(&snapshot, &[&rec], &NoHeuristic);

        assert_eq!(outcome.view.len(), 1);
        assert!(matches!(
            &outcome.view.entries()[0],
            ViewEntry::Canonical { item } if item.id == "m42"
        ));
        assert_eq!(outcome.satisfied, vec![rec.correlation_id]);
        assert_no_duplicates(&outcome.view);
    }

    #[test]
    fn freshness_guard_keeps_newer_local_value() {
        let local_item = Item::new("profile:42", "new-banner.png")
            .with_token(200)
            .with_slot("profile:42:banner");
        let rec = confirmed(
            "profile:42:banner",
            "new-banner.png",
            100,
            "profile:42",
            local_item,
            Some(200),
        );
        // Slow poll still carries the pre-upload banner.
        let stale = Item::new("profile:42", "old-banner.png")
            .with_token(150)
            .with_slot("profile:42:banner");

        let outcome = reconcile(&[stale], &[&rec], &NoHeuristic);

        assert_eq!(outcome.view.len(), 1);
        assert!(matches!(
            &outcome.view.entries()[0],
            ViewEntry::Confirmed { item, .. } if item.body == "new-banner.png"
        ));
        assert!(outcome.satisfied.is_empty());
        assert_eq!(outcome.stale_skips.len(), 1);
        assert_eq!(outcome.stale_skips[0].canonical, WriteStamp::new(150, 0));
        assert_eq!(outcome.stale_skips[0].local, WriteStamp::new(200, 0));
    }

    #[test]
    fn equal_freshness_lets_canonical_win() {
        let local_item = Item::new("profile:42", "banner.png").with_token(200);
        let rec = confirmed(
            "profile:42:banner",
            "banner.png",
            100,
            "profile:42",
            local_item,
            Some(200),
        );
        let canonical = Item::new("profile:42", "banner.png").with_token(200);

        let outcome = reconcile(&[canonical], &[&rec], &NoHeuristic);

        assert_eq!(outcome.satisfied, vec![rec.correlation_id]);
        assert!(outcome.stale_skips.is_empty());
    }

    #[test]
    fn pending_slot_record_overlays_canonical_item() {
        let rec = pending("profile:42:banner", "uploading.png", 100);
        let canonical = Item::new("profile:42", "old.png").with_slot("profile:42:banner");

        let outcome = reconcile(&[canonical], &[&rec], &NoHeuristic);

        // One entry for the slot, the optimistic one.
        assert_eq!(outcome.view.len(), 1);
        assert!(matches!(
            &outcome.view.entries()[0],
            ViewEntry::Pending { payload, .. } if payload == "uploading.png"
        ));
    }

    #[test]
    fn superseded_record_never_affects_view() {
        let mut old = pending("profile:42:banner", "first.png", 100);
        let new = pending("profile:42:banner", "second.png", 200);
        old.superseded_by = Some(new.correlation_id);

        let outcome = reconcile(&[], &[&old, &new], &NoHeuristic);

        assert_eq!(outcome.view.len(), 1);
        assert!(matches!(
            &outcome.view.entries()[0],
            ViewEntry::Pending { payload, .. } if payload == "second.png"
        ));
        assert_no_duplicates(&outcome.view);
    }

    #[test]
    fn correlation_echo_satisfies_pending_record() {
        let rec = pending("msg:1", "hi", 100);
        let snapshot = vec![Item::new("m42", "hi").with_echo(rec.correlation_id)];

        let outcome = reconcile(&snapshot, &[&rec], &NoHeuristic);

        assert_eq!(outcome.view.len(), 1);
        assert!(!outcome.view.entries()[0].is_optimistic());
        assert_eq!(outcome.satisfied, vec![rec.correlation_id]);
    }

    #[test]
    fn heuristic_match_hides_pending_placeholder_without_retiring_it() {
        let rec = pending("msg:1", "hi", 100);
        let snapshot = vec![Item::new("m42", "hi")];

        let outcome = reconcile(&snapshot, &[&rec], &BodyMatcher);

        assert_eq!(outcome.view.len(), 1);
        assert!(!outcome.view.entries()[0].is_optimistic());
        // The submit result is still in flight; it retires the record.
        assert!(outcome.satisfied.is_empty());
    }

    #[test]
    fn heuristic_match_retires_failed_record() {
        let rec = failed("msg:1", "hi", 100);
        let snapshot = vec![Item::new("m42", "hi")];

        let outcome = reconcile(&snapshot, &[&rec], &BodyMatcher);

        assert_eq!(outcome.view.len(), 1);
        assert_eq!(outcome.satisfied, vec![rec.correlation_id]);
    }

    #[test]
    fn failed_placeholder_keeps_failure_details() {
        let rec = failed("msg:1", "hi", 100);
        let outcome = reconcile(&[], &[&rec], &NoHeuristic);

        match &outcome.view.entries()[0] {
            ViewEntry::Failed { failure, payload, .. } => {
                assert_eq!(failure.message, "network error");
                assert_eq!(payload, "hi");
            }
            other => panic!("expected failed entry, got {other:?}"),
        }
    }

    #[test]
    fn placeholders_order_by_created_at_after_canonical_base() {
        let later = pending("msg:2", "second", 300);
        let earlier = pending("msg:1", "first", 200);
        let snapshot = vec![Item::new("m1", "existing")];

        // Pass records out of order; reconcile sorts internally.
        let outcome = reconcile(&snapshot, &[&later, &earlier], &NoHeuristic);

        assert_eq!(outcome.view.len(), 3);
        assert!(matches!(&outcome.view.entries()[0], ViewEntry::Canonical { .. }));
        assert!(matches!(
            &outcome.view.entries()[1],
            ViewEntry::Pending { payload, .. } if payload == "first"
        ));
        assert!(matches!(
            &outcome.view.entries()[2],
            ViewEntry::Pending { payload, .. } if payload == "second"
        ));
    }

    #[test]
    fn merge_is_idempotent() {
        let rec_a = confirmed("msg:1", "hi", 100, "m42", Item::new("m42", "hi"), None);
        let rec_b = pending("msg:2", "there", 200);
        let snapshot = vec![Item::new("m41", "earlier"), Item::new("m42", "hi")];

        let first = reconcile(&snapshot, &[&rec_a, &rec_b], &NoHeuristic);
        let second = reconcile(&snapshot, &[&rec_a, &rec_b], &NoHeuristic);

        assert_eq!(first, second);
    }

    #[test]
    fn optimistic_and_canonical_never_coexist_for_one_correlation() {
        // Drive through a poll progression and check the invariant at
        // every step.
        let rec = confirmed("msg:1", "hi", 100, "m42", Item::new("m42", "hi"), None);

        for snapshot in [
            vec![],
            vec![Item::new("m41", "earlier")],
            vec![Item::new("m41", "earlier"), Item::new("m42", "hi")],
        ] {
            let outcome = reconcile(&snapshot, &[&rec], &NoHeuristic);
            assert_no_duplicates(&outcome.view);
            let optimistic = outcome
                .view
                .iter()
                .filter(|e| e.correlation_id() == Some(rec.correlation_id))
                .count();
            let canonical = outcome
                .view
                .iter()
                .filter(|e| matches!(e, ViewEntry::Canonical { item } if item.id == "m42"))
                .count();
            assert!(
                !(optimistic > 0 && canonical > 0),
                "placeholder and canonical both visible"
            );
            assert_eq!(optimistic + canonical, 1, "the mutation must stay visible");
        }
    }
}
