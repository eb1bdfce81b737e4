//! Layer 4: Canonical snapshots.
//!
//! The poll result slot. Replaced wholesale on every successful poll so the
//! merger always sees an internally-consistent canonical view; never
//! patched incrementally, never written by the mutation path.

use super::identity::{CorrelationId, ServerId, TargetKey};
use super::time::WriteStamp;

/// What the engine needs to know about a server item.
///
/// Implemented by the caller's canonical type (a chat message, a profile
/// record). Everything beyond identity and freshness stays opaque.
pub trait Canonical {
    /// Server-assigned identity.
    fn server_id(&self) -> ServerId;

    /// Monotonic version token, when the backend provides one. `None`
    /// means the backend has no version concept for this item and an
    /// observed canonical value always wins.
    fn freshness(&self) -> Option<WriteStamp> {
        None
    }

    /// Correlation id echoed by the server, when the backend round-trips
    /// client tokens. Identity-grade match for in-flight mutations.
    fn correlation(&self) -> Option<CorrelationId> {
        None
    }

    /// The logical slot this item occupies, for single-slot resources
    /// (a profile image). `None` for items that are their own identity
    /// (messages in a list).
    fn target(&self) -> Option<TargetKey> {
        None
    }
}

/// Latest canonical snapshot, with the stamp it was taken at.
pub struct SnapshotSlot<T> {
    items: Vec<T>,
    taken_at: Option<WriteStamp>,
}

impl<T> SnapshotSlot<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            taken_at: None,
        }
    }

    /// Full replacement. Two overlapping polls can never interleave
    /// partial state because there is no partial write.
    pub fn replace(&mut self, items: Vec<T>, taken_at: WriteStamp) {
        self.items = items;
        self.taken_at = Some(taken_at);
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// `None` until the first successful poll.
    pub fn taken_at(&self) -> Option<&WriteStamp> {
        self.taken_at.as_ref()
    }
}

impl<T> Default for SnapshotSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_is_wholesale() {
        let mut slot = SnapshotSlot::new();
        assert!(slot.taken_at().is_none());

        slot.replace(vec!["a", "b"], WriteStamp::new(100, 0));
        slot.replace(vec!["c"], WriteStamp::new(101, 0));

        assert_eq!(slot.items().to_vec(), vec!["c"]);
        assert_eq!(slot.taken_at(), Some(&WriteStamp::new(101, 0)));
    }
}
