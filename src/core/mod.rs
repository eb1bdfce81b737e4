//! Core domain types for converge
//!
//! Module hierarchy follows type dependency order:
//! - time: WriteStamp, Clock (Layer 0)
//! - identity: CorrelationId, ServerId, TargetKey (Layer 1)
//! - record: MutationRecord state machine (Layer 2)
//! - store: RecordStore (Layer 3)
//! - snapshot: Canonical trait, SnapshotSlot (Layer 4)
//! - merge: reconcile - the core algorithm (Layer 5)

pub mod identity;
pub mod limits;
pub mod merge;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod time;

pub use identity::{CorrelationId, IdentityError, ServerId, TargetKey};
pub use limits::Limits;
pub use merge::{
    Matcher, MergeOutcome, MergedView, NoHeuristic, StaleSkip, ViewEntry, reconcile,
};
pub use record::{MutationRecord, MutationStatus, SubmitFailure, SubmitOk, TransitionError};
pub use snapshot::{Canonical, SnapshotSlot};
pub use store::RecordStore;
pub use time::{Clock, WriteStamp};
