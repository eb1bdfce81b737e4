//! Layer 2: Mutation records and their state machine.
//!
//! A MutationRecord tracks one optimistic mutation attempt from creation
//! to confirmation, failure, or supersession. Transitions are explicit and
//! only legal from `Pending`; illegal moves are typed errors, not panics.

use std::fmt;

use thiserror::Error;

use crate::error::{Effect, Transience};

use super::identity::{CorrelationId, ServerId, TargetKey};
use super::time::WriteStamp;

/// Successful result of the opaque submit call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitOk<T> {
    /// Canonical identity the server assigned.
    pub server_id: ServerId,
    /// The server's echo of the persisted item.
    pub item: T,
    /// Monotonic version token, when the backend provides one.
    pub freshness: Option<WriteStamp>,
}

/// Failed result of the opaque submit call.
///
/// Never thrown out of the engine: it flips the record to `Failed` and is
/// carried there for the retry affordance.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("submit failed: {message}")]
pub struct SubmitFailure {
    pub message: String,
    pub transience: Transience,
    pub effect: Effect,
}

impl SubmitFailure {
    /// Failure where the server definitely did nothing (e.g. connection refused).
    pub fn clean(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transience: Transience::Retryable,
            effect: Effect::None,
        }
    }

    /// Failure where side effects are unknown (e.g. timeout mid-request).
    pub fn murky(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transience: Transience::Unknown,
            effect: Effect::Unknown,
        }
    }

    /// Server rejected the payload; retry without changes will not help.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transience: Transience::Permanent,
            effect: Effect::None,
        }
    }
}

/// State of one mutation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationStatus<T> {
    /// Submitted, result not yet known. Placeholder rendered optimistically.
    Pending,
    /// Server accepted; awaiting observation in a canonical snapshot.
    Confirmed {
        server_id: ServerId,
        item: T,
        confirmed_at: WriteStamp,
        freshness: Option<WriteStamp>,
    },
    /// Submit rejected; payload retained for retry.
    Failed { failure: SubmitFailure },
}

impl<T> MutationStatus<T> {
    pub fn name(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Confirmed { .. } => "confirmed",
            MutationStatus::Failed { .. } => "failed",
        }
    }
}

impl<T> fmt::Display for MutationStatus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("record {correlation_id} is {from}, cannot transition to {to}")]
    Illegal {
        correlation_id: CorrelationId,
        from: &'static str,
        to: &'static str,
    },
}

/// One optimistic mutation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationRecord<P, T> {
    pub correlation_id: CorrelationId,
    pub target: TargetKey,
    /// Opaque to the engine; retained unchanged for retry.
    pub payload: P,
    /// Logical ordering key. A retry inherits it so the placeholder keeps
    /// its visual slot.
    pub created_at: WriteStamp,
    /// 1 for the first attempt, incremented by retry.
    pub attempt: u32,
    /// Earlier attempt on the same target this one replaced.
    pub supersedes: Option<CorrelationId>,
    /// Newer attempt that replaced this one. A superseded record's eventual
    /// result is discarded on arrival.
    pub superseded_by: Option<CorrelationId>,
    pub status: MutationStatus<T>,
}

impl<P, T> MutationRecord<P, T> {
    pub fn pending(
        correlation_id: CorrelationId,
        target: TargetKey,
        payload: P,
        created_at: WriteStamp,
    ) -> Self {
        Self {
            correlation_id,
            target,
            payload,
            created_at,
            attempt: 1,
            supersedes: None,
            superseded_by: None,
            status: MutationStatus::Pending,
        }
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }

    /// Unresolved = no submit result yet, or the result was a failure the
    /// user may still retry. Confirmed records are resolved even while they
    /// await canonical observation.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self.status,
            MutationStatus::Pending | MutationStatus::Failed { .. }
        )
    }

    /// Pending -> Confirmed.
    pub fn confirm(&mut self, ok: SubmitOk<T>, confirmed_at: WriteStamp) -> Result<(), TransitionError> {
        self.require_pending("confirmed")?;
        self.status = MutationStatus::Confirmed {
            server_id: ok.server_id,
            item: ok.item,
            confirmed_at,
            freshness: ok.freshness,
        };
        Ok(())
    }

    /// Pending -> Failed.
    pub fn fail(&mut self, failure: SubmitFailure) -> Result<(), TransitionError> {
        self.require_pending("failed")?;
        self.status = MutationStatus::Failed { failure };
        Ok(())
    }

    fn require_pending(&self, to: &'static str) -> Result<(), TransitionError> {
        if matches!(self.status, MutationStatus::Pending) {
            Ok(())
        } else {
            Err(TransitionError::Illegal {
                correlation_id: self.correlation_id,
                from: self.status.name(),
                to,
            })
        }
    }
}
