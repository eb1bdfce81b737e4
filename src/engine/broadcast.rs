//! Status change broadcaster.
//!
//! The `onStatusChange` affordance: spinners and error badges subscribe to
//! transitions of the records they care about. Bounded queues; a lagging
//! subscriber is dropped with a sticky reason rather than stalling the
//! engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;

use crate::core::identity::{CorrelationId, TargetKey};
use crate::core::limits::Limits;

/// Lifecycle points a subscriber can observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusPhase {
    /// Record created, optimistic placeholder visible.
    Pending,
    /// Submit succeeded; awaiting canonical observation.
    Confirmed,
    /// Submit failed; retry affordance active.
    Failed,
    /// A newer attempt on the same target replaced this record.
    Superseded,
    /// A canonical snapshot now covers this record; it has been pruned.
    Reconciled,
    /// The user gave up on a failed record.
    Discarded,
}

impl std::fmt::Display for StatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Failed => write!(f, "failed"),
            Self::Superseded => write!(f, "superseded"),
            Self::Reconciled => write!(f, "reconciled"),
            Self::Discarded => write!(f, "discarded"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub correlation_id: CorrelationId,
    pub target: TargetKey,
    pub phase: StatusPhase,
}

/// What a subscriber wants to hear about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Correlation(CorrelationId),
    Target(TargetKey),
}

impl StatusFilter {
    fn accepts(&self, change: &StatusChange) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Correlation(id) => change.correlation_id == *id,
            StatusFilter::Target(target) => change.target == *target,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    SubscriberLagged,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("subscriber limit reached ({max_subscribers})")]
    SubscriberLimitReached { max_subscribers: usize },
    #[error("broadcaster lock poisoned")]
    LockPoisoned,
}

#[derive(Debug)]
pub struct StatusSubscription {
    receiver: Receiver<StatusChange>,
    drop_reason: Arc<Mutex<Option<DropReason>>>,
}

impl StatusSubscription {
    pub fn recv(&self) -> Result<StatusChange, crossbeam::channel::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<StatusChange, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StatusChange, crossbeam::channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        self.drop_reason.lock().ok().and_then(|guard| *guard)
    }
}

#[derive(Clone)]
pub struct StatusBroadcaster {
    inner: Arc<Mutex<BroadcasterState>>,
}

impl StatusBroadcaster {
    pub fn new(limits: &Limits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BroadcasterState {
                max_subscribers: limits.max_status_subscribers,
                queue_max_events: limits.status_queue_max_events,
                next_subscriber_id: 1,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self, filter: StatusFilter) -> Result<StatusSubscription, BroadcastError> {
        let mut state = self.lock_state()?;
        if state.subscribers.len() >= state.max_subscribers {
            return Err(BroadcastError::SubscriberLimitReached {
                max_subscribers: state.max_subscribers,
            });
        }

        let (sender, receiver) = crossbeam::channel::bounded(state.queue_max_events);
        let drop_reason = Arc::new(Mutex::new(None));
        let id = state.next_subscriber_id;
        state.next_subscriber_id = state.next_subscriber_id.saturating_add(1);
        state.subscribers.insert(
            id,
            SubscriberState {
                sender,
                filter,
                drop_reason: Arc::clone(&drop_reason),
            },
        );

        Ok(StatusSubscription {
            receiver,
            drop_reason,
        })
    }

    pub fn publish(&self, change: StatusChange) -> Result<(), BroadcastError> {
        let mut state = self.lock_state()?;

        let mut dropped = Vec::new();
        for (id, subscriber) in &state.subscribers {
            if !subscriber.filter.accepts(&change) {
                continue;
            }
            match subscriber.sender.try_send(change.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    subscriber.set_drop_reason(DropReason::SubscriberLagged);
                    dropped.push(*id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            state.subscribers.remove(&id);
        }

        Ok(())
    }

    pub fn subscriber_count(&self) -> Result<usize, BroadcastError> {
        let state = self.lock_state()?;
        Ok(state.subscribers.len())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, BroadcasterState>, BroadcastError> {
        self.inner.lock().map_err(|_| BroadcastError::LockPoisoned)
    }
}

struct BroadcasterState {
    max_subscribers: usize,
    queue_max_events: usize,
    next_subscriber_id: u64,
    subscribers: BTreeMap<u64, SubscriberState>,
}

struct SubscriberState {
    sender: Sender<StatusChange>,
    filter: StatusFilter,
    drop_reason: Arc<Mutex<Option<DropReason>>>,
}

impl SubscriberState {
    fn set_drop_reason(&self, reason: DropReason) {
        if let Ok(mut guard) = self.drop_reason.lock()
            && guard.is_none()
        {
            *guard = Some(reason);
        }
    }
}
