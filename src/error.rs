use thiserror::Error;

use crate::config::ConfigError;
use crate::core::identity::IdentityError;
use crate::engine::broadcast::BroadcastError;
use crate::engine::core::EngineError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
///
/// `Unknown` is the important case: a timed-out submit may or may not have
/// persisted, which is exactly why the engine never retries automatically.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            // Malformed ids and unparseable config need changed inputs.
            Error::Identity(_) | Error::Config(_) => Transience::Permanent,
            Error::Engine(e) => match e {
                EngineError::Overloaded { .. } => Transience::Retryable,
                EngineError::Terminated => Transience::Permanent,
                EngineError::InvalidState { .. }
                | EngineError::UnknownCorrelation(_)
                | EngineError::AwaitingReconciliation { .. } => Transience::Permanent,
            },
            Error::Broadcast(e) => match e {
                BroadcastError::SubscriberLimitReached { .. } => Transience::Retryable,
                BroadcastError::LockPoisoned => Transience::Permanent,
            },
        }
    }

    pub fn effect(&self) -> Effect {
        // Every rejection here happens before any state is touched.
        Effect::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::CorrelationId;

    #[test]
    fn overload_is_retryable() {
        let err = Error::from(EngineError::Overloaded {
            max_tracked_records: 4,
        });
        assert!(err.transience().is_retryable());
        assert_eq!(err.effect(), Effect::None);
    }

    #[test]
    fn contract_violations_are_permanent() {
        let err = Error::from(EngineError::UnknownCorrelation(CorrelationId::generate()));
        assert_eq!(err.transience(), Transience::Permanent);
    }
}
