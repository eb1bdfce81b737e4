//! Layer 1: Identity atoms
//!
//! CorrelationId: client-generated token matching a mutation to its result
//! ServerId: server-assigned canonical identity
//! TargetKey: name of the logical resource a mutation acts on

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid correlation id {raw:?}: {reason}")]
    Correlation { raw: String, reason: String },
    #[error("invalid server id {raw:?}: {reason}")]
    Server { raw: String, reason: String },
    #[error("invalid target key {raw:?}: {reason}")]
    Target { raw: String, reason: String },
}

/// Client-generated correlation token.
///
/// Stable for the lifetime of one mutation attempt; never reused. A retry
/// always gets a fresh id so in-flight results of retired attempts can be
/// discarded by identity alone.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh id. Only the engine should call this.
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|err| IdentityError::Correlation {
                raw: s.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned identity of a canonical item - non-empty string.
///
/// Whatever the backend uses (database id, storage key); opaque here.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(s: impl Into<String>) -> Result<Self, IdentityError> {
        let s = s.into();
        if s.is_empty() {
            Err(IdentityError::Server {
                raw: s,
                reason: "empty".into(),
            })
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({:?})", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of the logical resource a mutation acts on.
///
/// One key per mutable thing: a message slot ("msg:<draft id>"), a profile
/// image slot ("profile:42:banner"). Supersede chains are scoped by it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetKey(String);

impl TargetKey {
    /// Parse and validate a target key.
    ///
    /// Trimmed, non-empty, single line.
    pub fn parse(s: impl Into<String>) -> Result<Self, IdentityError> {
        let s = s.into().trim().to_string();
        if s.is_empty() {
            return Err(IdentityError::Target {
                raw: s,
                reason: "empty".into(),
            });
        }
        if s.contains('\n') || s.contains('\r') {
            return Err(IdentityError::Target {
                raw: s,
                reason: "cannot contain newlines".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TargetKey {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<TargetKey> for String {
    fn from(key: TargetKey) -> Self {
        key.0
    }
}

impl fmt::Debug for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetKey({:?})", self.0)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn correlation_id_round_trips_through_display() {
        let id = CorrelationId::generate();
        let parsed = CorrelationId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn server_id_rejects_empty() {
        assert!(ServerId::new("").is_err());
        assert!(ServerId::new("m42").is_ok());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ServerId::new("m42").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m42\"");

        let key = TargetKey::parse("profile:42:banner").unwrap();
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"profile:42:banner\"");
        let back: TargetKey = serde_json::from_str("\"profile:42:banner\"").unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn target_key_trims_and_validates() {
        let key = TargetKey::parse("  profile:42:banner  ").unwrap();
        assert_eq!(key.as_str(), "profile:42:banner");

        assert!(TargetKey::parse("   ").is_err());
        assert!(TargetKey::parse("a\nb").is_err());
    }
}
