#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::config::{Config, LogFormat, LoggingConfig, PollConfig};
pub use crate::core::{
    Canonical, Clock, CorrelationId, Limits, Matcher, MergeOutcome, MergedView, MutationRecord,
    MutationStatus, NoHeuristic, RecordStore, ServerId, SnapshotSlot, StaleSkip, SubmitFailure,
    SubmitOk, TargetKey, ViewEntry, WriteStamp, reconcile,
};
pub use crate::engine::{
    CompletionOutcome, EngineCore, EngineError, EngineHandle, PollFailure, PollOutcome, Runtime,
    StatusChange, StatusFilter, StatusPhase, StatusSubscription, SupersedeIntent, Transport,
};
