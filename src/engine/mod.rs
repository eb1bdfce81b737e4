//! Engine shell: submit/poll orchestration around the pure core.

pub mod broadcast;
pub mod core;
pub mod runtime;
pub mod transport;

pub use broadcast::{
    BroadcastError, DropReason, StatusBroadcaster, StatusChange, StatusFilter, StatusPhase,
    StatusSubscription,
};
pub use self::core::{CompletionOutcome, EngineCore, EngineError, PollOutcome, SupersedeIntent};
pub use runtime::{EngineHandle, Runtime};
pub use transport::{PollFailure, Transport};
