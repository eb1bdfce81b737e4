//! The injected transport seam.
//!
//! The engine depends on exactly two opaque operations the surrounding
//! application provides: submit one mutation, poll the canonical
//! collection. HTTP clients, blob storage, SDKs all live behind this trait.

use thiserror::Error;

use crate::core::record::{SubmitFailure, SubmitOk};

/// A poll that did not produce a snapshot. Treated as "no update this
/// cycle", never as a fatal condition.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("poll failed: {message}")]
pub struct PollFailure {
    pub message: String,
}

impl PollFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The two opaque functions the application implements.
///
/// Both calls may block on network I/O; the runtime invokes them from
/// worker threads, never from the engine thread. Timeouts are the
/// transport's responsibility and surface as ordinary failures.
pub trait Transport<P, T>: Send + Sync {
    fn submit(&self, payload: &P) -> Result<SubmitOk<T>, SubmitFailure>;

    /// Full current canonical collection (or a single-item vec for
    /// slot-shaped resources). Must be side-effect-free on engine state.
    fn poll(&self) -> Result<Vec<T>, PollFailure>;
}
