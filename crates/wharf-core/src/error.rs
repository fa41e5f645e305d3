//! Error kinds shared by every wharf crate.
//!
//! Mirrors the teacher framework's `SeesawError`/`Categorizable` split: one
//! enum covering every failure mode named in the design, plus a trait that
//! lets callers (the dispatcher, `Pool::wait`) ask "is this the kind of
//! error that resolves itself on the next poll, or is it permanent?"
//! without matching on variants by hand.

use thiserror::Error;

/// Every error a `wharf` component can surface.
#[derive(Debug, Error)]
pub enum WharfError {
    /// A network or transaction failure talking to the store. The gateway
    /// performs no retries of its own; the dispatcher retries on its next
    /// poll.
    #[error("store unavailable: {0}")]
    TransientStore(String),

    /// A job referenced a type name absent from the [`crate::registry::TypeRegistry`].
    #[error("unknown job type {0:?}")]
    UnknownType(String),

    /// The payload could not be decoded into the handler's argument type.
    #[error("failed to decode payload for job {job_id} (type {type_name:?}): {source}")]
    Decode {
        job_id: String,
        type_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The handler body returned an error.
    #[error("handler error: {0}")]
    HandlerError(String),

    /// The handler body panicked; the worker survived via a capturing
    /// boundary around the call.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// Synchronous misuse that changes no persistent state: starting a
    /// closed pool, registering a duplicate type name, etc.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// Another pool's heartbeat has gone stale; its in-flight jobs are
    /// being reclaimed via `purgeStalePool`.
    #[error("pool {0} is stale")]
    StalePool(String),
}

/// Classifies an error as something the caller should retry versus a
/// permanent, synchronous failure. Handler-facing errors
/// (`HandlerError`/`HandlerPanic`) are deliberately excluded: those are
/// never surfaced to `Pool::wait`, they're applied to the job's retry
/// budget instead.
pub trait Categorizable {
    /// True if a future attempt of the same operation might succeed
    /// without any corrective action (a transient store hiccup).
    fn is_transient(&self) -> bool;

    /// True if this error reflects caller misuse rather than a runtime
    /// condition (no persistent state was changed).
    fn is_misconfiguration(&self) -> bool;
}

impl Categorizable for WharfError {
    fn is_transient(&self) -> bool {
        matches!(self, WharfError::TransientStore(_) | WharfError::StalePool(_))
    }

    fn is_misconfiguration(&self) -> bool {
        matches!(self, WharfError::Misconfiguration(_))
    }
}

pub type WharfResult<T> = Result<T, WharfError>;
