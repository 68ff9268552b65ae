//! Error types for the isolate runtime.

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by isolate calls, closures and actions.
///
/// Errors are `Clone` because they travel through answer channels and are
/// re-raised in the scope that is blocked waiting for a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A scope-safety rule was violated: a scope-restricted reference was
    /// used from the wrong scope, an externally-owned closure was invoked
    /// without an active call frame, a completion argument was not callable,
    /// or `shutdown` was given a completion handler by an external caller.
    #[error("invalid access: {0}")]
    InvalidAccess(String),

    /// A deferred-result completion closure was invoked more than once.
    #[error("received multiple results for `{0}`")]
    MultipleResults(String),

    /// Invalid isolate configuration, detected at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cooperative cancellation was observed at an action checkpoint.
    /// Returning this from an action body is a quiet unwind, not a failure.
    #[error("action aborted")]
    Aborted,

    /// The answer channel closed before a terminal result arrived.
    /// This releases callers blocked on a never-resolved deferred call
    /// once the isolate shuts down.
    #[error("isolate has terminated")]
    Terminated,

    /// Failed to spawn an action thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    /// An application-level error raised by internal code or delivered
    /// through a `Value::Fault` payload.
    #[error("{0}")]
    Fault(String),
}

impl Error {
    /// Shorthand for an application-level error.
    pub fn fault(msg: impl Into<String>) -> Self {
        Error::Fault(msg.into())
    }
}
