//! Error types shared by the engine, its planners and its state stores.

use std::time::Duration;
use thiserror::Error;

/// Boxed, thread-safe error used at the planner, action and store seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error produced by an [`Action`](crate::Action).
///
/// Actions are user code, so any error type is accepted.
pub type ActionError = BoxError;

/// Build an [`ActionError`] from a message.
#[must_use]
pub fn action_error(message: impl Into<String>) -> ActionError {
    message.into().into()
}

/// Errors returned to callers of the engine's public API.
///
/// Planner and action failures are deliberately absent: they never reach the
/// caller of `send`, they are logged where they happen.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine has shut down, or shutdown is in progress.
    ///
    /// Returned by `send` once the closing signal has been raised or the
    /// execution loop has exited for any reason.
    #[error("normal shutdown of state machine")]
    Terminated,

    /// `stop` gave up waiting for the execution loop to exit.
    ///
    /// The loop may still be finishing an in-flight action.
    #[error("Stop timed out after {0:?} waiting for the execution loop to exit")]
    StopTimeout(Duration),

    /// The state store rejected an operation.
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// An engine for this entity is already running.
    #[error("Engine already running for entity {0}")]
    AlreadyRunning(String),

    /// No engine is running for this entity.
    #[error("No engine running for entity {0}")]
    NotRunning(String),
}

/// Outcome of a planner that did not produce a [`Step`](crate::Step).
#[derive(Error, Debug)]
pub enum PlanError {
    /// Termination sentinel.
    ///
    /// The planner asks for its entity's loop to end normally. The mutation
    /// made during this call is still committed.
    #[error("normal shutdown of state machine")]
    Terminated,

    /// The planner failed. The mutation is aborted and the loop fails stop.
    #[error("Planner failed: {0}")]
    Failed(#[source] BoxError),
}

impl PlanError {
    /// Wrap any error as a planner failure.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        Self::Failed(err.into())
    }

    /// Whether this is the termination sentinel.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// Errors that can occur during state store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No state is stored under this key.
    #[error("No state stored for entity {0}")]
    NotFound(String),

    /// `begin` was called for a key that already has state.
    #[error("State already exists for entity {0}")]
    AlreadyExists(String),

    /// The mutation callback failed; nothing was written.
    #[error("Mutation aborted: {0}")]
    Aborted(#[source] BoxError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}
