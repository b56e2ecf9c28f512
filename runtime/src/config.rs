//! Engine configuration.

use std::time::Duration;

/// What the engine does when an action fails or panics.
///
/// There is no retry: the failed action is never run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionFailurePolicy {
    /// Keep the guard held and stop planning for this entity.
    ///
    /// Events are still accepted and buffered. The entity stays stalled until
    /// [`Engine::force_unlock`](crate::Engine::force_unlock) or `stop`.
    #[default]
    Stall,

    /// Log the failure and release the guard as if the action had succeeded.
    Release,

    /// Log the failure and exit the execution loop, like a planner failure.
    Terminate,
}

/// Configuration for [`Engine`](crate::Engine) instances
///
/// # Example
///
/// ```
/// use evtsm_runtime::{ActionFailurePolicy, EngineConfig};
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_mailbox_capacity(128)
///     .with_action_failure_policy(ActionFailurePolicy::Release)
///     .with_stop_timeout(Duration::from_secs(5));
/// assert_eq!(config.mailbox_capacity, 128);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of events the mailbox buffers before `send` waits.
    pub mailbox_capacity: usize,
    /// Behaviour after a failed action.
    pub action_failure_policy: ActionFailurePolicy,
    /// Timeout used by group-wide shutdown when none is given.
    pub default_stop_timeout: Duration,
}

impl EngineConfig {
    /// Create a new configuration with custom values
    ///
    /// A `mailbox_capacity` of zero is raised to one.
    #[must_use]
    pub const fn new(
        mailbox_capacity: usize,
        action_failure_policy: ActionFailurePolicy,
        default_stop_timeout: Duration,
    ) -> Self {
        Self {
            mailbox_capacity: if mailbox_capacity == 0 { 1 } else { mailbox_capacity },
            action_failure_policy,
            default_stop_timeout,
        }
    }

    /// Set the mailbox capacity (minimum 1)
    #[must_use]
    pub const fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = if capacity == 0 { 1 } else { capacity };
        self
    }

    /// Set the action failure policy
    #[must_use]
    pub const fn with_action_failure_policy(mut self, policy: ActionFailurePolicy) -> Self {
        self.action_failure_policy = policy;
        self
    }

    /// Set the default stop timeout
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.default_stop_timeout = timeout;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 32,
            action_failure_policy: ActionFailurePolicy::default(),
            default_stop_timeout: Duration::from_secs(30),
        }
    }
}
