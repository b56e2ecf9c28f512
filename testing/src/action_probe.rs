//! Run a single [`Action`] outside the engine and capture what it sends.

use evtsm_core::{Action, ActionContext, ActionError};
use tokio::sync::{mpsc, watch};

/// Harness for driving an action in isolation.
///
/// Events the action sends through its context are buffered and returned
/// by [`ActionProbe::run`]. [`ActionProbe::closing`] simulates a `stop`
/// request that arrived before the action started.
///
/// # Example
///
/// ```
/// use evtsm_core::Action;
/// use evtsm_testing::ActionProbe;
///
/// # async fn example() {
/// let action = Action::new(|ctx, n: u32| async move {
///     ctx.send(n + 1).await?;
///     Ok(())
/// });
///
/// let (result, sent) = ActionProbe::new().run(action, 41).await;
/// assert!(result.is_ok());
/// assert_eq!(sent, vec![42]);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ActionProbe {
    capacity: usize,
    closing: bool,
}

impl Default for ActionProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionProbe {
    /// Create a probe with room for 64 sent events
    #[must_use]
    pub const fn new() -> Self {
        Self {
            capacity: 64,
            closing: false,
        }
    }

    /// Set how many events the probe buffers before the action's `send` waits
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = if capacity == 0 { 1 } else { capacity };
        self
    }

    /// Start the action with the closing signal already raised
    #[must_use]
    pub const fn closing(mut self) -> Self {
        self.closing = true;
        self
    }

    /// Run `action` with `state` and return its result plus every event it sent
    pub async fn run<S, Ev: Send>(
        &self,
        action: Action<S, Ev>,
        state: S,
    ) -> (Result<(), ActionError>, Vec<Ev>) {
        let (tx, mut rx) = mpsc::channel(self.capacity);
        let (_closing_tx, closing_rx) = watch::channel(self.closing);

        let result = action.run(ActionContext::new(tx, closing_rx), state).await;

        let mut sent = Vec::new();
        while let Ok(event) = rx.try_recv() {
            sent.push(event);
        }
        (result, sent)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use evtsm_core::EngineError;

    #[tokio::test]
    async fn captures_sent_events_in_order() {
        let action = Action::new(|ctx, start: u8| async move {
            for n in start..start + 3 {
                ctx.send(n).await?;
            }
            Ok(())
        });

        let (result, sent) = ActionProbe::new().run(action, 5).await;
        result.unwrap();
        assert_eq!(sent, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn closing_probe_refuses_sends() {
        let action = Action::new(|ctx, ()| async move {
            match ctx.send(1u8).await {
                Err(EngineError::Terminated) => Ok(()),
                other => Err(format!("unexpected send result: {other:?}").into()),
            }
        });

        let (result, sent) = ActionProbe::new().closing().run(action, ()).await;
        result.unwrap();
        assert!(sent.is_empty());
    }
}
