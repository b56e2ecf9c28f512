//! Actions: side effects selected by a planner and run outside the mutation.

use crate::error::{ActionError, EngineError};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, watch};

/// Future returned by a running [`Action`].
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send>>;

type ActionFn<S, Ev> = Box<dyn FnOnce(ActionContext<Ev>, S) -> ActionFuture + Send>;

/// A one-shot async side effect chosen by a [`Planner`](crate::Planner).
///
/// The engine runs it on its own task with a snapshot of the state as it was
/// committed by the cycle that selected it. While it runs, the entity keeps
/// accepting events but does not plan again.
///
/// # Example
///
/// ```
/// use evtsm_core::{Action, action_error};
///
/// #[derive(Clone)]
/// struct Deal {
///     amount: u64,
/// }
///
/// enum DealEvent {
///     Funded,
/// }
///
/// let fund = Action::new(|ctx, deal: Deal| async move {
///     if deal.amount == 0 {
///         return Err(action_error("nothing to fund"));
///     }
///     ctx.send(DealEvent::Funded).await?;
///     Ok(())
/// })
/// .named("fund");
/// assert_eq!(fund.name(), Some("fund"));
/// ```
pub struct Action<S, Ev> {
    name: Option<&'static str>,
    run: ActionFn<S, Ev>,
}

impl<S, Ev> Action<S, Ev> {
    /// Create an action from an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(ActionContext<Ev>, S) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        Self {
            name: None,
            run: Box::new(move |ctx, state| Box::pin(f(ctx, state))),
        }
    }

    /// Attach a label used in log output.
    #[must_use]
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Label attached with [`Action::named`], if any.
    #[must_use]
    pub const fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Consume the action and start it.
    pub fn run(self, ctx: ActionContext<Ev>, state: S) -> ActionFuture {
        (self.run)(ctx, state)
    }
}

impl<S, Ev> std::fmt::Debug for Action<S, Ev> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name {
            Some(name) => write!(f, "Action({name})"),
            None => write!(f, "Action(<fn>)"),
        }
    }
}

/// The only capabilities an [`Action`] gets from the engine.
///
/// `send` re-enters the mailbox of the entity that ran the action, which is
/// how an action triggers follow-up transitions. `closing` lets long-running
/// actions cooperate with `stop`.
pub struct ActionContext<Ev> {
    mailbox: mpsc::Sender<Ev>,
    closing: watch::Receiver<bool>,
}

impl<Ev> Clone for ActionContext<Ev> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            closing: self.closing.clone(),
        }
    }
}

impl<Ev> std::fmt::Debug for ActionContext<Ev> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("closing", &*self.closing.borrow())
            .finish_non_exhaustive()
    }
}

impl<Ev: Send> ActionContext<Ev> {
    /// Bind a context to an entity's mailbox and closing signal.
    ///
    /// The runtime creates one per dispatched action; tests can build their
    /// own to drive an action in isolation.
    #[must_use]
    pub const fn new(mailbox: mpsc::Sender<Ev>, closing: watch::Receiver<bool>) -> Self {
        Self { mailbox, closing }
    }

    /// Enqueue an event for the same entity.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Terminated`] once the engine is closing or closed.
    pub async fn send(&self, event: Ev) -> Result<(), EngineError> {
        if self.is_closing() {
            return Err(EngineError::Terminated);
        }
        self.mailbox
            .send(event)
            .await
            .map_err(|_| EngineError::Terminated)
    }

    /// Whether `stop` has been requested for the entity.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolve once `stop` has been requested (or the engine is gone).
    pub async fn closing(&self) {
        let mut closing = self.closing.clone();
        // Err means the engine dropped its sender, which counts as closing.
        let _ = closing.wait_for(|closing| *closing).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::action_error;

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        Ping(u32),
    }

    fn context(capacity: usize) -> (ActionContext<Ev>, mpsc::Receiver<Ev>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (closing_tx, closing_rx) = watch::channel(false);
        (ActionContext::new(tx, closing_rx), rx, closing_tx)
    }

    #[tokio::test]
    async fn action_runs_with_state_snapshot() {
        let (ctx, mut rx, _closing) = context(4);
        let action = Action::new(|ctx: ActionContext<Ev>, n: u32| async move {
            ctx.send(Ev::Ping(n * 2)).await?;
            Ok(())
        });

        action.run(ctx, 21).await.expect("action should succeed");
        assert_eq!(rx.recv().await, Some(Ev::Ping(42)));
    }

    #[tokio::test]
    async fn action_error_is_returned() {
        let (ctx, _rx, _closing) = context(1);
        let action: Action<(), Ev> = Action::new(|_ctx, ()| async { Err(action_error("boom")) });

        let err = action.run(ctx, ()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn send_fails_once_closing() {
        let (ctx, _rx, closing) = context(1);
        closing.send_replace(true);

        assert!(ctx.is_closing());
        assert!(matches!(
            ctx.send(Ev::Ping(1)).await,
            Err(EngineError::Terminated)
        ));
    }

    #[tokio::test]
    async fn send_fails_when_mailbox_dropped() {
        let (ctx, rx, _closing) = context(1);
        drop(rx);

        assert!(matches!(
            ctx.send(Ev::Ping(1)).await,
            Err(EngineError::Terminated)
        ));
    }

    #[test]
    fn closing_resolves_after_signal() {
        let (ctx, _rx, closing) = context(1);
        let mut waiter = tokio_test::task::spawn(ctx.closing());
        tokio_test::assert_pending!(waiter.poll());

        closing.send_replace(true);
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[test]
    fn closing_resolves_when_engine_is_gone() {
        let (ctx, _rx, closing) = context(1);
        let mut waiter = tokio_test::task::spawn(ctx.closing());
        tokio_test::assert_pending!(waiter.poll());

        drop(closing);
        tokio_test::assert_ready!(waiter.poll());
    }

    #[test]
    fn debug_shows_name() {
        let action: Action<(), Ev> = Action::new(|_ctx, ()| async { Ok(()) });
        assert_eq!(format!("{action:?}"), "Action(<fn>)");
        assert_eq!(format!("{:?}", action.named("notify")), "Action(notify)");
    }
}
