//! The planner: caller-supplied policy deciding each entity's next transition.

use crate::action::Action;
use crate::error::PlanError;
use std::marker::PhantomData;
use std::sync::Arc;

/// Result of one planning cycle.
///
/// `consumed` is the length of the prefix of the pending batch that this
/// cycle handled; the rest stays queued, in order, for the next cycle.
pub struct Step<S, Ev> {
    /// Side effect to run once the mutation is committed.
    pub action: Option<Action<S, Ev>>,
    /// Number of pending events handled by this cycle.
    pub consumed: usize,
}

impl<S, Ev> Step<S, Ev> {
    /// Consume `n` events without scheduling an action.
    #[must_use]
    pub const fn consume(n: usize) -> Self {
        Self {
            action: None,
            consumed: n,
        }
    }

    /// Consume `n` events and run `action` afterwards.
    #[must_use]
    pub const fn then(n: usize, action: Action<S, Ev>) -> Self {
        Self {
            action: Some(action),
            consumed: n,
        }
    }

    /// Consume nothing and do nothing; wait for more events.
    #[must_use]
    pub const fn idle() -> Self {
        Self::consume(0)
    }

    /// Whether this step neither consumed events nor scheduled an action.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.consumed == 0 && self.action.is_none()
    }
}

impl<S, Ev> std::fmt::Debug for Step<S, Ev> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("action", &self.action)
            .field("consumed", &self.consumed)
            .finish()
    }
}

/// Decides an entity's next transition from its pending events.
///
/// `plan` runs inside the state store's mutation callback: changes it makes
/// to `state` are committed when it returns `Ok` or
/// [`PlanError::Terminated`], and discarded on [`PlanError::Failed`].
///
/// The engine guarantees that `plan` is never called concurrently for the
/// same entity, that `events` is in arrival order, and that `events` is never
/// empty.
///
/// # Example
///
/// ```
/// use evtsm_core::{Planner, PlanError, Step};
///
/// struct Tally;
///
/// impl Planner for Tally {
///     type State = u64;
///     type Event = u64;
///
///     fn plan(&self, events: &[u64], total: &mut u64) -> Result<Step<u64, u64>, PlanError> {
///         *total += events.iter().sum::<u64>();
///         Ok(Step::consume(events.len()))
///     }
/// }
/// ```
pub trait Planner: Send + Sync + 'static {
    /// Entity state the planner transitions.
    type State: Clone + Send + Sync + 'static;

    /// Event payload delivered to the entity.
    type Event: Send + Sync + 'static;

    /// Plan the next transition.
    ///
    /// # Errors
    ///
    /// - [`PlanError::Terminated`] ends the entity's loop normally.
    /// - [`PlanError::Failed`] aborts the mutation and stops the loop.
    fn plan(
        &self,
        events: &[Self::Event],
        state: &mut Self::State,
    ) -> Result<Step<Self::State, Self::Event>, PlanError>;
}

impl<P: Planner> Planner for Arc<P> {
    type State = P::State;
    type Event = P::Event;

    fn plan(
        &self,
        events: &[Self::Event],
        state: &mut Self::State,
    ) -> Result<Step<Self::State, Self::Event>, PlanError> {
        (**self).plan(events, state)
    }
}

/// [`Planner`] backed by a closure. Built with [`planner_fn`].
pub struct PlannerFn<F, S, Ev> {
    f: F,
    _marker: PhantomData<fn() -> (S, Ev)>,
}

impl<F: Clone, S, Ev> Clone for PlannerFn<F, S, Ev> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            _marker: PhantomData,
        }
    }
}

/// Use a closure as a [`Planner`].
pub const fn planner_fn<S, Ev, F>(f: F) -> PlannerFn<F, S, Ev>
where
    F: Fn(&[Ev], &mut S) -> Result<Step<S, Ev>, PlanError>,
{
    PlannerFn {
        f,
        _marker: PhantomData,
    }
}

impl<F, S, Ev> Planner for PlannerFn<F, S, Ev>
where
    F: Fn(&[Ev], &mut S) -> Result<Step<S, Ev>, PlanError> + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
    Ev: Send + Sync + 'static,
{
    type State = S;
    type Event = Ev;

    fn plan(&self, events: &[Ev], state: &mut S) -> Result<Step<S, Ev>, PlanError> {
        (self.f)(events, state)
    }
}
