//! Ergonomic testing utilities for planners
//!
//! This module provides a fluent API for testing planners with readable Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // PlannerTest is the natural name

use evtsm_core::{PlanError, Planner, Step};

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Type alias for step assertion functions
type StepAssertion<S, Ev> = Box<dyn FnOnce(&Step<S, Ev>)>;

/// Fluent API for testing planners with Given-When-Then syntax
///
/// Runs one planning call the same way the engine does: the state handed to
/// assertions is the committed state, so after a [`PlanError::Failed`] it is
/// the untouched initial state.
///
/// # Example
///
/// ```
/// use evtsm_core::{planner_fn, Step};
/// use evtsm_testing::PlannerTest;
///
/// let planner = planner_fn(|events: &[u32], total: &mut u32| {
///     *total += events[0];
///     Ok(Step::consume(1))
/// });
///
/// PlannerTest::new(planner)
///     .given_state(10)
///     .when_events(vec![5, 6])
///     .then_consumed(1)
///     .then_state(|total| assert_eq!(*total, 15))
///     .run();
/// ```
pub struct PlannerTest<P: Planner> {
    planner: P,
    initial_state: Option<P::State>,
    events: Vec<P::Event>,
    expect_terminated: Option<bool>,
    expect_failed: bool,
    state_assertions: Vec<StateAssertion<P::State>>,
    step_assertions: Vec<StepAssertion<P::State, P::Event>>,
}

impl<P: Planner> PlannerTest<P> {
    /// Create a new planner test with the given planner
    #[must_use]
    pub const fn new(planner: P) -> Self {
        Self {
            planner,
            initial_state: None,
            events: Vec::new(),
            expect_terminated: None,
            expect_failed: false,
            state_assertions: Vec::new(),
            step_assertions: Vec::new(),
        }
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: P::State) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Set the pending batch to plan over (When)
    #[must_use]
    pub fn when_events(mut self, events: Vec<P::Event>) -> Self {
        self.events = events;
        self
    }

    /// Expect the planner to consume exactly `n` events (Then)
    #[must_use]
    pub fn then_consumed(self, n: usize) -> Self {
        self.then_step(move |step| {
            assert_eq!(step.consumed, n, "unexpected consumed count");
        })
    }

    /// Expect the step to schedule an action (Then)
    #[must_use]
    pub fn then_action(self) -> Self {
        self.then_step(|step| {
            assert!(step.action.is_some(), "expected an action, found none");
        })
    }

    /// Expect the step to schedule no action (Then)
    #[must_use]
    pub fn then_no_action(self) -> Self {
        self.then_step(|step| {
            assert!(
                step.action.is_none(),
                "expected no action, found {:?}",
                step.action
            );
        })
    }

    /// Expect the termination sentinel (Then)
    #[must_use]
    pub fn then_terminated(mut self) -> Self {
        self.expect_terminated = Some(true);
        self
    }

    /// Expect a planner failure (Then)
    #[must_use]
    pub fn then_failed(mut self) -> Self {
        self.expect_failed = true;
        self
    }

    /// Add an assertion about the resulting step (Then)
    #[must_use]
    pub fn then_step<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&Step<P::State, P::Event>) + 'static,
    {
        self.step_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the committed state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&P::State) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if the initial state or events are not set, if the outcome kind
    /// differs from the expectation, or if any assertion fails.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let initial = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        assert!(
            !self.events.is_empty(),
            "Events must be set with when_events(); the engine never plans an empty batch"
        );

        let mut state = initial.clone();
        let outcome = self.planner.plan(&self.events, &mut state);

        let committed = match outcome {
            Ok(step) => {
                assert!(
                    !self.expect_failed && self.expect_terminated != Some(true),
                    "expected the planner to stop, but it returned {step:?}"
                );
                assert!(
                    step.consumed <= self.events.len(),
                    "planner consumed {} of {} events",
                    step.consumed,
                    self.events.len()
                );
                for assertion in self.step_assertions {
                    assertion(&step);
                }
                state
            },
            Err(PlanError::Terminated) => {
                assert!(
                    self.expect_terminated == Some(true),
                    "planner returned the termination sentinel unexpectedly"
                );
                state
            },
            Err(PlanError::Failed(err)) => {
                assert!(self.expect_failed, "planner failed unexpectedly: {err}");
                initial
            },
        };

        for assertion in self.state_assertions {
            assertion(&committed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evtsm_core::{Action, planner_fn};

    #[derive(Clone, Debug, PartialEq)]
    struct Order {
        lines: Vec<&'static str>,
        shipped: bool,
    }

    #[derive(Clone, Debug)]
    enum OrderEvent {
        AddLine(&'static str),
        Ship,
        Cancel,
        Corrupt,
    }

    fn order_planner() -> impl Planner<State = Order, Event = OrderEvent> {
        planner_fn(|events: &[OrderEvent], order: &mut Order| {
            let mut consumed = 0;
            for event in events {
                match event {
                    OrderEvent::AddLine(line) => {
                        order.lines.push(*line);
                        consumed += 1;
                    },
                    OrderEvent::Ship => {
                        order.shipped = true;
                        return Ok(Step::then(
                            consumed + 1,
                            Action::new(|_ctx, _order: Order| async { Ok(()) }),
                        ));
                    },
                    OrderEvent::Cancel => return Err(PlanError::Terminated),
                    OrderEvent::Corrupt => {
                        order.lines.clear();
                        return Err(PlanError::failed("corrupt event"));
                    },
                }
            }
            Ok(Step::consume(consumed))
        })
    }

    fn empty_order() -> Order {
        Order {
            lines: vec![],
            shipped: false,
        }
    }

    #[test]
    fn batches_lines_then_ships() {
        PlannerTest::new(order_planner())
            .given_state(empty_order())
            .when_events(vec![
                OrderEvent::AddLine("a"),
                OrderEvent::AddLine("b"),
                OrderEvent::Ship,
                OrderEvent::AddLine("c"),
            ])
            .then_consumed(3)
            .then_action()
            .then_state(|order| {
                assert_eq!(order.lines, vec!["a", "b"]);
                assert!(order.shipped);
            })
            .run();
    }

    #[test]
    fn lines_only_schedule_nothing() {
        PlannerTest::new(order_planner())
            .given_state(empty_order())
            .when_events(vec![OrderEvent::AddLine("a")])
            .then_consumed(1)
            .then_no_action()
            .run();
    }

    #[test]
    fn cancel_terminates() {
        PlannerTest::new(order_planner())
            .given_state(empty_order())
            .when_events(vec![OrderEvent::Cancel])
            .then_terminated()
            .run();
    }

    #[test]
    fn failure_rolls_back_state() {
        let mut initial = empty_order();
        initial.lines.push("kept");

        PlannerTest::new(order_planner())
            .given_state(initial)
            .when_events(vec![OrderEvent::Corrupt])
            .then_failed()
            .then_state(|order| assert_eq!(order.lines, vec!["kept"]))
            .run();
    }

    #[test]
    #[should_panic(expected = "termination sentinel unexpectedly")]
    fn unexpected_termination_panics() {
        PlannerTest::new(order_planner())
            .given_state(empty_order())
            .when_events(vec![OrderEvent::Cancel])
            .run();
    }
}
