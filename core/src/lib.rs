//! # evtsm Core
//!
//! Core traits and types for evtsm, an engine that gives every entity its own
//! ordered, single-writer, crash-consistent execution loop.
//!
//! ## Core Concepts
//!
//! - **State**: Caller-defined entity state, owned by a [`StateStore`]
//! - **Event**: Caller-defined payload delivered to one entity's mailbox
//! - **Planner**: Pure decision function `(pending events, &mut state) → Step`
//! - **Step**: How many events were consumed, plus an optional [`Action`]
//! - **Action**: Side-effecting async work run outside the mutation, which may
//!   feed new events back through its [`ActionContext`]
//!
//! ## Data Flow
//!
//! ```text
//! send(event) ─► mailbox ─► pending batch ─► StateStore::mutate(Planner::plan)
//!                   ▲                                   │
//!                   │                                   ▼
//!                   └──────── ActionContext::send ◄── Action (spawned task)
//! ```
//!
//! The execution loop itself lives in `evtsm-runtime`.
//!
//! ## Example
//!
//! ```
//! use evtsm_core::{planner_fn, Action, PlanError, Step};
//!
//! #[derive(Clone, Default)]
//! struct Job {
//!     steps_done: u32,
//! }
//!
//! enum JobEvent {
//!     Advance,
//!     Finish,
//! }
//!
//! let planner = planner_fn(|events: &[JobEvent], job: &mut Job| {
//!     match events.first() {
//!         Some(JobEvent::Advance) => {
//!             job.steps_done += 1;
//!             Ok(Step::then(1, Action::new(|_ctx, _job: Job| async { Ok(()) })))
//!         },
//!         Some(JobEvent::Finish) => Err(PlanError::Terminated),
//!         None => Ok(Step::idle()),
//!     }
//! });
//! # let _ = planner;
//! ```

pub mod action;
pub mod error;
pub mod planner;
pub mod store;

pub use action::{Action, ActionContext, ActionFuture};
pub use error::{ActionError, BoxError, EngineError, PlanError, StoreError, action_error};
pub use planner::{Planner, PlannerFn, Step, planner_fn};
pub use store::{MutateFn, StateBackend, StateStore};
