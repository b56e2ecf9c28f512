//! The per-entity execution loop.
//!
//! An [`Engine`] owns one entity's mailbox and runs a single task that:
//!
//! 1. Collects events from the mailbox into an ordered pending batch
//! 2. Plans over the batch inside one atomic [`StateStore::mutate`] call
//! 3. Drops the consumed prefix and, if the planner chose one, dispatches
//!    the [`Action`] on its own task
//! 4. Holds the guard until that action completes, then plans again
//!
//! Planning never overlaps for one entity: the guard is a plain value owned
//! by the loop task, so there is nothing to race on.

use crate::config::{ActionFailurePolicy, EngineConfig};
use crate::metrics::EngineMetrics;
use evtsm_core::{
    Action, ActionContext, ActionError, EngineError, PlanError, Planner, StateStore, Step,
    StoreError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Coarse lifecycle state of an [`Engine`], as seen from outside the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The loop is accepting and planning events.
    Running,
    /// An action failed under [`ActionFailurePolicy::Stall`].
    ///
    /// Events are still accepted but nothing is planned until
    /// [`Engine::force_unlock`] or [`Engine::stop`].
    Stalled,
    /// The loop has exited.
    Closed,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stalled => write!(f, "stalled"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Owned by the handles only: dropping the last one drops `closing`.
#[derive(Debug)]
struct Shared {
    key: String,
    closing: watch::Sender<bool>,
    control: Arc<Control>,
}

/// No unlock requested.
const NO_UNLOCK: u64 = u64::MAX;

/// Shared between the handles and the loop task.
///
/// `epoch` advances every time the guard is taken (action dispatched or
/// entity stalled). An unlock request names the epoch it was made in, so a
/// request that arrives while the loop is busy cannot release a guard taken
/// after it.
#[derive(Debug)]
struct Control {
    unlock: Notify,
    unlock_epoch: AtomicU64,
    epoch: AtomicU64,
    stalled: AtomicBool,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            unlock: Notify::new(),
            unlock_epoch: AtomicU64::new(NO_UNLOCK),
            epoch: AtomicU64::new(0),
            stalled: AtomicBool::new(false),
        }
    }
}

/// Handle to one entity's execution loop.
///
/// Cheap to clone; every clone talks to the same loop. Dropping the last
/// handle shuts the loop down the same way [`Engine::stop`] does.
///
/// # Example
///
/// ```
/// use evtsm_core::{planner_fn, StateBackend, Step};
/// use evtsm_runtime::{Engine, EngineConfig};
/// use evtsm_testing::InMemoryBackend;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = InMemoryBackend::<u64>::new();
/// backend.begin("counter", 0).await?;
///
/// let planner = planner_fn(|events: &[u64], total: &mut u64| {
///     *total += events.iter().sum::<u64>();
///     Ok(Step::consume(events.len()))
/// });
///
/// let engine = Engine::spawn(planner, backend.scope("counter"), EngineConfig::default());
/// engine.send(2).await?;
/// engine.send(3).await?;
/// engine.stop(Duration::from_secs(1)).await?;
/// # Ok(())
/// # }
/// ```
pub struct Engine<Ev> {
    mailbox: mpsc::Sender<Ev>,
    shared: Arc<Shared>,
    closed: watch::Receiver<bool>,
}

impl<Ev> Clone for Engine<Ev> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            shared: Arc::clone(&self.shared),
            closed: self.closed.clone(),
        }
    }
}

impl<Ev> std::fmt::Debug for Engine<Ev> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("key", &self.shared.key)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<Ev> Engine<Ev> {
    /// Entity key this engine runs for
    #[must_use]
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Whether the execution loop has exited
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Whether `stop` has been requested
    #[must_use]
    pub fn is_closing(&self) -> bool {
        *self.shared.closing.borrow()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        if self.is_closed() {
            EngineStatus::Closed
        } else if self.shared.control.stalled.load(Ordering::SeqCst) {
            EngineStatus::Stalled
        } else {
            EngineStatus::Running
        }
    }

    /// Resolve once the execution loop has exited, for whatever reason.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // Err means the loop task is gone without signalling, which is also closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Request shutdown and wait up to `timeout` for the loop to exit.
    ///
    /// Idempotent and safe to call concurrently: every caller raises the same
    /// closing signal and waits on the same closed signal. Once requested,
    /// [`Engine::send`] fails and no new planning cycle starts. An action that
    /// is already running is awaited, and can observe the request through
    /// [`ActionContext::closing`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StopTimeout`] if the loop is still running when
    /// `timeout` elapses. Shutdown continues in the background.
    pub async fn stop(&self, timeout: Duration) -> Result<(), EngineError> {
        if !self.shared.closing.send_replace(true) {
            tracing::info!(entity = %self.shared.key, "Stop requested");
        }

        tokio::time::timeout(timeout, self.closed())
            .await
            .map_err(|_| {
                tracing::warn!(
                    entity = %self.shared.key,
                    timeout_ms = timeout.as_millis(),
                    "Stop timed out waiting for the execution loop"
                );
                EngineError::StopTimeout(timeout)
            })
    }

    /// Forcibly release the guard and re-evaluate pending events.
    ///
    /// Clears a [`EngineStatus::Stalled`] guard, or detaches an action that
    /// never completes so planning can resume. A detached action keeps
    /// running and may still send events. Has no effect on a closed engine.
    ///
    /// The request applies to the guard as it is when the call is made: an
    /// action dispatched afterwards is never detached by it.
    pub fn force_unlock(&self) {
        let control = &self.shared.control;
        let epoch = control.epoch.load(Ordering::SeqCst);
        tracing::warn!(entity = %self.shared.key, epoch, "Force unlock requested");
        control.unlock_epoch.store(epoch, Ordering::SeqCst);
        control.unlock.notify_one();
    }
}

impl<Ev: Send + Sync + 'static> Engine<Ev> {
    /// Start the execution loop for `store`'s entity.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<P, St>(planner: P, store: St, config: EngineConfig) -> Self
    where
        P: Planner<Event = Ev>,
        St: StateStore<State = P::State>,
    {
        let key = store.key().to_string();
        let (mailbox, inbox) = mpsc::channel(config.mailbox_capacity.max(1));
        let (closing_tx, closing_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        let control = Arc::new(Control::default());
        let shared = Arc::new(Shared {
            key: key.clone(),
            closing: closing_tx,
            control: Arc::clone(&control),
        });

        let runner = Runner {
            planner,
            store,
            inbox,
            mailbox: mailbox.clone(),
            closing: closing_rx,
            control,
            policy: config.action_failure_policy,
            pending: Vec::new(),
        };

        let span = tracing::info_span!("engine", entity = %key);
        tokio::spawn(runner.run(ClosedGuard(closed_tx)).instrument(span));
        tracing::debug!(entity = %key, capacity = config.mailbox_capacity, "Engine spawned");

        Self {
            mailbox,
            shared,
            closed: closed_rx,
        }
    }

    /// Deliver an event to the entity's mailbox.
    ///
    /// Events from one caller are planned in the order they were sent. Waits
    /// while the mailbox is full.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Terminated`] once `stop` has been requested or
    /// the loop has exited.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = %self.shared.key), name = "engine_send")]
    pub async fn send(&self, event: Ev) -> Result<(), EngineError> {
        if self.is_closing() || self.is_closed() {
            tracing::debug!("Rejected event: engine is closing");
            return Err(EngineError::Terminated);
        }
        self.mailbox
            .send(event)
            .await
            .map_err(|_| EngineError::Terminated)
    }
}

/// Fires the closed signal when the loop task ends, including by panic.
struct ClosedGuard(watch::Sender<bool>);

impl Drop for ClosedGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Mutual exclusion between cycles. Only the loop task touches it.
#[derive(Debug)]
enum Guard {
    Free,
    Acting(JoinHandle<Result<(), ActionError>>),
    Stalled,
}

enum Cycle {
    Committed { consumed: usize },
    Dispatched(JoinHandle<Result<(), ActionError>>),
    Terminated,
    Failed(StoreError),
    /// The store resolved `Ok` without invoking the callback.
    Unplanned,
}

struct Runner<P: Planner, St> {
    planner: P,
    store: St,
    inbox: mpsc::Receiver<P::Event>,
    mailbox: mpsc::Sender<P::Event>,
    closing: watch::Receiver<bool>,
    control: Arc<Control>,
    policy: ActionFailurePolicy,
    pending: Vec<P::Event>,
}

impl<P, St> Runner<P, St>
where
    P: Planner,
    St: StateStore<State = P::State>,
{
    async fn run(mut self, closed: ClosedGuard) {
        let _closed = closed;
        EngineMetrics::record_start();
        tracing::debug!("Execution loop started");

        self.drive().await;

        self.inbox.close();
        if !self.pending.is_empty() {
            tracing::warn!(dropped = self.pending.len(), "Exiting with unplanned events");
        }
        tracing::debug!("Execution loop exited");
    }

    async fn drive(&mut self) {
        let mut guard = Guard::Free;
        let mut ready = false;

        loop {
            if ready && matches!(guard, Guard::Free) && !self.is_closing() {
                self.collect();
                if !self.pending.is_empty() {
                    match self.cycle().await {
                        Cycle::Dispatched(task) => {
                            self.advance_epoch();
                            guard = Guard::Acting(task);
                        },
                        Cycle::Committed { consumed } => ready = consumed > 0,
                        Cycle::Terminated => {
                            tracing::info!("normal shutdown of state machine");
                            EngineMetrics::record_termination();
                            return;
                        },
                        Cycle::Failed(error) => {
                            tracing::error!(error = %error, "Planning cycle failed, stopping entity");
                            EngineMetrics::record_planner_failure();
                            return;
                        },
                        Cycle::Unplanned => {
                            tracing::error!(
                                "State store reported a commit without calling the planner, stopping entity"
                            );
                            EngineMetrics::record_planner_failure();
                            return;
                        },
                    }
                    continue;
                }
            }

            tokio::select! {
                biased;

                _ = self.closing.changed() => {
                    self.shutdown(guard).await;
                    return;
                }

                result = join_action(&mut guard) => match result {
                    Ok(()) => {
                        tracing::debug!("Action completed");
                        guard = Guard::Free;
                        ready = true;
                    },
                    Err(error) => {
                        EngineMetrics::record_action_failure();
                        match self.policy {
                            ActionFailurePolicy::Stall => {
                                tracing::error!(
                                    error = %error,
                                    pending = self.pending.len(),
                                    "Action failed, entity stalled until force_unlock"
                                );
                                self.advance_epoch();
                                guard = Guard::Stalled;
                                self.set_stalled(true);
                                EngineMetrics::record_stall();
                            },
                            ActionFailurePolicy::Release => {
                                tracing::warn!(error = %error, "Action failed, releasing guard");
                                guard = Guard::Free;
                                ready = true;
                            },
                            ActionFailurePolicy::Terminate => {
                                tracing::error!(error = %error, "Action failed, stopping entity");
                                return;
                            },
                        }
                    },
                },

                () = self.control.unlock.notified() => {
                    let requested = self.control.unlock_epoch.swap(NO_UNLOCK, Ordering::SeqCst);
                    let current = self.control.epoch.load(Ordering::SeqCst);
                    if requested != current {
                        tracing::debug!(requested, current, "Ignoring force unlock aimed at an earlier guard");
                        continue;
                    }
                    match std::mem::replace(&mut guard, Guard::Free) {
                        Guard::Acting(_detached) => {
                            tracing::warn!("Force unlock detached an in-flight action");
                        },
                        Guard::Stalled => tracing::info!("Force unlock cleared a stalled guard"),
                        Guard::Free => tracing::debug!("Force unlock on a free guard"),
                    }
                    self.set_stalled(false);
                    EngineMetrics::record_force_unlock();
                    ready = true;
                }

                event = self.inbox.recv() => match event {
                    Some(event) => {
                        self.pending.push(event);
                        ready = true;
                    },
                    None => return,
                },
            }
        }
    }

    /// Move everything already sitting in the mailbox into the pending batch.
    fn collect(&mut self) {
        while let Ok(event) = self.inbox.try_recv() {
            self.pending.push(event);
        }
    }

    /// Run one plan-and-commit cycle over the pending batch.
    async fn cycle(&mut self) -> Cycle {
        let started = Instant::now();
        let planner = &self.planner;
        let pending = &self.pending;
        let mut planned: Option<(Step<P::State, P::Event>, P::State)> = None;
        let mut terminated = false;

        tracing::trace!(pending = pending.len(), "Planning");
        let result = self
            .store
            .mutate(Box::new(|state| match planner.plan(pending, state) {
                Ok(step) => {
                    planned = Some((step, state.clone()));
                    Ok(())
                },
                Err(PlanError::Terminated) => {
                    terminated = true;
                    Ok(())
                },
                Err(PlanError::Failed(error)) => Err(error),
            }))
            .await;

        if let Err(error) = result {
            return Cycle::Failed(error);
        }
        if terminated {
            return Cycle::Terminated;
        }
        let Some((step, snapshot)) = planned else {
            return Cycle::Unplanned;
        };

        let available = self.pending.len();
        let consumed = if step.consumed > available {
            tracing::warn!(
                reported = step.consumed,
                available,
                "Planner consumed more events than were pending"
            );
            available
        } else {
            step.consumed
        };
        self.pending.drain(..consumed);
        EngineMetrics::record_cycle(consumed, started.elapsed());

        tracing::debug!(
            consumed,
            remaining = self.pending.len(),
            action = ?step.action,
            "Cycle committed"
        );

        match step.action {
            Some(action) => Cycle::Dispatched(self.dispatch(action, snapshot)),
            None => Cycle::Committed { consumed },
        }
    }

    fn dispatch(
        &self,
        action: Action<P::State, P::Event>,
        snapshot: P::State,
    ) -> JoinHandle<Result<(), ActionError>> {
        let ctx = ActionContext::new(self.mailbox.clone(), self.closing.clone());
        let span = tracing::debug_span!("action", name = action.name().unwrap_or("anonymous"));
        EngineMetrics::record_dispatch();

        tokio::spawn(
            async move {
                let started = Instant::now();
                let result = action.run(ctx, snapshot).await;
                EngineMetrics::record_action(started.elapsed());
                result
            }
            .instrument(span),
        )
    }

    async fn shutdown(&mut self, guard: Guard) {
        self.inbox.close();
        self.collect();
        tracing::info!(pending = self.pending.len(), "Closing mailbox");

        if let Guard::Acting(task) = guard {
            tracing::debug!("Waiting for in-flight action");
            match task.await {
                Ok(Ok(())) => tracing::debug!("In-flight action completed"),
                Ok(Err(error)) => tracing::warn!(error = %error, "In-flight action failed during stop"),
                Err(error) => tracing::warn!(error = %error, "In-flight action panicked during stop"),
            }
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    fn advance_epoch(&self) {
        self.control.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn set_stalled(&self, stalled: bool) {
        self.control.stalled.store(stalled, Ordering::SeqCst);
    }
}

/// Wait for the running action, or forever if there is none.
async fn join_action(guard: &mut Guard) -> Result<(), ActionError> {
    match guard {
        Guard::Acting(task) => match task.await {
            Ok(result) => result,
            Err(join_error) => Err(Box::new(join_error)),
        },
        Guard::Free | Guard::Stalled => std::future::pending().await,
    }
}
