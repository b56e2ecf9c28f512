//! # Deal Pipeline Example
//!
//! A storage deal moving through funding, publication and sealing, one
//! entity per deal.
//!
//! This example showcases:
//! - A planner that advances a stage machine and persists every step
//! - Actions that talk to an external market and feed the outcome back as
//!   events
//! - Termination when a deal reaches a final stage
//! - Operator recovery of a deal stalled by a failed action
//!
//! ## Flow
//!
//! ```text
//! Propose ─► Funding ──FundsReserved──► Publishing ──Published──► Sealing ──Sealed──► Active
//!               │                          ▲   │                                        │
//!          FundingFailed                Retry  └─ action error: stalled                Expire
//!               ▼                                                                       ▼
//!             Failed (terminated)                                          Expired (terminated)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use deal_pipeline::{Deal, DealEvent, DealPlanner, SimulatedMarket};
//! use evtsm_runtime::{EngineConfig, EngineGroup};
//! use evtsm_testing::InMemoryBackend;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let planner = DealPlanner::new(Arc::new(SimulatedMarket::new(1 << 30)));
//! let group = EngineGroup::new(InMemoryBackend::new(), planner, EngineConfig::default());
//!
//! group.begin("deal-1", Deal::default()).await?;
//! group
//!     .send("deal-1", DealEvent::Propose { client: "acme".into(), size: 4096 })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use evtsm_core::{Action, ActionError, PlanError, Planner, Step, action_error};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Where a deal is in its lifecycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Created, waiting for a proposal
    #[default]
    New,
    /// Reserving client funds
    Funding,
    /// Publishing the deal on the market
    Publishing,
    /// Waiting for the data to be sealed
    Sealing,
    /// Live on the market
    Active,
    /// Funding was refused
    Failed(String),
    /// Reached its end of life
    Expired,
    /// Closed by the operator
    Closed,
}

impl Stage {
    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Expired | Self::Closed)
    }
}

/// Deal state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    /// Paying client
    pub client: String,
    /// Payload size in bytes
    pub size: u64,
    /// Current stage
    pub stage: Stage,
    /// Market-assigned id, once published
    pub market_id: Option<u64>,
    /// Every stage entered, in order
    pub history: Vec<Stage>,
    /// Publication attempts so far
    pub publish_attempts: u32,
}

impl Deal {
    fn enter(&mut self, stage: Stage) {
        self.history.push(stage.clone());
        self.stage = stage;
    }
}

/// Deal events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DealEvent {
    /// Client proposes a deal
    Propose {
        /// Paying client
        client: String,
        /// Payload size in bytes
        size: u64,
    },
    /// Funds are locked for the deal
    FundsReserved,
    /// Funds could not be locked
    FundingFailed(String),
    /// Deal is on the market
    Published {
        /// Market-assigned id
        market_id: u64,
    },
    /// Payload is sealed
    Sealed,
    /// Operator asks to publish again after a failure
    Retry,
    /// Deal reached its end date
    Expire,
    /// Operator closes the deal
    Close,
}

/// External market the deal actions call into.
pub trait Market: Send + Sync + 'static {
    /// Lock `size` bytes worth of funds for `client`.
    ///
    /// # Errors
    ///
    /// Returns the refusal reason.
    fn reserve_funds(&self, client: &str, size: u64) -> Result<(), String>;

    /// Publish a funded deal and return its market id.
    ///
    /// # Errors
    ///
    /// Returns an error if the market is unreachable.
    fn publish(&self, client: &str, size: u64) -> Result<u64, ActionError>;
}

/// In-process market with a size limit and a switchable outage.
#[derive(Debug)]
pub struct SimulatedMarket {
    max_size: u64,
    next_id: AtomicU64,
    outage: AtomicBool,
}

impl SimulatedMarket {
    /// Market accepting deals up to `max_size` bytes
    #[must_use]
    pub const fn new(max_size: u64) -> Self {
        Self {
            max_size,
            next_id: AtomicU64::new(1),
            outage: AtomicBool::new(false),
        }
    }

    /// Make `publish` fail until the outage is cleared
    pub fn set_outage(&self, outage: bool) {
        self.outage.store(outage, Ordering::SeqCst);
    }
}

impl Market for SimulatedMarket {
    fn reserve_funds(&self, client: &str, size: u64) -> Result<(), String> {
        if size > self.max_size {
            return Err(format!(
                "{client} asked for {size} bytes, limit is {}",
                self.max_size
            ));
        }
        Ok(())
    }

    fn publish(&self, _client: &str, _size: u64) -> Result<u64, ActionError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(action_error("market unreachable"));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Deal planner
///
/// Handles one event per cycle. Events that make no sense in the current
/// stage are logged and dropped.
pub struct DealPlanner<M> {
    market: Arc<M>,
    sealing_delay: Duration,
}

impl<M> Clone for DealPlanner<M> {
    fn clone(&self) -> Self {
        Self {
            market: Arc::clone(&self.market),
            sealing_delay: self.sealing_delay,
        }
    }
}

impl<M: Market> DealPlanner<M> {
    /// Create a planner calling into `market`
    #[must_use]
    pub const fn new(market: Arc<M>) -> Self {
        Self {
            market,
            sealing_delay: Duration::from_millis(10),
        }
    }

    /// Set how long sealing takes
    #[must_use]
    pub const fn with_sealing_delay(mut self, delay: Duration) -> Self {
        self.sealing_delay = delay;
        self
    }

    fn reserve(&self) -> Action<Deal, DealEvent> {
        let market = Arc::clone(&self.market);
        Action::new(move |ctx, deal: Deal| async move {
            let event = match market.reserve_funds(&deal.client, deal.size) {
                Ok(()) => DealEvent::FundsReserved,
                Err(reason) => DealEvent::FundingFailed(reason),
            };
            ctx.send(event).await?;
            Ok(())
        })
        .named("reserve_funds")
    }

    fn publish(&self) -> Action<Deal, DealEvent> {
        let market = Arc::clone(&self.market);
        Action::new(move |ctx, deal: Deal| async move {
            let market_id = market.publish(&deal.client, deal.size)?;
            ctx.send(DealEvent::Published { market_id }).await?;
            Ok(())
        })
        .named("publish")
    }

    fn seal(&self) -> Action<Deal, DealEvent> {
        let delay = self.sealing_delay;
        Action::new(move |ctx, _deal: Deal| async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => ctx.send(DealEvent::Sealed).await?,
                () = ctx.closing() => tracing::debug!("Sealing interrupted by shutdown"),
            }
            Ok(())
        })
        .named("seal")
    }
}

impl<M: Market> Planner for DealPlanner<M> {
    type State = Deal;
    type Event = DealEvent;

    fn plan(
        &self,
        events: &[DealEvent],
        deal: &mut Deal,
    ) -> Result<Step<Deal, DealEvent>, PlanError> {
        let Some(event) = events.first() else {
            return Ok(Step::idle());
        };

        let stage = deal.stage.clone();
        let action = match (&stage, event) {
            (_, DealEvent::Close) => {
                deal.enter(Stage::Closed);
                return Err(PlanError::Terminated);
            },
            (Stage::New, DealEvent::Propose { client, size }) => {
                deal.client.clone_from(client);
                deal.size = *size;
                deal.enter(Stage::Funding);
                Some(self.reserve())
            },
            (Stage::Funding, DealEvent::FundsReserved) => {
                deal.enter(Stage::Publishing);
                deal.publish_attempts += 1;
                Some(self.publish())
            },
            (Stage::Funding, DealEvent::FundingFailed(reason)) => {
                deal.enter(Stage::Failed(reason.clone()));
                return Err(PlanError::Terminated);
            },
            (Stage::Publishing, DealEvent::Retry) => {
                deal.publish_attempts += 1;
                Some(self.publish())
            },
            (Stage::Publishing, DealEvent::Published { market_id }) => {
                deal.market_id = Some(*market_id);
                deal.enter(Stage::Sealing);
                Some(self.seal())
            },
            (Stage::Sealing, DealEvent::Sealed) => {
                deal.enter(Stage::Active);
                None
            },
            (Stage::Active, DealEvent::Expire) => {
                deal.enter(Stage::Expired);
                return Err(PlanError::Terminated);
            },
            (stage, event) => {
                tracing::warn!(?stage, ?event, "Ignoring event");
                None
            },
        };

        Ok(Step {
            action,
            consumed: 1,
        })
    }
}
