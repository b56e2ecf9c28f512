//! # evtsm Runtime
//!
//! Execution engine for evtsm.
//!
//! This crate runs the per-entity loop that turns a stream of events into
//! committed state transitions and side effects.
//!
//! ## Core Components
//!
//! - **Engine**: One entity's mailbox, guard and execution loop
//! - **`EngineGroup`**: One engine per entity key over a shared `StateBackend`
//! - **Health**: Per-engine health checks aggregated into a report
//! - **Metrics**: Prometheus counters and histograms for cycles and actions
//!
//! ## Guarantees
//!
//! For each entity:
//! - Events are planned in send order
//! - Planning and mutation never overlap
//! - No event is consumed twice, none is skipped
//! - After the termination sentinel, no cycle runs and `send` fails
//!
//! ## Example
//!
//! ```ignore
//! use evtsm_runtime::{Engine, EngineConfig};
//!
//! let engine = Engine::spawn(planner, backend.scope("deal-1"), EngineConfig::default());
//!
//! // Send an event
//! engine.send(DealEvent::Open).await?;
//!
//! // Shut down
//! engine.stop(Duration::from_secs(5)).await?;
//! ```

/// Engine configuration
pub mod config;

/// The per-entity execution loop
pub mod engine;

/// Per-key engine registry
pub mod group;

/// Engine health checks
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

pub use config::{ActionFailurePolicy, EngineConfig};
pub use engine::{Engine, EngineStatus};
pub use evtsm_core::{EngineError, StoreError};
pub use group::EngineGroup;
pub use health::{HealthCheck, HealthReport, HealthStatus};
