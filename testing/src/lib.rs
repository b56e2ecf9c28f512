//! # evtsm Testing
//!
//! Testing utilities and helpers for evtsm.
//!
//! This crate provides:
//! - An in-memory, transactional `StateBackend` for engine tests
//! - A Given-When-Then harness for planners
//! - A probe that runs a single action and captures the events it sends
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use evtsm_core::StateBackend;
//! use evtsm_runtime::{Engine, EngineConfig};
//! use evtsm_testing::InMemoryBackend;
//!
//! #[tokio::test]
//! async fn test_deal_flow() {
//!     let backend = InMemoryBackend::new();
//!     backend.begin("deal-1", Deal::default()).await?;
//!
//!     let engine = Engine::spawn(DealPlanner, backend.scope("deal-1"), EngineConfig::default());
//!     engine.send(DealEvent::Open).await?;
//!
//!     // Stop does not plan queued events, so wait for the commit first.
//!     backend.wait_for("deal-1", |deal| deal.stage == Stage::Open).await;
//!     engine.stop(Duration::from_secs(1)).await?;
//! }
//! ```

pub mod action_probe;
pub mod planner_test;
pub mod state_store;

// Re-export commonly used items
pub use action_probe::ActionProbe;
pub use planner_test::PlannerTest;
pub use state_store::{InMemoryBackend, InMemoryStore};

/// Install a `tracing` subscriber for tests.
///
/// Honors `RUST_LOG`, defaults to `debug` for the evtsm crates, and writes
/// through the test harness so output is captured per test. Safe to call
/// from every test: only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evtsm_runtime=debug,evtsm_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
