//! Many entities, one backend.
//!
//! [`EngineGroup`] keeps one [`Engine`] per entity key over a shared
//! [`StateBackend`] and a shared [`Planner`]. Engines are started lazily:
//! an entity that has stored state but no live engine (for example after a
//! process restart) is resumed on its next `send`.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::{HealthCheck, HealthReport};
use evtsm_core::{EngineError, Planner, StateBackend, StateStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

type Admission = Arc<Mutex<()>>;

/// Registry of per-entity engines sharing one backend and one planner.
///
/// A closed engine stays registered, so sends to an entity that terminated
/// keep failing with [`EngineError::Terminated`]. [`EngineGroup::stop`]
/// removes the entry; a later `send` resumes the entity from its stored state.
///
/// # Example
///
/// ```
/// use evtsm_core::{planner_fn, Step};
/// use evtsm_runtime::{EngineConfig, EngineGroup};
/// use evtsm_testing::InMemoryBackend;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let planner = planner_fn(|events: &[u32], seen: &mut u32| {
///     *seen += 1;
///     Ok(Step::consume(events.len()))
/// });
///
/// let group = EngineGroup::new(InMemoryBackend::new(), planner, EngineConfig::default());
/// group.begin("job-1", 0).await?;
/// group.send("job-1", 7).await?;
/// group.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct EngineGroup<B, P>
where
    B: StateBackend,
    P: Planner<State = B::State>,
{
    backend: B,
    planner: Arc<P>,
    config: EngineConfig,
    engines: RwLock<HashMap<String, Engine<P::Event>>>,
    /// Serializes `begin` and resume per key, so the registry lock is never
    /// held across backend I/O.
    admissions: std::sync::Mutex<HashMap<String, Admission>>,
}

impl<B, P> std::fmt::Debug for EngineGroup<B, P>
where
    B: StateBackend,
    P: Planner<State = B::State>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineGroup")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B, P> EngineGroup<B, P>
where
    B: StateBackend,
    P: Planner<State = B::State>,
{
    /// Create an empty group
    #[must_use]
    pub fn new(backend: B, planner: P, config: EngineConfig) -> Self {
        Self {
            backend,
            planner: Arc::new(planner),
            config,
            engines: RwLock::new(HashMap::new()),
            admissions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The backend entity state is stored in
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Store `initial` as a new entity's state and start its engine.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AlreadyRunning`] if an engine is registered for `key`
    /// - [`EngineError::Store`] with [`StoreError::AlreadyExists`] if `key`
    ///   already has state
    pub async fn begin(&self, key: &str, initial: B::State) -> Result<Engine<P::Event>, EngineError> {
        let admission = self.admission(key);
        let _admitted = admission.lock().await;
        if self.engines.read().await.contains_key(key) {
            return Err(EngineError::AlreadyRunning(key.to_string()));
        }

        self.backend.begin(key, initial).await?;
        tracing::info!(entity = %key, "Entity created");

        Ok(self.register(key).await)
    }

    /// Handle to `key`'s engine, resuming it from stored state if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] with [`StoreError::NotFound`] if the
    /// entity has neither a registered engine nor stored state.
    pub async fn engine(&self, key: &str) -> Result<Engine<P::Event>, EngineError> {
        // Fast path: registered engine under the read lock.
        if let Some(engine) = self.engines.read().await.get(key) {
            return Ok(engine.clone());
        }

        let admission = self.admission(key);
        let _admitted = admission.lock().await;
        if let Some(engine) = self.engines.read().await.get(key) {
            return Ok(engine.clone());
        }
        if !self.backend.has(key).await? {
            return Err(StoreError::NotFound(key.to_string()).into());
        }

        tracing::info!(entity = %key, "Resuming entity from stored state");
        Ok(self.register(key).await)
    }

    /// Deliver an event to `key`'s engine.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Store`] if the entity is unknown
    /// - [`EngineError::Terminated`] if its engine has shut down
    pub async fn send(&self, key: &str, event: P::Event) -> Result<(), EngineError> {
        self.engine(key).await?.send(event).await
    }

    /// Whether `key` has stored state
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the backend fails.
    pub async fn has(&self, key: &str) -> Result<bool, EngineError> {
        Ok(self.backend.has(key).await?)
    }

    /// Committed state of `key`
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if `key` is unknown or the backend fails.
    pub async fn get(&self, key: &str) -> Result<B::State, EngineError> {
        Ok(self.backend.scope(key).get().await?)
    }

    /// Committed state of every stored entity, ordered by key
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the backend fails.
    pub async fn list(&self) -> Result<Vec<(String, B::State)>, EngineError> {
        Ok(self.backend.list().await?)
    }

    /// Keys of every registered engine that has not closed, sorted
    pub async fn running(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .engines
            .read()
            .await
            .iter()
            .filter(|(_, engine)| !engine.is_closed())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Release `key`'s guard. See [`Engine::force_unlock`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] if no engine is registered for `key`.
    pub async fn force_unlock(&self, key: &str) -> Result<(), EngineError> {
        let engines = self.engines.read().await;
        let engine = engines
            .get(key)
            .ok_or_else(|| EngineError::NotRunning(key.to_string()))?;
        engine.force_unlock();
        Ok(())
    }

    /// Stop `key`'s engine and unregister it.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotRunning`] if no engine is registered for `key`
    /// - [`EngineError::StopTimeout`] if the loop outlives `timeout`
    pub async fn stop(&self, key: &str, timeout: Duration) -> Result<(), EngineError> {
        let engine = self
            .engines
            .write()
            .await
            .remove(key)
            .ok_or_else(|| EngineError::NotRunning(key.to_string()))?;
        engine.stop(timeout).await
    }

    /// Stop every registered engine concurrently and unregister them all.
    ///
    /// # Errors
    ///
    /// Returns the first [`EngineError::StopTimeout`] if any loop outlives
    /// `timeout`. Every engine is asked to stop regardless.
    pub async fn stop_all(&self, timeout: Duration) -> Result<(), EngineError> {
        let engines: Vec<_> = self.engines.write().await.drain().map(|(_, e)| e).collect();
        tracing::info!(count = engines.len(), "Stopping all engines");

        let results =
            futures::future::join_all(engines.iter().map(|engine| engine.stop(timeout))).await;
        results.into_iter().collect()
    }

    /// [`EngineGroup::stop_all`] with the configured default timeout
    ///
    /// # Errors
    ///
    /// See [`EngineGroup::stop_all`].
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.stop_all(self.config.default_stop_timeout).await
    }

    /// Health of every registered engine.
    ///
    /// Stalled entities are unhealthy; closed ones are degraded.
    pub async fn health(&self) -> HealthReport {
        let engines = self.engines.read().await;
        let mut checks: Vec<HealthCheck> = engines.values().map(Engine::health).collect();
        checks.sort_by(|a, b| a.component.cmp(&b.component));
        HealthReport::new(checks)
    }

    /// Start `key`'s engine and add it to the registry.
    async fn register(&self, key: &str) -> Engine<P::Event> {
        let engine = Engine::spawn(
            Arc::clone(&self.planner),
            self.backend.scope(key),
            self.config.clone(),
        );
        self.engines
            .write()
            .await
            .insert(key.to_string(), engine.clone());
        engine
    }

    /// Per-key admission lock. Entries nobody holds are dropped on the way.
    fn admission(&self, key: &str) -> Admission {
        let mut admissions = self
            .admissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        admissions.retain(|_, admission| Arc::strong_count(admission) > 1);
        Arc::clone(admissions.entry(key.to_string()).or_default())
    }
}
