//! In-memory state backend for fast, deterministic engine tests.
//!
//! - [`InMemoryBackend`]: `BTreeMap`-based keyed state storage
//! - [`InMemoryStore`]: entity-scoped handle implementing `StateStore`

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use evtsm_core::{MutateFn, StateBackend, StateStore, StoreError};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;

#[derive(Debug)]
struct Inner<S> {
    states: RwLock<BTreeMap<String, S>>,
    mutations: AtomicUsize,
    fail_writes: AtomicBool,
    changed: Notify,
}

/// In-memory state backend.
///
/// Mutations run the callback against a copy of the stored value and swap
/// it in only on success, so an aborted mutation leaves no trace, exactly
/// like a transactional store would.
///
/// # Example
///
/// ```
/// use evtsm_core::{StateBackend, StateStore};
/// use evtsm_testing::InMemoryBackend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = InMemoryBackend::<u32>::new();
/// backend.begin("job-1", 0).await?;
///
/// let store = backend.scope("job-1");
/// store.mutate(Box::new(|n| {
///     *n += 1;
///     Ok(())
/// })).await?;
///
/// assert_eq!(store.get().await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryBackend<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for InMemoryBackend<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Default for InMemoryBackend<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> InMemoryBackend<S> {
    /// Create a new empty backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                states: RwLock::new(BTreeMap::new()),
                mutations: AtomicUsize::new(0),
                fail_writes: AtomicBool::new(false),
                changed: Notify::new(),
            }),
        }
    }

    /// Number of committed mutations across all entities
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.inner.mutations.load(Ordering::SeqCst)
    }

    /// Make every following commit fail with [`StoreError::Io`]
    ///
    /// The callback still runs; only the write is refused. Useful for
    /// exercising the engine's fail-stop path.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored entities
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.states.read().unwrap().len()
    }

    /// Whether no entity has state
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.states.read().unwrap().is_empty()
    }
}

impl<S: Clone> InMemoryBackend<S> {
    /// Insert or overwrite an entity's state directly, bypassing `begin`
    pub fn insert(&self, key: impl Into<String>, state: S) {
        self.inner.states.write().unwrap().insert(key.into(), state);
        self.inner.changed.notify_waiters();
    }

    /// Peek at an entity's state without going through a store handle
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<S> {
        self.inner.states.read().unwrap().get(key).cloned()
    }

    /// Wait until `key` has state matching `predicate`, and return it.
    ///
    /// Re-checks after every commit. Never times out on its own; wrap it in
    /// `tokio::time::timeout` in tests.
    pub async fn wait_for(&self, key: &str, mut predicate: impl FnMut(&S) -> bool) -> S {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(state) = self.peek(key) {
                if predicate(&state) {
                    return state;
                }
            }
            notified.await;
        }
    }
}

impl<S: Clone + Send + Sync + 'static> StateBackend for InMemoryBackend<S> {
    type State = S;
    type Store = InMemoryStore<S>;

    fn scope(&self, key: &str) -> Self::Store {
        InMemoryStore {
            key: key.to_string(),
            backend: self.clone(),
        }
    }

    fn begin<'a>(
        &'a self,
        key: &'a str,
        initial: S,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut states = self.inner.states.write().unwrap();
            if states.contains_key(key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            states.insert(key.to_string(), initial);
            drop(states);
            self.inner.changed.notify_waiters();
            Ok(())
        })
    }

    fn has<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.inner.states.read().unwrap().contains_key(key)) })
    }

    fn list(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<(String, S)>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .inner
                .states
                .read()
                .unwrap()
                .iter()
                .map(|(key, state)| (key.clone(), state.clone()))
                .collect())
        })
    }
}

/// Handle to one entity's state inside an [`InMemoryBackend`].
#[derive(Debug)]
pub struct InMemoryStore<S> {
    key: String,
    backend: InMemoryBackend<S>,
}

impl<S> Clone for InMemoryStore<S> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            backend: self.backend.clone(),
        }
    }
}

impl<S: Clone + Send + Sync + 'static> StateStore for InMemoryStore<S> {
    type State = S;

    fn key(&self) -> &str {
        &self.key
    }

    fn mutate<'a>(
        &'a self,
        f: MutateFn<'a, S>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let inner = &self.backend.inner;
            let mut states = inner.states.write().unwrap();
            let current = states
                .get(&self.key)
                .ok_or_else(|| StoreError::NotFound(self.key.clone()))?;

            let mut draft = current.clone();
            f(&mut draft).map_err(StoreError::Aborted)?;

            if inner.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io(format!("write refused for {}", self.key)));
            }

            states.insert(self.key.clone(), draft);
            drop(states);
            inner.mutations.fetch_add(1, Ordering::SeqCst);
            inner.changed.notify_waiters();
            Ok(())
        })
    }

    fn get(&self) -> Pin<Box<dyn Future<Output = Result<S, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.backend
                .peek(&self.key)
                .ok_or_else(|| StoreError::NotFound(self.key.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_rejects_existing_key() {
        let backend = InMemoryBackend::<u8>::new();
        backend.begin("a", 1).await.unwrap();

        let err = backend.begin("a", 2).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(ref k) if k == "a"));
        assert_eq!(backend.peek("a"), Some(1));
    }

    #[tokio::test]
    async fn mutate_commits_on_success() {
        let backend = InMemoryBackend::<Vec<u8>>::new();
        backend.begin("a", vec![]).await.unwrap();
        let store = backend.scope("a");

        store
            .mutate(Box::new(|v| {
                v.push(7);
                Ok(())
            }))
            .await
            .unwrap();

        assert_eq!(store.get().await.unwrap(), vec![7]);
        assert_eq!(backend.mutation_count(), 1);
    }

    #[tokio::test]
    async fn mutate_discards_on_callback_error() {
        let backend = InMemoryBackend::<Vec<u8>>::new();
        backend.begin("a", vec![1]).await.unwrap();
        let store = backend.scope("a");

        let err = store
            .mutate(Box::new(|v| {
                v.clear();
                Err("nope".into())
            }))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Aborted(_)));
        assert_eq!(store.get().await.unwrap(), vec![1]);
        assert_eq!(backend.mutation_count(), 0);
    }

    #[tokio::test]
    async fn mutate_unknown_key_is_not_found() {
        let backend = InMemoryBackend::<u8>::new();
        let store = backend.scope("ghost");

        let err = store.mutate(Box::new(|_| Ok(()))).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_write_keeps_old_value() {
        let backend = InMemoryBackend::<u8>::new();
        backend.begin("a", 1).await.unwrap();
        backend.fail_writes(true);

        let err = backend
            .scope("a")
            .mutate(Box::new(|n| {
                *n = 9;
                Ok(())
            }))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(backend.peek("a"), Some(1));
    }

    #[tokio::test]
    async fn wait_for_sees_later_commit() {
        let backend = InMemoryBackend::<u8>::new();
        backend.begin("a", 0).await.unwrap();

        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.wait_for("a", |n| *n == 2).await })
        };
        tokio::task::yield_now().await;

        let store = backend.scope("a");
        for _ in 0..2 {
            store
                .mutate(Box::new(|n| {
                    *n += 1;
                    Ok(())
                }))
                .await
                .unwrap();
        }

        assert_eq!(waiter.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn list_is_ordered_by_key() {
        let backend = InMemoryBackend::<u8>::new();
        backend.insert("b", 2);
        backend.insert("a", 1);

        let listed = backend.list().await.unwrap();
        assert_eq!(listed, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert!(backend.has("a").await.unwrap());
        assert!(!backend.has("c").await.unwrap());
    }
}
