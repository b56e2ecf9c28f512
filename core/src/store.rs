//! State store abstraction: durable, atomic access to one entity's state.
//!
//! The engine never holds the state itself. Every read-modify-write goes
//! through [`StateStore::mutate`], which hands the callback exclusive access
//! to the live value and commits the change only if the callback succeeds.
//!
//! # Implementations
//!
//! - `InMemoryBackend` (in `evtsm-testing`): fast, deterministic testing
//! - `FileBackend` (in `evtsm-fs`): one JSON document per entity, atomic renames
//!
//! # Dyn Compatibility
//!
//! Like the rest of the storage seams, these traits return explicit
//! `Pin<Box<dyn Future>>` values instead of using `async fn`, so
//! `Arc<dyn StateStore<State = S>>` works.

use crate::error::{BoxError, StoreError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Callback passed to [`StateStore::mutate`].
pub type MutateFn<'a, S> = Box<dyn FnOnce(&mut S) -> Result<(), BoxError> + Send + 'a>;

/// Handle to the stored state of exactly one entity.
pub trait StateStore: Send + Sync + 'static {
    /// The entity's state type.
    type State: Clone + Send + Sync + 'static;

    /// Key of the entity this handle is scoped to.
    fn key(&self) -> &str;

    /// Atomically mutate the entity's state.
    ///
    /// `f` is called exactly once with exclusive access to the current value.
    /// If it returns `Ok`, the modified value is persisted before this future
    /// resolves. If it returns `Err`, nothing is written.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`]: the entity has no stored state
    /// - [`StoreError::Aborted`]: `f` failed, carrying its error
    /// - [`StoreError::Io`] / [`StoreError::Serialization`]: backend failure
    fn mutate<'a>(
        &'a self,
        f: MutateFn<'a, Self::State>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Read a copy of the entity's current state.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`]: the entity has no stored state
    /// - [`StoreError::Io`] / [`StoreError::Serialization`]: backend failure
    fn get(&self) -> Pin<Box<dyn Future<Output = Result<Self::State, StoreError>> + Send + '_>>;
}

impl<T: StateStore> StateStore for Arc<T> {
    type State = T::State;

    fn key(&self) -> &str {
        (**self).key()
    }

    fn mutate<'a>(
        &'a self,
        f: MutateFn<'a, Self::State>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        (**self).mutate(f)
    }

    fn get(&self) -> Pin<Box<dyn Future<Output = Result<Self::State, StoreError>> + Send + '_>> {
        (**self).get()
    }
}

/// A keyed collection of entity states sharing one state type.
///
/// Hands out entity-scoped [`StateStore`] handles and supports the
/// bookkeeping an engine group needs: creating state for a new entity,
/// probing for existing entities and listing them after a restart.
pub trait StateBackend: Send + Sync + 'static {
    /// State type of every entity in this backend.
    type State: Clone + Send + Sync + 'static;

    /// Entity-scoped handle type.
    type Store: StateStore<State = Self::State>;

    /// Handle scoped to `key`. Does not check that state exists.
    fn scope(&self, key: &str) -> Self::Store;

    /// Persist the initial state of a new entity.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyExists`]: `key` already has state
    /// - [`StoreError::Io`] / [`StoreError::Serialization`]: backend failure
    fn begin<'a>(
        &'a self,
        key: &'a str,
        initial: Self::State,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Whether `key` has stored state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on backend failure.
    fn has<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    /// Every stored entity with its current state, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] / [`StoreError::Serialization`] on backend failure.
    fn list(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<(String, Self::State)>, StoreError>> + Send + '_>>;
}
