//! JSON-file `StateBackend`.

use crate::error::FileStoreError;
use crate::key;
use evtsm_core::{MutateFn, StateBackend, StateStore, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

type KeyLock = Arc<Mutex<()>>;

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    locks: std::sync::Mutex<HashMap<String, KeyLock>>,
}

impl Inner {
    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key::file_name(key))
    }

    /// Writer lock for `key`. Locks no store handle refers to any more are
    /// dropped on the way.
    fn lock_for(&self, key: &str) -> KeyLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

/// One JSON file per entity under a root directory.
///
/// Every write goes to a `.tmp` sibling, is flushed to disk, then renamed
/// over the entity's file, so a crash leaves either the old or the new state
/// and never a torn one. Writers to the same key are serialized in-process.
///
/// # Example
///
/// ```no_run
/// use evtsm_core::{StateBackend, StateStore};
/// use evtsm_fs::FileBackend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = FileBackend::<u64>::open("/var/lib/deals").await?;
/// backend.begin("deal-1", 0).await?;
///
/// backend
///     .scope("deal-1")
///     .mutate(Box::new(|n| {
///         *n += 1;
///         Ok(())
///     }))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileBackend<S> {
    inner: Arc<Inner>,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for FileBackend<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _state: PhantomData,
        }
    }
}

impl<S> FileBackend<S> {
    /// Use `root` as the state directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| FileStoreError::io("create", &root, e))?;
        tracing::debug!(root = %root.display(), "Opened file state backend");

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                locks: std::sync::Mutex::new(HashMap::new()),
            }),
            _state: PhantomData,
        })
    }

    /// State directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

impl<S> StateBackend for FileBackend<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type State = S;
    type Store = FileStore<S>;

    fn scope(&self, key: &str) -> Self::Store {
        FileStore {
            key: key.to_string(),
            path: self.inner.path(key),
            lock: self.inner.lock_for(key),
            _state: PhantomData,
        }
    }

    fn begin<'a>(
        &'a self,
        key: &'a str,
        initial: S,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.inner.path(key);
            let lock = self.inner.lock_for(key);
            let _held = lock.lock().await;

            if exists(&path).await? {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            write_state(&path, &initial).await?;
            tracing::debug!(entity = %key, "State file created");
            Ok(())
        })
    }

    fn has<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move { Ok(exists(&self.inner.path(key)).await?) })
    }

    fn list(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<(String, S)>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let root = &self.inner.root;
            let mut dir = fs::read_dir(root)
                .await
                .map_err(|e| FileStoreError::io("list", root, e))?;

            let mut states = Vec::new();
            while let Some(entry) = dir
                .next_entry()
                .await
                .map_err(|e| FileStoreError::io("list", root, e))?
            {
                let file_name = entry.file_name();
                let Some(key) = file_name.to_str().and_then(key::key_of) else {
                    continue;
                };
                // A file removed between listing and reading is skipped.
                if let Some(state) = read_state(&entry.path()).await? {
                    states.push((key, state));
                }
            }
            states.sort_by(|(a, _), (b, _)| a.cmp(b));
            Ok(states)
        })
    }
}

/// Handle to one entity's state file.
#[derive(Debug)]
pub struct FileStore<S> {
    key: String,
    path: PathBuf,
    lock: KeyLock,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for FileStore<S> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            path: self.path.clone(),
            lock: Arc::clone(&self.lock),
            _state: PhantomData,
        }
    }
}

impl<S> FileStore<S> {
    /// Path of the entity's state file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<S> StateStore for FileStore<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type State = S;

    fn key(&self) -> &str {
        &self.key
    }

    fn mutate<'a>(
        &'a self,
        f: MutateFn<'a, S>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let _held = self.lock.lock().await;

            let mut state = read_state::<S>(&self.path)
                .await?
                .ok_or_else(|| StoreError::NotFound(self.key.clone()))?;
            f(&mut state).map_err(StoreError::Aborted)?;
            write_state(&self.path, &state).await?;

            tracing::trace!(entity = %self.key, "State file committed");
            Ok(())
        })
    }

    fn get(&self) -> Pin<Box<dyn Future<Output = Result<S, StoreError>> + Send + '_>> {
        Box::pin(async move {
            read_state(&self.path)
                .await?
                .ok_or_else(|| StoreError::NotFound(self.key.clone()))
        })
    }
}

async fn exists(path: &Path) -> Result<bool, FileStoreError> {
    fs::try_exists(path)
        .await
        .map_err(|e| FileStoreError::io("stat", path, e))
}

async fn read_state<S: DeserializeOwned>(path: &Path) -> Result<Option<S>, FileStoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FileStoreError::io("read", path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| FileStoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Write `state` next to `path`, sync it, then rename it into place.
async fn write_state<S: Serialize>(path: &Path, state: &S) -> Result<(), FileStoreError> {
    let json = serde_json::to_vec_pretty(state).map_err(|source| FileStoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|e| FileStoreError::io("create", &tmp, e))?;
    file.write_all(&json)
        .await
        .map_err(|e| FileStoreError::io("write", &tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| FileStoreError::io("sync", &tmp, e))?;
    drop(file);

    fs::rename(&tmp, path)
        .await
        .map_err(|e| FileStoreError::io("rename", path, e))?;
    sync_parent(path).await
}

/// Flush the directory entry so the rename itself survives a crash.
#[cfg(unix)]
async fn sync_parent(path: &Path) -> Result<(), FileStoreError> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    fs::File::open(dir)
        .await
        .map_err(|e| FileStoreError::io("open", dir, e))?
        .sync_all()
        .await
        .map_err(|e| FileStoreError::io("sync", dir, e))
}

/// Directories cannot be opened for syncing here; the rename is all we get.
#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn sync_parent(_path: &Path) -> Result<(), FileStoreError> {
    Ok(())
}
