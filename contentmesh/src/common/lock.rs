use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};

/// A handle to a named asynchronous read-write lock.
///
/// Guards are owned, so they can be held across `.await` points and moved
/// into spawned tasks.
#[derive(Clone)]
pub struct LockHandle {
    lock: Arc<AsyncRwLock<()>>,
}

impl LockHandle {
    /// Acquires a shared lock.
    pub async fn read(&self) -> OwnedRwLockReadGuard<()> {
        self.lock.clone().read_owned().await
    }

    /// Acquires an exclusive lock.
    pub async fn write(&self) -> OwnedRwLockWriteGuard<()> {
        self.lock.clone().write_owned().await
    }
}

/// Registry of named asynchronous read-write locks.
///
/// The sync queue uses one registry keyed by index name (mapping updates take
/// the write side, document writes the read side) and one keyed by document
/// id (every write takes the write side) so that operations on the same
/// document never interleave.
///
/// # Examples
///
/// ```rust,no_run
/// use contentmesh::common::LockRegistry;
///
/// #[tokio::main]
/// async fn main() {
///     let registry = LockRegistry::new();
///     let handle = registry.get_lock("index-1");
///     {
///         let _read = handle.read().await;
///     }
///     let _write = registry.get_lock("index-1").write().await;
/// }
/// ```
#[derive(Clone, Default)]
pub struct LockRegistry {
    locks: Arc<RwLock<HashMap<String, Arc<AsyncRwLock<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        LockRegistry {
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Gets the lock registered under `name`, creating it on first use.
    pub fn get_lock(&self, name: &str) -> LockHandle {
        if let Some(lock) = self.locks.read().get(name) {
            return LockHandle { lock: lock.clone() };
        }

        let lock = {
            let mut locks = self.locks.write();
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncRwLock::new(())))
                .clone()
        };
        LockHandle { lock }
    }

    /// Drops locks nobody holds a handle to anymore.
    pub fn prune(&self) {
        self.locks
            .write()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }
}
