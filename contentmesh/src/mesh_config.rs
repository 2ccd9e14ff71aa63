//! Configuration of the content mesh.

use crate::common::{
    get_cpu_count, DEFAULT_DOCUMENT_TYPE, DEFAULT_SYNC_ATTEMPT_TIMEOUT_MS,
    DEFAULT_SYNC_BACKOFF_BASE_MS, DEFAULT_SYNC_BACKOFF_MAX_MS, DEFAULT_SYNC_MAX_ATTEMPTS,
};
use crate::errors::{ErrorKind, MeshError, MeshResult};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runtime settings of the migration engine and the sync queue.
///
/// All clones share the same settings. Once the mesh is built the
/// configuration is frozen and every setter fails with `InvalidOperation`.
///
/// # Examples
///
/// ```rust
/// use contentmesh::mesh_config::MeshConfig;
/// use std::time::Duration;
///
/// let config = MeshConfig::new();
/// config.set_sync_max_attempts(3).unwrap();
/// config.set_sync_attempt_timeout(Duration::from_secs(1)).unwrap();
/// assert_eq!(config.sync_max_attempts(), 3);
/// ```
#[derive(Clone)]
pub struct MeshConfig {
    inner: Arc<MeshConfigInner>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshConfig {
    pub fn new() -> Self {
        MeshConfig {
            inner: Arc::new(MeshConfigInner::new()),
        }
    }

    pub fn sync_max_attempts(&self) -> u32 {
        self.inner.sync_max_attempts.load(Ordering::Relaxed)
    }

    pub fn set_sync_max_attempts(&self, attempts: u32) -> MeshResult<()> {
        self.inner.ensure_not_frozen("sync max attempts")?;
        if attempts == 0 {
            log::error!("Sync max attempts must be at least 1");
            return Err(MeshError::new(
                "Sync max attempts must be at least 1",
                ErrorKind::ValidationError,
            ));
        }
        self.inner.sync_max_attempts.store(attempts, Ordering::Relaxed);
        Ok(())
    }

    pub fn sync_backoff_base(&self) -> Duration {
        Duration::from_millis(self.inner.sync_backoff_base_ms.load(Ordering::Relaxed))
    }

    pub fn set_sync_backoff_base(&self, base: Duration) -> MeshResult<()> {
        self.inner.ensure_not_frozen("sync backoff base")?;
        self.inner
            .sync_backoff_base_ms
            .store(base.as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn sync_backoff_max(&self) -> Duration {
        Duration::from_millis(self.inner.sync_backoff_max_ms.load(Ordering::Relaxed))
    }

    pub fn set_sync_backoff_max(&self, max: Duration) -> MeshResult<()> {
        self.inner.ensure_not_frozen("sync backoff max")?;
        self.inner
            .sync_backoff_max_ms
            .store(max.as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn sync_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.sync_attempt_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_sync_attempt_timeout(&self, timeout: Duration) -> MeshResult<()> {
        self.inner.ensure_not_frozen("sync attempt timeout")?;
        if timeout.is_zero() {
            return Err(MeshError::new(
                "Sync attempt timeout must be positive",
                ErrorKind::ValidationError,
            ));
        }
        self.inner
            .sync_attempt_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Number of events the sync queue processes concurrently.
    pub fn sync_workers(&self) -> usize {
        self.inner.sync_workers.load(Ordering::Relaxed)
    }

    pub fn set_sync_workers(&self, workers: usize) -> MeshResult<()> {
        self.inner.ensure_not_frozen("sync workers")?;
        if workers == 0 {
            return Err(MeshError::new(
                "Sync workers must be at least 1",
                ErrorKind::ValidationError,
            ));
        }
        self.inner.sync_workers.store(workers, Ordering::Relaxed);
        Ok(())
    }

    /// Number of content units migrated concurrently.
    pub fn migration_concurrency(&self) -> usize {
        self.inner.migration_concurrency.load(Ordering::Relaxed)
    }

    pub fn set_migration_concurrency(&self, concurrency: usize) -> MeshResult<()> {
        self.inner.ensure_not_frozen("migration concurrency")?;
        if concurrency == 0 {
            return Err(MeshError::new(
                "Migration concurrency must be at least 1",
                ErrorKind::ValidationError,
            ));
        }
        self.inner
            .migration_concurrency
            .store(concurrency, Ordering::Relaxed);
        Ok(())
    }

    /// Document type used for every search document.
    pub fn document_type(&self) -> String {
        self.inner.document_type.read().clone()
    }

    pub fn set_document_type(&self, document_type: &str) -> MeshResult<()> {
        self.inner.ensure_not_frozen("document type")?;
        if document_type.trim().is_empty() {
            return Err(MeshError::new(
                "Document type cannot be empty",
                ErrorKind::ValidationError,
            ));
        }
        *self.inner.document_type.write() = document_type.to_string();
        Ok(())
    }

    /// Path of the dead letter journal; dead letters stay in memory when unset.
    pub fn dead_letter_path(&self) -> Option<PathBuf> {
        self.inner.dead_letter_path.read().clone()
    }

    pub fn set_dead_letter_path(&self, path: impl Into<PathBuf>) -> MeshResult<()> {
        self.inner.ensure_not_frozen("dead letter path")?;
        *self.inner.dead_letter_path.write() = Some(path.into());
        Ok(())
    }

    /// Backoff before retry number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at the configured maximum.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.sync_backoff_base();
        let max = self.sync_backoff_max();
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        base.checked_mul(factor).unwrap_or(max).min(max)
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::Relaxed)
    }

    pub(crate) fn freeze(&self) -> MeshResult<()> {
        if self.sync_backoff_base() > self.sync_backoff_max() {
            return Err(MeshError::new(
                "Sync backoff base must not exceed the backoff max",
                ErrorKind::ValidationError,
            ));
        }
        self.inner.frozen.store(true, Ordering::Relaxed);
        Ok(())
    }
}

struct MeshConfigInner {
    frozen: AtomicBool,
    sync_max_attempts: AtomicU32,
    sync_backoff_base_ms: AtomicU64,
    sync_backoff_max_ms: AtomicU64,
    sync_attempt_timeout_ms: AtomicU64,
    sync_workers: AtomicUsize,
    migration_concurrency: AtomicUsize,
    document_type: RwLock<String>,
    dead_letter_path: RwLock<Option<PathBuf>>,
}

impl MeshConfigInner {
    fn new() -> Self {
        let cpus = get_cpu_count();
        MeshConfigInner {
            frozen: AtomicBool::new(false),
            sync_max_attempts: AtomicU32::new(DEFAULT_SYNC_MAX_ATTEMPTS),
            sync_backoff_base_ms: AtomicU64::new(DEFAULT_SYNC_BACKOFF_BASE_MS),
            sync_backoff_max_ms: AtomicU64::new(DEFAULT_SYNC_BACKOFF_MAX_MS),
            sync_attempt_timeout_ms: AtomicU64::new(DEFAULT_SYNC_ATTEMPT_TIMEOUT_MS),
            sync_workers: AtomicUsize::new(cpus),
            migration_concurrency: AtomicUsize::new(cpus),
            document_type: RwLock::new(DEFAULT_DOCUMENT_TYPE.to_string()),
            dead_letter_path: RwLock::new(None),
        }
    }

    fn ensure_not_frozen(&self, setting: &str) -> MeshResult<()> {
        if self.frozen.load(Ordering::Relaxed) {
            log::error!("Cannot change {} after the mesh is built", setting);
            return Err(MeshError::new(
                &format!("Cannot change {} after the mesh is built", setting),
                ErrorKind::InvalidOperation,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::new();
        assert_eq!(config.sync_max_attempts(), 5);
        assert_eq!(config.sync_backoff_base(), Duration::from_millis(100));
        assert_eq!(config.sync_backoff_max(), Duration::from_secs(10));
        assert_eq!(config.sync_attempt_timeout(), Duration::from_secs(5));
        assert_eq!(config.sync_workers(), get_cpu_count());
        assert_eq!(config.migration_concurrency(), get_cpu_count());
        assert_eq!(config.document_type(), "node");
        assert!(config.dead_letter_path().is_none());
    }

    #[test]
    fn test_setters_validate() {
        let config = MeshConfig::new();
        assert!(config.set_sync_max_attempts(0).is_err());
        assert!(config.set_sync_workers(0).is_err());
        assert!(config.set_migration_concurrency(0).is_err());
        assert!(config.set_document_type(" ").is_err());
        assert!(config.set_sync_attempt_timeout(Duration::ZERO).is_err());
        config.set_document_type("content").unwrap();
        assert_eq!(config.document_type(), "content");
    }

    #[test]
    fn test_clones_share_settings() {
        let config = MeshConfig::new();
        let clone = config.clone();
        clone.set_sync_workers(3).unwrap();
        assert_eq!(config.sync_workers(), 3);
    }

    #[test]
    fn test_frozen_config_rejects_changes() {
        let config = MeshConfig::new();
        config.freeze().unwrap();
        assert!(config.is_frozen());
        let err = config.set_sync_max_attempts(2).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_freeze_rejects_inverted_backoff() {
        let config = MeshConfig::new();
        config.set_sync_backoff_base(Duration::from_secs(20)).unwrap();
        assert!(config.freeze().is_err());
        assert!(!config.is_frozen());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = MeshConfig::new();
        config.set_sync_backoff_base(Duration::from_millis(100)).unwrap();
        config.set_sync_backoff_max(Duration::from_millis(500)).unwrap();
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(4), Duration::from_millis(500));
        assert_eq!(config.backoff_for(40), Duration::from_millis(500));
    }
}
