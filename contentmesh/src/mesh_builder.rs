use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::mesh::ContentMesh;
use crate::mesh_config::MeshConfig;
use crate::search::{DeadLetterLog, InMemorySearchBackend, SearchBackend};
use crate::store::MeshStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builder for a [ContentMesh].
///
/// Configuration errors are captured and reported by [build](Self::build),
/// so calls can be chained freely.
///
/// # Examples
///
/// ```rust,ignore
/// use contentmesh::mesh::ContentMesh;
/// use std::time::Duration;
///
/// let mesh = ContentMesh::builder()
///     .sync_max_attempts(3)
///     .sync_backoff(Duration::from_millis(50), Duration::from_secs(2))
///     .dead_letter_path("/var/lib/mesh/dead-letters.jsonl")
///     .build()?;
/// ```
#[derive(Default)]
pub struct ContentMeshBuilder {
    error: Option<MeshError>,
    config: MeshConfig,
    store: Option<MeshStore>,
    backend: Option<Arc<dyn SearchBackend>>,
    dead_letters: Option<DeadLetterLog>,
}

impl ContentMeshBuilder {
    pub fn new() -> Self {
        ContentMeshBuilder {
            error: None,
            config: MeshConfig::new(),
            store: None,
            backend: None,
            dead_letters: None,
        }
    }

    /// Attempts per sync obligation before its event is dead-lettered.
    pub fn sync_max_attempts(mut self, attempts: u32) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_sync_max_attempts(attempts) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Exponential backoff between sync attempts.
    pub fn sync_backoff(mut self, base: Duration, max: Duration) -> Self {
        if self.error.is_none() {
            let result = self
                .config
                .set_sync_backoff_base(base)
                .and_then(|_| self.config.set_sync_backoff_max(max));
            if let Err(e) = result {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn sync_attempt_timeout(mut self, timeout: Duration) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_sync_attempt_timeout(timeout) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Events processed concurrently by the sync queue.
    pub fn sync_workers(mut self, workers: usize) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_sync_workers(workers) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Units migrated concurrently per release.
    pub fn migration_concurrency(mut self, concurrency: usize) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_migration_concurrency(concurrency) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn document_type(mut self, document_type: &str) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_document_type(document_type) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Persists dead letters as JSON lines at `path`. Ignored when a log is
    /// given through [dead_letter_log](Self::dead_letter_log).
    pub fn dead_letter_path(mut self, path: impl Into<PathBuf>) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_dead_letter_path(path) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Uses an existing store instead of an empty one.
    pub fn store(mut self, store: MeshStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn search_backend<B: SearchBackend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn dead_letter_log(mut self, dead_letters: DeadLetterLog) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Builds the mesh and starts its sync queue. Must be called within a
    /// tokio runtime.
    pub fn build(self) -> MeshResult<ContentMesh> {
        if let Some(error) = self.error {
            log::error!("Invalid content mesh configuration: {}", error);
            return Err(error);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MeshError::new(
                "A content mesh must be built within a tokio runtime",
                ErrorKind::InvalidOperation,
            ));
        }
        self.config.freeze()?;

        let dead_letters = match self.dead_letters {
            Some(log) => log,
            None => match self.config.dead_letter_path() {
                Some(path) => DeadLetterLog::open(path)?,
                None => DeadLetterLog::in_memory(),
            },
        };
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(InMemorySearchBackend::new()));
        let store = self.store.unwrap_or_default();

        let mesh = ContentMesh::new(self.config, store, backend, dead_letters)?;
        log::info!("Content mesh started");
        Ok(mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_with_defaults() {
        let mesh = ContentMeshBuilder::new().build().unwrap();
        assert!(mesh.config().is_frozen());
        assert!(mesh.config().set_sync_workers(2).is_err());
        mesh.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_error_is_reported() {
        let result = ContentMeshBuilder::new()
            .sync_max_attempts(0)
            .sync_workers(0)
            .build();
        let err = result.err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::ValidationError);
        assert!(err.message().contains("attempt"));
    }

    #[tokio::test]
    async fn test_inverted_backoff_is_rejected() {
        let result = ContentMeshBuilder::new()
            .sync_backoff(Duration::from_secs(5), Duration::from_secs(1))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let err = ContentMeshBuilder::new().build().err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
    }

    #[tokio::test]
    async fn test_dead_letter_path_opens_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead.jsonl");
        let mesh = ContentMeshBuilder::new()
            .dead_letter_path(&path)
            .build()
            .unwrap();
        assert!(path.exists());
        assert_eq!(mesh.sync_queue().dead_letters().path(), Some(path.as_path()));
        mesh.close().await.unwrap();
    }
}
