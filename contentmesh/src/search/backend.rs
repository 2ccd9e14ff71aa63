use crate::errors::{ErrorKind, MeshError, MeshResult};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Client of the search engine the mesh keeps in sync.
///
/// Every operation is individually retryable; the sync queue wraps each
/// call in its retry and timeout policy. Deleting a document that does not
/// exist must succeed.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Creates or replaces a document.
    async fn upsert_document(
        &self,
        index: &str,
        document_type: &str,
        document_id: &str,
        document: Value,
    ) -> MeshResult<()>;

    /// Deletes a document by id.
    async fn delete_document(&self, index: &str, document_type: &str, document_id: &str) -> MeshResult<()>;

    /// Makes all previous writes into `index` visible to searches.
    async fn refresh_index(&self, index: &str) -> MeshResult<()>;

    /// Creates `index` if needed and puts the mapping of `document_type`.
    async fn put_mapping(&self, index: &str, document_type: &str, mapping: Value) -> MeshResult<()>;

    /// Removes `index` and all of its documents.
    async fn drop_index(&self, index: &str) -> MeshResult<()>;
}

/// Operation recorded by [InMemorySearchBackend].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendOperation {
    Upsert { index: String, document_id: String },
    Delete { index: String, document_id: String },
    Refresh { index: String },
    PutMapping { index: String },
    DropIndex { index: String },
}

impl BackendOperation {
    pub fn index(&self) -> &str {
        match self {
            BackendOperation::Upsert { index, .. }
            | BackendOperation::Delete { index, .. }
            | BackendOperation::Refresh { index }
            | BackendOperation::PutMapping { index }
            | BackendOperation::DropIndex { index } => index,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            BackendOperation::Upsert { .. } | BackendOperation::Delete { .. }
        )
    }
}

#[derive(Debug, Default, Clone)]
struct IndexState {
    mapping: Option<Value>,
    documents: BTreeMap<String, Value>,
    // documents as of the last refresh
    searchable: BTreeMap<String, Value>,
}

/// A search backend keeping every index in memory.
///
/// Writes become searchable only after a refresh, like a near-real-time
/// engine. The backend records every operation it receives and can be told
/// to fail, which makes it the backend of choice for tests. In dummy mode it
/// accepts and logs every operation without storing anything.
#[derive(Clone, Default)]
pub struct InMemorySearchBackend {
    inner: Arc<InMemoryBackendInner>,
}

#[derive(Default)]
struct InMemoryBackendInner {
    dummy: bool,
    indices: DashMap<String, IndexState>,
    operations: Mutex<Vec<BackendOperation>>,
    failing_writes: AtomicUsize,
    failing_indices: Mutex<HashSet<String>>,
    latency_ms: AtomicU64,
    reject_unmapped: AtomicBool,
}

impl InMemorySearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that accepts everything and stores nothing.
    pub fn dummy() -> Self {
        InMemorySearchBackend {
            inner: Arc::new(InMemoryBackendInner {
                dummy: true,
                ..Default::default()
            }),
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.inner.dummy
    }

    /// Every operation received so far, failed attempts included.
    pub fn operations(&self) -> Vec<BackendOperation> {
        self.inner.operations.lock().clone()
    }

    pub fn clear_operations(&self) {
        self.inner.operations.lock().clear();
    }

    /// Number of recorded operations equal to `operation`.
    pub fn count(&self, operation: &BackendOperation) -> usize {
        self.inner
            .operations
            .lock()
            .iter()
            .filter(|op| *op == operation)
            .count()
    }

    /// Stored document, visible or not.
    pub fn document(&self, index: &str, document_id: &str) -> Option<Value> {
        self.inner
            .indices
            .get(index)
            .and_then(|state| state.documents.get(document_id).cloned())
    }

    /// Document as a search would return it, i.e. as of the last refresh.
    pub fn searchable_document(&self, index: &str, document_id: &str) -> Option<Value> {
        self.inner
            .indices
            .get(index)
            .and_then(|state| state.searchable.get(document_id).cloned())
    }

    pub fn document_ids(&self, index: &str) -> Vec<String> {
        self.inner
            .indices
            .get(index)
            .map(|state| state.documents.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.inner
            .indices
            .get(index)
            .map(|state| state.documents.len())
            .unwrap_or(0)
    }

    pub fn mapping(&self, index: &str) -> Option<Value> {
        self.inner
            .indices
            .get(index)
            .and_then(|state| state.mapping.clone())
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.inner.indices.contains_key(index)
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.indices.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Makes the next `count` upserts and deletes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Makes every operation on `index` fail until [heal_index](Self::heal_index).
    pub fn fail_index(&self, index: &str) {
        self.inner.failing_indices.lock().insert(index.to_string());
    }

    pub fn heal_index(&self, index: &str) {
        self.inner.failing_indices.lock().remove(index);
    }

    /// Delays every operation, to exercise attempt timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Rejects document writes into indices without a mapping.
    pub fn set_reject_unmapped(&self, reject: bool) {
        self.inner.reject_unmapped.store(reject, Ordering::SeqCst);
    }

    async fn begin(&self, operation: BackendOperation) -> MeshResult<()> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let index = operation.index().to_string();
        let is_write = operation.is_write();
        self.inner.operations.lock().push(operation);

        if self.inner.failing_indices.lock().contains(&index) {
            return Err(backend_error(&format!("Index {} is unavailable", index)));
        }
        if is_write {
            let remaining = self.inner.failing_writes.load(Ordering::SeqCst);
            if remaining > 0
                && self
                    .inner
                    .failing_writes
                    .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return Err(backend_error("Scripted write failure"));
            }
            if !self.inner.dummy
                && self.inner.reject_unmapped.load(Ordering::SeqCst)
                && self.mapping(&index).is_none()
            {
                return Err(backend_error(&format!("Index {} has no mapping", index)));
            }
        }
        Ok(())
    }
}

fn backend_error(message: &str) -> MeshError {
    MeshError::new(message, ErrorKind::SearchBackendError)
}

#[async_trait]
impl SearchBackend for InMemorySearchBackend {
    async fn upsert_document(
        &self,
        index: &str,
        _document_type: &str,
        document_id: &str,
        document: Value,
    ) -> MeshResult<()> {
        self.begin(BackendOperation::Upsert {
            index: index.to_string(),
            document_id: document_id.to_string(),
        })
        .await?;
        if self.inner.dummy {
            log::debug!("Dummy upsert of {} into {}", document_id, index);
            return Ok(());
        }
        self.inner
            .indices
            .entry(index.to_string())
            .or_default()
            .documents
            .insert(document_id.to_string(), document);
        Ok(())
    }

    async fn delete_document(&self, index: &str, _document_type: &str, document_id: &str) -> MeshResult<()> {
        self.begin(BackendOperation::Delete {
            index: index.to_string(),
            document_id: document_id.to_string(),
        })
        .await?;
        if self.inner.dummy {
            return Ok(());
        }
        if let Some(mut state) = self.inner.indices.get_mut(index) {
            state.documents.remove(document_id);
        }
        Ok(())
    }

    async fn refresh_index(&self, index: &str) -> MeshResult<()> {
        self.begin(BackendOperation::Refresh {
            index: index.to_string(),
        })
        .await?;
        if let Some(mut state) = self.inner.indices.get_mut(index) {
            state.searchable = state.documents.clone();
        }
        Ok(())
    }

    async fn put_mapping(&self, index: &str, _document_type: &str, mapping: Value) -> MeshResult<()> {
        self.begin(BackendOperation::PutMapping {
            index: index.to_string(),
        })
        .await?;
        if self.inner.dummy {
            return Ok(());
        }
        self.inner.indices.entry(index.to_string()).or_default().mapping = Some(mapping);
        Ok(())
    }

    async fn drop_index(&self, index: &str) -> MeshResult<()> {
        self.begin(BackendOperation::DropIndex {
            index: index.to_string(),
        })
        .await?;
        self.inner.indices.remove(index);
        Ok(())
    }
}
