//! [SearchBackend] implementation over a set of tantivy indices.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use contentmesh::errors::{ErrorKind, MeshError, MeshResult};
use contentmesh::search::SearchBackend;

use crate::config::TantivyConfig;
use crate::index::{SearchHit, SearchIndex};

/// Search backend keeping one tantivy index per mesh index name.
///
/// Tantivy work is blocking and runs on the blocking thread pool of the
/// current tokio runtime. An index is created by its first mapping or
/// write; writes become visible on refresh.
#[derive(Clone)]
pub struct TantivySearchBackend {
    inner: Arc<TantivyBackendInner>,
}

struct TantivyBackendInner {
    config: TantivyConfig,
    indices: RwLock<HashMap<String, Arc<SearchIndex>>>,
}

impl TantivySearchBackend {
    pub fn new(config: TantivyConfig) -> Self {
        TantivySearchBackend {
            inner: Arc::new(TantivyBackendInner {
                config,
                indices: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &TantivyConfig {
        &self.inner.config
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.inner.indices.read().contains_key(index)
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.indices.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn mapping(&self, index: &str) -> Option<Value> {
        self.inner.existing(index).and_then(|i| i.mapping())
    }

    /// Searches the text of every document of `index`.
    pub async fn search(&self, index: &str, query: &str) -> MeshResult<Vec<SearchHit>> {
        let Some(search_index) = self.inner.existing(index) else {
            return Ok(Vec::new());
        };
        let query = query.to_string();
        blocking(move || search_index.search(&query)).await
    }

    /// The searchable version of a document.
    pub async fn document(&self, index: &str, document_id: &str) -> MeshResult<Option<Value>> {
        let Some(search_index) = self.inner.existing(index) else {
            return Ok(None);
        };
        let document_id = document_id.to_string();
        blocking(move || search_index.document(&document_id)).await
    }

    pub fn document_count(&self, index: &str) -> u64 {
        self.inner
            .existing(index)
            .map(|i| i.document_count())
            .unwrap_or(0)
    }

    async fn open(&self, index: &str) -> MeshResult<Arc<SearchIndex>> {
        if let Some(existing) = self.inner.existing(index) {
            return Ok(existing);
        }
        let inner = self.inner.clone();
        let name = index.to_string();
        blocking(move || inner.open(&name)).await
    }
}

impl TantivyBackendInner {
    fn existing(&self, index: &str) -> Option<Arc<SearchIndex>> {
        self.indices.read().get(index).cloned()
    }

    fn open(&self, index: &str) -> MeshResult<Arc<SearchIndex>> {
        let mut indices = self.indices.write();
        if let Some(existing) = indices.get(index) {
            return Ok(existing.clone());
        }
        let search_index = Arc::new(SearchIndex::open(index, &self.config)?);
        indices.insert(index.to_string(), search_index.clone());
        log::info!("Opened search index {}", index);
        Ok(search_index)
    }
}

#[async_trait]
impl SearchBackend for TantivySearchBackend {
    async fn upsert_document(
        &self,
        index: &str,
        _document_type: &str,
        document_id: &str,
        document: Value,
    ) -> MeshResult<()> {
        let search_index = self.open(index).await?;
        let document_id = document_id.to_string();
        blocking(move || search_index.upsert(&document_id, &document)).await
    }

    async fn delete_document(&self, index: &str, _document_type: &str, document_id: &str) -> MeshResult<()> {
        let Some(search_index) = self.inner.existing(index) else {
            return Ok(());
        };
        let document_id = document_id.to_string();
        blocking(move || search_index.delete(&document_id)).await
    }

    async fn refresh_index(&self, index: &str) -> MeshResult<()> {
        let Some(search_index) = self.inner.existing(index) else {
            return Ok(());
        };
        blocking(move || search_index.refresh()).await
    }

    async fn put_mapping(&self, index: &str, _document_type: &str, mapping: Value) -> MeshResult<()> {
        let search_index = self.open(index).await?;
        blocking(move || search_index.put_mapping(mapping)).await
    }

    async fn drop_index(&self, index: &str) -> MeshResult<()> {
        let removed = self.inner.indices.write().remove(index);
        if let Some(search_index) = removed {
            blocking(move || search_index.destroy()).await?;
            log::info!("Dropped search index {}", index);
        }
        Ok(())
    }
}

async fn blocking<T, F>(task: F) -> MeshResult<T>
where
    F: FnOnce() -> MeshResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|e| {
        MeshError::new(
            &format!("Search task failed: {}", e),
            ErrorKind::SearchBackendError,
        )
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> TantivySearchBackend {
        TantivySearchBackend::new(
            TantivyConfig::new()
                .with_num_threads(1)
                .with_index_writer_heap_size(15 * 1024 * 1024),
        )
    }

    #[tokio::test]
    async fn test_upsert_refresh_search() {
        let backend = backend();
        backend
            .put_mapping("node-a", "default", json!({"default": {"properties": {}}}))
            .await
            .unwrap();
        backend
            .upsert_document("node-a", "default", "n1-en", json!({"fields": {"title": "rust search"}}))
            .await
            .unwrap();
        assert!(backend.search("node-a", "rust").await.unwrap().is_empty());

        backend.refresh_index("node-a").await.unwrap();
        let hits = backend.search("node-a", "rust").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "n1-en");
        assert_eq!(hits[0].source["fields"]["title"], "rust search");
    }

    #[tokio::test]
    async fn test_delete_and_missing_index() {
        let backend = backend();
        backend
            .delete_document("absent", "default", "x")
            .await
            .unwrap();
        backend
            .upsert_document("node-b", "default", "n1-de", json!({"t": "hallo"}))
            .await
            .unwrap();
        backend.refresh_index("node-b").await.unwrap();
        assert_eq!(backend.document_count("node-b"), 1);

        backend.delete_document("node-b", "default", "n1-de").await.unwrap();
        backend.refresh_index("node-b").await.unwrap();
        assert_eq!(backend.document_count("node-b"), 0);
        assert!(backend.document("node-b", "n1-de").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drop_index() {
        let dir = tempfile::tempdir().unwrap();
        let backend = TantivySearchBackend::new(
            TantivyConfig::new()
                .with_num_threads(1)
                .with_base_path(dir.path()),
        );
        backend
            .put_mapping("node-c", "default", json!({}))
            .await
            .unwrap();
        assert!(backend.has_index("node-c"));
        assert!(dir.path().join("node-c").exists());

        backend.drop_index("node-c").await.unwrap();
        assert!(!backend.has_index("node-c"));
        assert!(!dir.path().join("node-c").exists());
        backend.drop_index("node-c").await.unwrap();
    }

    #[tokio::test]
    async fn test_index_names_sorted() {
        let backend = backend();
        for name in ["node-z", "node-a"] {
            backend.put_mapping(name, "default", json!({})).await.unwrap();
        }
        assert_eq!(backend.index_names(), vec!["node-a", "node-z"]);
        assert_eq!(backend.mapping("node-a"), Some(json!({})));
    }
}
