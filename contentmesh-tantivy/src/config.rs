//! Tantivy backend configuration.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default index writer heap size: 50 MB
pub const DEFAULT_INDEX_WRITER_HEAP_MB: usize = 50;

/// Default number of threads: 0 (auto-detect based on CPU cores)
pub const DEFAULT_NUM_THREADS: usize = 0;

/// Default search result limit: 10,000 documents
pub const DEFAULT_SEARCH_RESULT_LIMIT: usize = 10_000;

/// Smallest heap tantivy accepts per writer thread: 15 MB
pub const MIN_INDEX_WRITER_HEAP_MB: usize = 15;

/// Cloneable, thread-safe configuration of a [TantivySearchBackend](crate::TantivySearchBackend).
///
/// # Example
///
/// ```rust,ignore
/// use contentmesh_tantivy::TantivyConfig;
///
/// let config = TantivyConfig::new()
///     .with_index_writer_heap_size(100 * 1024 * 1024)
///     .with_num_threads(2)
///     .with_base_path("/var/lib/mesh/indices");
/// ```
#[derive(Clone)]
pub struct TantivyConfig {
    inner: Arc<TantivyConfigInner>,
}

struct TantivyConfigInner {
    /// Memory budget per index writer in bytes.
    index_writer_heap_size: AtomicUsize,

    /// Number of indexing threads (0 = auto-detect).
    num_threads: AtomicUsize,

    /// Maximum hits returned per search.
    search_result_limit: AtomicUsize,

    /// Directory holding one sub-directory per index. In-memory when unset.
    base_path: RwLock<Option<PathBuf>>,
}

impl TantivyConfig {
    /// Defaults: 50 MB writer heap, auto-detected threads, 10,000 hits,
    /// in-memory indices.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TantivyConfigInner::new()),
        }
    }

    #[inline]
    pub fn index_writer_heap_size(&self) -> usize {
        self.inner.index_writer_heap_size.load(Ordering::Relaxed)
    }

    /// Sets the writer heap in bytes, raised to the tantivy minimum.
    pub fn set_index_writer_heap_size(&self, size: usize) {
        let size = size.max(MIN_INDEX_WRITER_HEAP_MB * 1024 * 1024);
        self.inner
            .index_writer_heap_size
            .store(size, Ordering::Relaxed);
    }

    pub fn with_index_writer_heap_size(self, size: usize) -> Self {
        self.set_index_writer_heap_size(size);
        self
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.inner.num_threads.load(Ordering::Relaxed)
    }

    pub fn set_num_threads(&self, n: usize) {
        self.inner.num_threads.store(n, Ordering::Relaxed);
    }

    pub fn with_num_threads(self, n: usize) -> Self {
        self.set_num_threads(n);
        self
    }

    #[inline]
    pub fn search_result_limit(&self) -> usize {
        self.inner.search_result_limit.load(Ordering::Relaxed)
    }

    pub fn set_search_result_limit(&self, limit: usize) {
        self.inner
            .search_result_limit
            .store(limit.max(1), Ordering::Relaxed);
    }

    pub fn with_search_result_limit(self, limit: usize) -> Self {
        self.set_search_result_limit(limit);
        self
    }

    pub fn base_path(&self) -> Option<PathBuf> {
        self.inner.base_path.read().clone()
    }

    pub fn set_base_path(&self, path: impl Into<PathBuf>) {
        *self.inner.base_path.write() = Some(path.into());
    }

    pub fn with_base_path(self, path: impl Into<PathBuf>) -> Self {
        self.set_base_path(path);
        self
    }
}

impl Default for TantivyConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TantivyConfigInner {
    fn new() -> Self {
        Self {
            index_writer_heap_size: AtomicUsize::new(DEFAULT_INDEX_WRITER_HEAP_MB * 1024 * 1024),
            num_threads: AtomicUsize::new(DEFAULT_NUM_THREADS),
            search_result_limit: AtomicUsize::new(DEFAULT_SEARCH_RESULT_LIMIT),
            base_path: RwLock::new(None),
        }
    }
}
