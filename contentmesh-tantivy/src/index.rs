//! A single search index backed by tantivy.
//!
//! Documents are stored as their JSON source next to an id field and a
//! text field holding every string value of the document. Writes become
//! searchable on [SearchIndex::refresh].

use std::path::PathBuf;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tantivy::collector::TopDocs;
use tantivy::query::{QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value as TantivyValue, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use contentmesh::errors::{ErrorKind, MeshError, MeshResult};

use crate::config::TantivyConfig;

const ID_FIELD: &str = "_id";
const SOURCE_FIELD: &str = "_source";
const TEXT_FIELD: &str = "text";
const MAPPING_FILE: &str = "mapping.json";

/// A document returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub document_id: String,
    pub score: f32,
    pub source: Value,
}

pub(crate) struct SearchIndex {
    name: String,
    index: Index,
    writer: Mutex<Option<IndexWriter>>,
    reader: IndexReader,
    id_field: Field,
    source_field: Field,
    text_field: Field,
    path: Option<PathBuf>,
    mapping: RwLock<Option<Value>>,
    search_result_limit: usize,
}

impl SearchIndex {
    /// Opens the index `name` under the configured base path, creating it
    /// if missing, or creates it in memory.
    pub(crate) fn open(name: &str, config: &TantivyConfig) -> MeshResult<Self> {
        let mut schema_builder = Schema::builder();
        schema_builder.add_text_field(ID_FIELD, STRING | STORED);
        schema_builder.add_text_field(SOURCE_FIELD, STORED);
        schema_builder.add_text_field(TEXT_FIELD, TEXT);
        let schema = schema_builder.build();

        let (index, path, mapping) = match config.base_path() {
            Some(base) => {
                let path = base.join(name);
                std::fs::create_dir_all(&path).map_err(|e| {
                    backend_error(&format!("Failed to create index directory {:?}", path), e)
                })?;

                let index = if path.join("meta.json").exists() {
                    log::debug!("Opening existing search index at {:?}", path);
                    Index::open_in_dir(&path)
                        .map_err(|e| backend_error(&format!("Failed to open index {}", name), e))?
                } else {
                    log::debug!("Creating search index at {:?}", path);
                    Index::create_in_dir(&path, schema)
                        .map_err(|e| backend_error(&format!("Failed to create index {}", name), e))?
                };
                let mapping = read_mapping(&path)?;
                (index, Some(path), mapping)
            }
            None => {
                log::debug!("Creating in-memory search index {}", name);
                (Index::create_in_ram(schema), None, None)
            }
        };

        let schema = index.schema();
        let field = |field_name: &str| {
            schema
                .get_field(field_name)
                .map_err(|e| backend_error(&format!("Index {} lacks field {}", name, field_name), e))
        };
        let id_field = field(ID_FIELD)?;
        let source_field = field(SOURCE_FIELD)?;
        let text_field = field(TEXT_FIELD)?;

        let heap_size = config.index_writer_heap_size();
        let num_threads = config.num_threads();
        let writer: IndexWriter = if num_threads > 0 {
            index.writer_with_num_threads(num_threads, heap_size)
        } else {
            index.writer(heap_size)
        }
        .map_err(|e| backend_error(&format!("Failed to create writer of index {}", name), e))?;

        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| backend_error(&format!("Failed to create reader of index {}", name), e))?;

        Ok(SearchIndex {
            name: name.to_string(),
            index,
            writer: Mutex::new(Some(writer)),
            reader,
            id_field,
            source_field,
            text_field,
            path,
            mapping: RwLock::new(mapping),
            search_result_limit: config.search_result_limit(),
        })
    }

    pub(crate) fn mapping(&self) -> Option<Value> {
        self.mapping.read().clone()
    }

    pub(crate) fn put_mapping(&self, mapping: Value) -> MeshResult<()> {
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(&mapping)?;
            std::fs::write(path.join(MAPPING_FILE), bytes)?;
        }
        *self.mapping.write() = Some(mapping);
        Ok(())
    }

    pub(crate) fn upsert(&self, document_id: &str, document: &Value) -> MeshResult<()> {
        let mut doc = TantivyDocument::new();
        doc.add_text(self.id_field, document_id);
        doc.add_text(self.source_field, document.to_string());
        doc.add_text(self.text_field, collect_text(document));

        let mut writer_guard = self.writer.lock();
        let writer = writer_guard.as_mut().ok_or_else(|| self.closed_error())?;
        writer.delete_term(Term::from_field_text(self.id_field, document_id));
        writer
            .add_document(doc)
            .map_err(|e| backend_error(&format!("Failed to add {} to index {}", document_id, self.name), e))?;
        Ok(())
    }

    pub(crate) fn delete(&self, document_id: &str) -> MeshResult<()> {
        let mut writer_guard = self.writer.lock();
        let writer = writer_guard.as_mut().ok_or_else(|| self.closed_error())?;
        writer.delete_term(Term::from_field_text(self.id_field, document_id));
        Ok(())
    }

    /// Commits pending writes and reloads the reader.
    pub(crate) fn refresh(&self) -> MeshResult<()> {
        {
            let mut writer_guard = self.writer.lock();
            let writer = writer_guard.as_mut().ok_or_else(|| self.closed_error())?;
            writer
                .commit()
                .map_err(|e| backend_error(&format!("Failed to commit index {}", self.name), e))?;
        }
        self.reader
            .reload()
            .map_err(|e| backend_error(&format!("Failed to reload index {}", self.name), e))
    }

    /// The searchable version of a document.
    pub(crate) fn document(&self, document_id: &str) -> MeshResult<Option<Value>> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.id_field, document_id),
            IndexRecordOption::Basic,
        );
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(1))
            .map_err(|e| backend_error(&format!("Lookup in index {} failed", self.name), e))?;
        match top_docs.into_iter().next() {
            Some((_score, address)) => {
                let doc: TantivyDocument = searcher
                    .doc(address)
                    .map_err(|e| backend_error(&format!("Failed to load document from {}", self.name), e))?;
                Ok(Some(self.source_of(&doc)?))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn document_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub(crate) fn search(&self, query_str: &str) -> MeshResult<Vec<SearchHit>> {
        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        let query = query_parser.parse_query(query_str).map_err(|e| {
            MeshError::new(
                &format!("Failed to parse search query '{}': {}", query_str, e),
                ErrorKind::ValidationError,
            )
        })?;

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(self.search_result_limit))
            .map_err(|e| backend_error(&format!("Search in index {} failed", self.name), e))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| backend_error(&format!("Failed to load document from {}", self.name), e))?;
            let Some(document_id) = doc.get_first(self.id_field).and_then(|v| v.as_str()) else {
                continue;
            };
            hits.push(SearchHit {
                document_id: document_id.to_string(),
                score,
                source: self.source_of(&doc)?,
            });
        }
        Ok(hits)
    }

    /// Discards the writer and removes the index directory.
    pub(crate) fn destroy(&self) -> MeshResult<()> {
        // dropping the writer releases the directory lock
        drop(self.writer.lock().take());
        if let Some(path) = &self.path {
            if path.exists() {
                std::fs::remove_dir_all(path).map_err(|e| {
                    backend_error(&format!("Failed to remove index directory {:?}", path), e)
                })?;
            }
        }
        Ok(())
    }

    fn source_of(&self, doc: &TantivyDocument) -> MeshResult<Value> {
        let source = doc
            .get_first(self.source_field)
            .and_then(|v| v.as_str())
            .unwrap_or("null");
        Ok(serde_json::from_str(source)?)
    }

    fn closed_error(&self) -> MeshError {
        MeshError::new(
            &format!("Index {} is closed", self.name),
            ErrorKind::SearchBackendError,
        )
    }
}

fn read_mapping(path: &std::path::Path) -> MeshResult<Option<Value>> {
    let file = path.join(MAPPING_FILE);
    if !file.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(file)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn backend_error(message: &str, cause: impl std::fmt::Display) -> MeshError {
    log::error!("{}: {}", message, cause);
    MeshError::new(&format!("{}: {}", message, cause), ErrorKind::SearchBackendError)
}

/// Joins every string leaf of a document, depth first.
fn collect_text(value: &Value) -> String {
    fn walk(value: &Value, parts: &mut Vec<String>) {
        match value {
            Value::String(s) => parts.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| walk(v, parts)),
            Value::Object(map) => map.values().for_each(|v| walk(v, parts)),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    walk(value, &mut parts);
    parts.join("\n")
}
