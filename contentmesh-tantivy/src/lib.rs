//! # ContentMesh Tantivy - Search Backend for the Content Mesh
//!
//! Implements the mesh's `SearchBackend` on top of Tantivy, one Tantivy
//! index per mesh index. Documents keep their JSON source; every string
//! value is indexed for full-text search.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use contentmesh::mesh::ContentMesh;
//! use contentmesh_tantivy::{TantivyConfig, TantivySearchBackend};
//!
//! let backend = TantivySearchBackend::new(
//!     TantivyConfig::new().with_base_path("/var/lib/mesh/indices"),
//! );
//! let mesh = ContentMesh::builder()
//!     .search_backend(backend.clone())
//!     .build()?;
//!
//! // later
//! let hits = backend.search(&index_name, "release notes").await?;
//! ```

pub mod backend;
pub mod config;
pub mod index;

pub use backend::TantivySearchBackend;
pub use config::TantivyConfig;
pub use index::SearchHit;
