#![allow(
    dead_code,
    clippy::new_without_default,
    clippy::len_without_is_empty,
)]
//! # ContentMesh - Versioned Content with Live Search Indices
//!
//! ContentMesh keeps the content of a multi-project CMS, its schemas and a
//! search index consistent with each other while schemas evolve.
//!
//! ## Key Features
//!
//! - **Schema Versioning**: Every schema is a linked chain of immutable
//!   versions joined by explicit change sets
//! - **Content Migration**: Content of every release is migrated to a new
//!   schema version concurrently, release by release, with partial failures
//!   reported per content unit
//! - **Index Resolution**: Mutation events with partial context expand into
//!   the exact set of search indices and documents they affect
//! - **Index Synchronization**: A background queue applies those obligations
//!   with deduplication, per-document ordering, retry with backoff, and a
//!   dead-letter log
//! - **Pluggable Search**: Any [search::SearchBackend]; an in-memory backend is
//!   built in and Tantivy lives in the `contentmesh-tantivy` crate
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use contentmesh::fields;
//! use contentmesh::mesh::ContentMesh;
//! use contentmesh::schema::{FieldSchema, FieldType, SchemaDefinition};
//!
//! # async fn run() -> contentmesh::errors::MeshResult<()> {
//! let mesh = ContentMesh::builder().build()?;
//! let (project, release) = mesh.create_project("site", &["en"])?;
//! let schema = mesh.create_schema(
//!     SchemaDefinition::new("page").with_field(FieldSchema::new("title", FieldType::String)),
//! )?;
//! mesh.assign_schema(&release.uuid(), &schema.uuid(), None)?;
//! mesh.create_node(&project.uuid(), &release.uuid(), &schema.uuid(), "en", fields! { "title" => "Home" })?;
//! mesh.wait_for_sync().await;
//! mesh.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Pattern
//!
//! Long-lived services ([mesh::ContentMesh], [store::MeshStore],
//! [search::SyncQueue], [migration::MigrationEngine]) are thin handles over an
//! `Arc` of their state. Clones are cheap and share everything.
//!
//! ## Module Organization
//!
//! - [`common`] - Field values, lock registry, event bus and constants
//! - [`content`] - Projects, releases, nodes and field containers
//! - [`errors`] - Error types and result definitions
//! - [`event`] - Mutation events and their index context
//! - [`mesh`] - The content mesh facade
//! - [`mesh_builder`] - Builder for the content mesh
//! - [`mesh_config`] - Runtime configuration
//! - [`migration`] - Migration engine and field transforms
//! - [`schema`] - Schema definitions, changes and version chains
//! - [`search`] - Index resolution, documents and the sync queue
//! - [`store`] - Transactional content store

pub mod common;
pub mod content;
pub mod errors;
pub mod event;
pub mod mesh;
pub mod mesh_builder;
pub mod mesh_config;
pub mod migration;
pub mod schema;
pub mod search;
pub mod store;
