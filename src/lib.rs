//! # kbase
//!
//! A knowledge consistency and access-control engine.
//!
//! kbase keeps three stores in agreement about a corpus of uploaded
//! documents: a content-addressed blob store for the raw bytes, a SQLite
//! index for metadata and permission grants, and a vector store of
//! embedded text segments for similarity search. Uploads are deduplicated
//! by content checksum, ingestion runs asynchronously through a retryable
//! state machine, and every read and mutation passes an ordered
//! capability check (NONE < READONLY < READWRITE < OWNER) with permission
//! grants projected into vector-store metadata so search results are
//! filtered at the store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ┌───────────────────┐    ┌─────────────┐
//! │ AccessPolicy │──▶│ KnowledgeManager   │──▶│  SQLite      │
//! │ (per caller) │    │ dedup + ordering  │    │ index+grants│
//! └──────────────┘    └──┬───────────┬────┘    └─────────────┘
//!                        │           │
//!                        ▼           ▼
//!                 ┌──────────┐  ┌──────────────┐
//!                 │ BlobStore│  │ Ingestion    │
//!                 │ local/S3 │  │ segment+embed│
//!                 └──────────┘  └──────┬───────┘
//!                                      ▼
//!                               ┌──────────────┐
//!                               │ VectorStore  │
//!                               │ token-scoped │
//!                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`permission`] | Capability ordering and token projection |
//! | [`error`] | Crate error type |
//! | [`index`] | SQLite knowledge index |
//! | [`storage`] | Content-addressed blob stores (local, S3) |
//! | [`vector`] | Vector stores with permission-token filtering |
//! | [`segment`] | Text segmentation |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`ingest`] | Asynchronous ingestion dispatch |
//! | [`manager`] | Cross-store orchestration |
//! | [`access`] | Per-request access control |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod access;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod manager;
pub mod migrate;
pub mod models;
pub mod permission;
pub mod segment;
pub mod storage;
pub mod vector;
