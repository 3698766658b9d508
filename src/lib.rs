//! # worktrail
//!
//! The storage, sync and caching engine of a local developer-activity
//! tracker. It ingests git history with first-write-wins branch ownership,
//! keeps a structural index of a working tree current using content
//! fingerprints, searches both by embedding similarity, and caches
//! day/week/month/branch worklog digests of the current user's commits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ SourceControl│──▶│    ingest    │──▶│             │
//! │  (git CLI)   │   │ own+cursor   │   │   SQLite    │
//! └──────────────┘   └──────────────┘   │  per profile│
//! ┌──────────────┐   ┌──────────────┐   │   (WAL)     │
//! │   FileTree   │──▶│   indexer    │──▶│             │
//! │  (walkdir)   │   │ fingerprints │   └──────┬──────┘
//! └──────────────┘   └──────────────┘          │
//!         ┌───────────────┐            ┌───────┴────────┐
//!         │  Summarizer   │◀──────────▶│ search/worklog │
//!         │ openai/ollama │            │     stats      │
//!         └───────────────┘            └────────────────┘
//! ```
//!
//! All writes for a profile go through one [`manager::Writer`], guarded by a
//! lock file; readers use independent read-only connections.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`manager`] | Profiles, writer lock, reader pools |
//! | [`db`] | Connections and the transaction helper |
//! | [`migrate`] | Schema creation and additive migrations |
//! | [`models`] | Core data types |
//! | [`store`] | Entity persistence |
//! | [`scm`] | Source-control collaborator and the git CLI backend |
//! | [`tree`] | File-tree collaborator over the working directory |
//! | [`summarize`] | Summarizer collaborator and HTTP providers |
//! | [`embedding`] | Vector encoding and cosine similarity |
//! | [`ingest`] | Commit ingestion and commit summaries |
//! | [`indexer`] | Fingerprint-driven structural reindex |
//! | [`search`] | Semantic and substring search |
//! | [`worklog`] | Worklog digest cache and activity listings |
//! | [`stats`] | Aggregate statistics |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod ingest;
pub mod manager;
pub mod migrate;
pub mod models;
pub mod scm;
pub mod search;
pub mod stats;
pub mod store;
pub mod summarize;
pub mod tree;
pub mod worklog;

pub use error::{EngineError, Result};
