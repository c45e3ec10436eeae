//! CoucheStor DDC - Multi-tier Derived Data Cache
//!
//! A content-addressable cache for expensive build artifacts. Data is
//! identified by a key derived from its inputs and served from a graph of
//! storage tiers, fastest first.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Cache (façade)                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                     HierarchicalBackend (root)                    │
//! │   ┌──────────┐   ┌──────────────┐   ┌───────────┐   ┌────────┐   │
//! │   │  Memory  │──▶│  KeyLength   │──▶│  ReadPak  │──▶│ Shared │   │
//! │   │  (Boot)  │   │ (FileSystem) │   │ (archive) │   │  (FS)  │   │
//! │   └──────────┘   └──────────────┘   └───────────┘   └────────┘   │
//! │        ▲ backfill on hit              cascade on hit ─────▶       │
//! └──────────────────────────────────────────────────────────────────┘
//!              CacheStoreMaintainer ──▶ ages out unused files
//! ```
//!
//! # Modules
//!
//! - [`key`] - Content hashes, buckets and cache keys
//! - [`record`] - Records, values, policies and their packaging
//! - [`backend`] - The backend trait, leaf stores and decorators
//! - [`graph`] - Backend graph configuration and assembly
//! - [`cache`] - Request façade
//! - [`metrics`] - Prometheus exposition of usage statistics
//! - [`error`] - Error types

pub mod backend;
pub mod cache;
pub mod error;
pub mod graph;
pub mod key;
pub mod metrics;
pub mod record;

// Re-export commonly used types
pub use backend::{CacheBackend, PutStatus, SharedBackend, SpeedClass, UsageStats};
pub use cache::{Cache, CacheTask, Priority, RequestOwner, Status};
pub use error::{Error, Result};
pub use graph::{CacheGraph, GraphBuilder, GraphConfig};
pub use key::{CacheBucket, CacheKey, IoHash, LegacyKey, ValueId};
pub use record::{CachePolicy, CacheRecord, Value};
