//! Backend Graph
//!
//! The cache is assembled from a text description of named nodes:
//!
//! ```text
//!   GraphConfig::parse ──► GraphConfig (validated) ──► GraphBuilder::build ──► CacheGraph
//! ```

pub mod builder;
pub mod config;

pub use builder::{CacheGraph, GraphBuilder};
pub use config::{GraphConfig, NodeConfig, NodeType, DEFAULT_ROOT};
