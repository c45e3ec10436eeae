//! Cached Items
//!
//! Records, values and the policies governing how requests treat them.

mod cache_record;
pub mod compression;
pub mod package;
mod policy;
mod value;

pub use cache_record::{CacheRecord, CacheRecordBuilder};
pub use compression::{CompressionManager, CompressionMethod};
pub use package::{PackageLimits, Placement};
pub use policy::CachePolicy;
pub use value::{CompressedBuffer, Value};
