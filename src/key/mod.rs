//! Content-Addressed Identity
//!
//! Keys identify cached items. Structured items are addressed by
//! [`CacheKey`] (bucket + hash); older callers use flat [`LegacyKey`] strings.

mod bucket;
mod cache_key;
mod hash;
mod legacy;

pub use bucket::{CacheBucket, MAX_BUCKET_NAME_LEN};
pub use cache_key::{CacheKey, ValueId};
pub use hash::{IoHash, IoHashBuilder};
pub use legacy::{sanitize, LegacyKey};
