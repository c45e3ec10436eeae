//! Cache Key Types
//!
//! A [`CacheKey`] is the total identity of a cached record or value: a bucket
//! plus a content hash. It is immutable once created.

use std::fmt;
use std::str::FromStr;

use super::bucket::CacheBucket;
use super::hash::IoHash;
use crate::error::{Error, Result};

/// Cache key - composite of bucket and content hash
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    bucket: CacheBucket,
    hash: IoHash,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(bucket: CacheBucket, hash: IoHash) -> Self {
        Self { bucket, hash }
    }

    /// Convenience constructor interning the bucket and hashing `content`
    pub fn from_content(bucket: &str, content: &[u8]) -> Result<Self> {
        Ok(Self::new(CacheBucket::new(bucket)?, IoHash::hash(content)))
    }

    /// Get bucket
    #[inline]
    pub fn bucket(&self) -> &CacheBucket {
        &self.bucket
    }

    /// Get hash
    #[inline]
    pub fn hash(&self) -> &IoHash {
        &self.hash
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.hash)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({}/{})", self.bucket, self.hash)
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    /// Parse `bucket/hexhash`
    fn from_str(s: &str) -> Result<Self> {
        let (bucket, hash) = s
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("cache key '{}' is not bucket/hash", s)))?;
        Ok(Self::new(CacheBucket::new(bucket)?, hash.parse()?))
    }
}

/// Identifier of a value inside a record
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ValueId([u8; ValueId::LEN]);

impl ValueId {
    /// Id length in bytes
    pub const LEN: usize = 12;

    /// Wrap raw id bytes
    pub const fn from_bytes(bytes: [u8; ValueId::LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a stable id from a name
    pub fn from_name(name: &str) -> Self {
        let digest = blake3::hash(name.as_bytes());
        let mut out = [0u8; ValueId::LEN];
        out.copy_from_slice(&digest.as_bytes()[..ValueId::LEN]);
        Self(out)
    }

    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8; ValueId::LEN] {
        &self.0
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueId({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_cache_key_creation() {
        let key = CacheKey::from_content("Textures", b"pixels").unwrap();
        assert_eq!(key.bucket().as_str(), "Textures");
        assert_eq!(*key.hash(), IoHash::hash(b"pixels"));
    }

    #[test]
    fn test_cache_key_equality_ignores_bucket_case() {
        let key1 = CacheKey::from_content("Meshes", b"data").unwrap();
        let key2 = CacheKey::from_content("MESHES", b"data").unwrap();
        let key3 = CacheKey::from_content("Meshes", b"other").unwrap();

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);

        let set: HashSet<_> = [key1, key2, key3].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_cache_key_parse_roundtrip() {
        let key = CacheKey::from_content("Audio", b"wave").unwrap();
        let parsed: CacheKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert!("nohash".parse::<CacheKey>().is_err());
    }

    #[test]
    fn test_value_id_from_name() {
        assert_eq!(ValueId::from_name("Mip0"), ValueId::from_name("Mip0"));
        assert_ne!(ValueId::from_name("Mip0"), ValueId::from_name("Mip1"));
        assert_eq!(ValueId::from_name("Mip0").to_string().len(), 24);
    }
}
