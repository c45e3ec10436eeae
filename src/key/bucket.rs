//! Cache Buckets
//!
//! Buckets are interned: every spelling of a bucket name that is equal
//! ignoring ASCII case resolves to the same shared string.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Maximum bucket name length in bytes
pub const MAX_BUCKET_NAME_LEN: usize = 255;

/// Intern table keyed by the lowercase spelling
static BUCKETS: Lazy<RwLock<HashMap<String, Arc<str>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Interned, case-insensitive bucket name
#[derive(Clone)]
pub struct CacheBucket(Arc<str>);

impl CacheBucket {
    /// Intern a bucket name, validating it first
    pub fn new(name: &str) -> Result<Self> {
        Self::validate(name)?;
        let folded = name.to_ascii_lowercase();

        if let Some(existing) = BUCKETS.read().get(&folded) {
            return Ok(Self(existing.clone()));
        }

        let mut table = BUCKETS.write();
        let interned = table
            .entry(folded)
            .or_insert_with(|| Arc::from(name))
            .clone();
        Ok(Self(interned))
    }

    /// Check that a name is 1-255 ASCII alphanumeric characters
    pub fn validate(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidBucket {
                name: name.to_string(),
                reason: "empty".to_string(),
            });
        }
        if name.len() > MAX_BUCKET_NAME_LEN {
            return Err(Error::InvalidBucket {
                name: name.to_string(),
                reason: format!("longer than {} bytes", MAX_BUCKET_NAME_LEN),
            });
        }
        if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidBucket {
                name: name.to_string(),
                reason: format!("invalid character '{}'", c),
            });
        }
        Ok(())
    }

    /// Name as first interned
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if both handles share the interned storage
    pub fn shares_storage_with(&self, other: &CacheBucket) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for CacheBucket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for CacheBucket {}

impl Hash for CacheBucket {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl PartialOrd for CacheBucket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheBucket {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.0.bytes().map(|b| b.to_ascii_lowercase());
        let b = other.0.bytes().map(|b| b.to_ascii_lowercase());
        a.cmp(b)
    }
}

impl fmt::Display for CacheBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheBucket({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_case_insensitive_interning() {
        let a = CacheBucket::new("ShaderMaps").unwrap();
        let b = CacheBucket::new("SHADERMAPS").unwrap();
        assert_eq!(a, b);
        assert!(a.shares_storage_with(&b));
        assert_eq!(b.as_str(), "ShaderMaps");
    }

    #[test]
    fn test_invalid_names() {
        assert!(CacheBucket::new("").is_err());
        assert!(CacheBucket::new("has space").is_err());
        assert!(CacheBucket::new("dash-ed").is_err());
        assert!(CacheBucket::new(&"a".repeat(256)).is_err());
        assert!(CacheBucket::new(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_ordering_ignores_case() {
        let a = CacheBucket::new("alpha").unwrap();
        let b = CacheBucket::new("Beta").unwrap();
        assert!(a < b);
    }

    proptest! {
        #[test]
        fn prop_equal_ignoring_case_shares_storage(name in "[a-zA-Z0-9]{1,32}") {
            let lower = CacheBucket::new(&name.to_ascii_lowercase()).unwrap();
            let upper = CacheBucket::new(&name.to_ascii_uppercase()).unwrap();
            prop_assert_eq!(&lower, &upper);
            prop_assert!(lower.shares_storage_with(&upper));
        }
    }
}
