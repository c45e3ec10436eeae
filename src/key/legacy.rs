//! Legacy String Keys
//!
//! Flat string keys from before structured records existed. They are stored
//! under a three-level numeric directory derived from a CRC of the key.

use std::fmt;
use std::path::PathBuf;

/// Legacy flat cache key
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LegacyKey(String);

impl LegacyKey {
    /// Wrap a key string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Original key text
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the original key in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the empty key
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key made filesystem-safe; bytes outside `[A-Za-z0-9_]` become `$XX`
    pub fn sanitized(&self) -> String {
        sanitize(&self.0)
    }

    /// CRC of the uppercased sanitized key, used for directory sharding
    pub fn crc(&self) -> u32 {
        crc32fast::hash(self.sanitized().to_ascii_uppercase().as_bytes())
    }

    /// Relative path `<d0>/<d1>/<d2>/<SANITIZED_KEY>.udd`
    pub fn relative_path(&self) -> PathBuf {
        let crc = self.crc();
        let mut path = PathBuf::new();
        path.push(((crc / 100) % 10).to_string());
        path.push(((crc / 10) % 10).to_string());
        path.push((crc % 10).to_string());
        path.push(format!("{}.udd", self.sanitized()));
        path
    }
}

/// Escape every byte outside `[A-Za-z0-9_]` as `$XX`
pub fn sanitize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("${:02X}", b));
        }
    }
    out
}

impl fmt::Display for LegacyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LegacyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LegacyKey({})", self.0)
    }
}

impl From<&str> for LegacyKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for LegacyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}
