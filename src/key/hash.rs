//! Content Hash
//!
//! 160-bit content hash used as the identity of every cached item.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// 160-bit BLAKE3-derived content hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct IoHash([u8; IoHash::LEN]);

impl IoHash {
    /// Hash length in bytes
    pub const LEN: usize = 20;

    /// The all-zero hash
    pub const ZERO: IoHash = IoHash([0; IoHash::LEN]);

    /// Hash a buffer
    pub fn hash(data: &[u8]) -> Self {
        let mut builder = IoHashBuilder::new();
        builder.update(data);
        builder.finalize()
    }

    /// Wrap raw hash bytes
    pub const fn from_bytes(bytes: [u8; IoHash::LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, failing if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; IoHash::LEN] = bytes.try_into().map_err(|_| {
            Error::corruption("hash", format!("expected {} bytes, got {}", Self::LEN, bytes.len()))
        })?;
        Ok(Self(array))
    }

    /// Raw hash bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; IoHash::LEN] {
        &self.0
    }

    /// Lowercase hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns true for the all-zero hash
    pub fn is_zero(&self) -> bool {
        self.0 == [0; IoHash::LEN]
    }
}

impl fmt::Display for IoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoHash({})", self.to_hex())
    }
}

impl FromStr for IoHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Config(format!("invalid hash '{}': {}", s, e)))?;
        Self::from_slice(&bytes).map_err(|_| Error::Config(format!("invalid hash length '{}'", s)))
    }
}

/// Incremental hash builder
pub struct IoHashBuilder(blake3::Hasher);

impl IoHashBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    /// Finish hashing, truncating the BLAKE3 digest to 160 bits
    pub fn finalize(&self) -> IoHash {
        let digest = self.0.finalize();
        let mut out = [0u8; IoHash::LEN];
        out.copy_from_slice(&digest.as_bytes()[..IoHash::LEN]);
        IoHash(out)
    }
}

impl Default for IoHashBuilder {
    fn default() -> Self {
        Self::new()
    }
}
