//! Value Compression
//!
//! LZ4 compression with automatic fallback to stored (uncompressed) data.
//!
//! # Example
//!
//! ```
//! use couchestor_ddc::record::compression::{CompressionManager, CompressionMethod};
//!
//! let manager = CompressionManager::new();
//!
//! let data = b"Derived data derived data derived data derived data derived data!";
//! let (compressed, method) = manager.compress(data);
//!
//! let decompressed = manager.decompress(&compressed, method).unwrap();
//! assert_eq!(decompressed.as_ref(), data);
//! ```

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

// =============================================================================
// Compression Method
// =============================================================================

/// Compression methods understood by stored buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionMethod {
    /// Stored as-is
    None,
    /// LZ4 block compression
    #[default]
    Lz4,
}

impl CompressionMethod {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Lz4 => "lz4",
        }
    }

    /// Stable on-disk identifier
    pub fn id(&self) -> u8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Lz4 => 1,
        }
    }

    /// Parse an on-disk identifier
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Lz4),
            other => Err(Error::corruption(
                "compressed buffer",
                format!("unknown compression method {}", other),
            )),
        }
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Method tried first
    pub default_method: CompressionMethod,
    /// Minimum size to compress (smaller values are stored)
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_method: CompressionMethod::Lz4,
            min_size_bytes: 256,
            level: 4,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the method identifier
    fn method(&self) -> CompressionMethod;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 compressor; blocks carry their uncompressed size as a prefix
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create with custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::with_level(4)
    }
}

impl Compressor for Lz4Compressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

static DEFAULT_MANAGER: Lazy<CompressionManager> = Lazy::new(CompressionManager::new);

/// Manager for compression operations with fallback support
pub struct CompressionManager {
    config: CompressionConfig,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    /// Create a new compression manager with default config
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            noop: NoopCompressor,
            config,
        }
    }

    /// Process-wide manager with the default configuration
    pub fn shared() -> &'static CompressionManager {
        &DEFAULT_MANAGER
    }

    fn compressor(&self, method: CompressionMethod) -> &dyn Compressor {
        match method {
            CompressionMethod::None => &self.noop,
            CompressionMethod::Lz4 => &self.lz4,
        }
    }

    /// Compress using the default method
    ///
    /// Falls back to stored data when the input is small, when compression
    /// fails, or when the result would not be smaller.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionMethod) {
        if (data.len() as u64) < self.config.min_size_bytes {
            return (Bytes::copy_from_slice(data), CompressionMethod::None);
        }

        match self.compressor(self.config.default_method).compress(data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), self.config.default_method)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionMethod::None),
            Err(e) => {
                tracing::warn!("Compression failed, storing uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionMethod::None)
            }
        }
    }

    /// Decompress data
    pub fn decompress(&self, data: &[u8], method: CompressionMethod) -> Result<Bytes> {
        if method == CompressionMethod::None {
            return Ok(Bytes::copy_from_slice(data));
        }
        let decompressed = self.compressor(method).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}
