//! On-Disk Layout
//!
//! ```text
//! <root>/
//! ├── Content/<h0>/<h1>/<rest>.blob          content blobs (hash trailer)
//! ├── Buckets/<bucket>/<h0>/<h1>/<rest>.rec  record packages (hash trailer)
//! ├── Buckets/<bucket>/<h0>/<h1>/<rest>.val  value packages (hash trailer)
//! └── <d0>/<d1>/<d2>/<SANITIZED_KEY>.udd     legacy keys (crc trailer)
//! ```
//!
//! `h0` and `h1` are the first two hash bytes in hex, `d0..d2` are decimal
//! digits of the CRC of the legacy key.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::key::{CacheBucket, CacheKey, IoHash, LegacyKey};

/// Directory holding content blobs
pub const CONTENT_DIR: &str = "Content";
/// Directory holding one subdirectory per bucket
pub const BUCKETS_DIR: &str = "Buckets";

/// Longest relative path accepted for a legacy key
pub const MAX_LEGACY_PATH_LEN: usize = 200;

const CONTENT_EXT: &str = "blob";
const RECORD_EXT: &str = "rec";
const VALUE_EXT: &str = "val";
const TEMP_EXT: &str = "tmp";

/// Path computations for one store root
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of the content blobs
    pub fn content_root(&self) -> PathBuf {
        self.root.join(CONTENT_DIR)
    }

    /// Root of every bucket directory
    pub fn buckets_root(&self) -> PathBuf {
        self.root.join(BUCKETS_DIR)
    }

    /// Directory of one bucket
    ///
    /// Buckets compare case-insensitively, so the directory name is folded.
    pub fn bucket_root(&self, bucket: &CacheBucket) -> PathBuf {
        self.buckets_root()
            .join(bucket.as_str().to_ascii_lowercase())
    }

    /// Path of a content blob
    pub fn content_path(&self, hash: &IoHash) -> PathBuf {
        sharded(self.content_root(), hash, CONTENT_EXT)
    }

    /// Path of a record package
    pub fn record_path(&self, key: &CacheKey) -> PathBuf {
        sharded(self.bucket_root(key.bucket()), key.hash(), RECORD_EXT)
    }

    /// Path of a value package
    pub fn value_path(&self, key: &CacheKey) -> PathBuf {
        sharded(self.bucket_root(key.bucket()), key.hash(), VALUE_EXT)
    }

    /// Path of a legacy key; rejects keys whose path would be too long
    pub fn legacy_path(&self, key: &LegacyKey) -> Result<PathBuf> {
        let relative = key.relative_path();
        let len = relative.as_os_str().len();
        if len > MAX_LEGACY_PATH_LEN {
            return Err(Error::Capacity {
                what: format!("legacy key path for '{}'", key),
                len,
                limit: MAX_LEGACY_PATH_LEN,
            });
        }
        Ok(self.root.join(relative))
    }

    /// Unique temporary file next to `target`
    pub fn temp_path(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.{}", uuid::Uuid::new_v4().simple(), TEMP_EXT));
        target.with_file_name(name)
    }

    /// Returns true for files left behind by an interrupted write
    pub fn is_temp_file(path: &Path) -> bool {
        path.extension().map(|e| e == TEMP_EXT).unwrap_or(false)
    }
}

fn sharded(base: PathBuf, hash: &IoHash, ext: &str) -> PathBuf {
    let hex = hash.to_hex();
    base.join(&hex[0..2])
        .join(&hex[2..4])
        .join(format!("{}.{}", &hex[4..], ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_path_is_sharded() {
        let layout = StoreLayout::new("/ddc");
        let hash = IoHash::hash(b"content");
        let hex = hash.to_hex();
        let path = layout.content_path(&hash);
        let expected = PathBuf::from("/ddc")
            .join("Content")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{}.blob", &hex[4..]));
        assert_eq!(path, expected);
    }

    #[test]
    fn test_bucket_paths_fold_case() {
        let layout = StoreLayout::new("/ddc");
        let key = CacheKey::from_content("LayoutMixed", b"x").unwrap();
        let record = layout.record_path(&key);
        let value = layout.value_path(&key);
        assert!(record.starts_with("/ddc/Buckets/layoutmixed"));
        assert_ne!(record, value);
        assert_eq!(record.with_extension(""), value.with_extension(""));
    }

    #[test]
    fn test_legacy_path_digits() {
        let layout = StoreLayout::new("/ddc");
        let key = LegacyKey::from("SHADER_KEY");
        let path = layout.legacy_path(&key).unwrap();
        let rel = path.strip_prefix("/ddc").unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().to_string()).collect();
        assert_eq!(parts.len(), 4);
        for digit in &parts[..3] {
            assert_eq!(digit.len(), 1);
            assert!(digit.chars().all(|c| c.is_ascii_digit()));
        }
        assert_eq!(parts[3], "SHADER_KEY.udd");
    }

    #[test]
    fn test_legacy_path_too_long() {
        let layout = StoreLayout::new("/ddc");
        let key = LegacyKey::new("K".repeat(MAX_LEGACY_PATH_LEN));
        assert!(matches!(
            layout.legacy_path(&key),
            Err(Error::Capacity { .. })
        ));
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let target = PathBuf::from("/ddc/Content/ab/cd/rest.blob");
        let temp = StoreLayout::temp_path(&target);
        assert_eq!(temp.parent(), target.parent());
        assert!(StoreLayout::is_temp_file(&temp));
        assert_ne!(StoreLayout::temp_path(&target), temp);
    }
}
