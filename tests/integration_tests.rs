//! CoucheStor DDC Integration Tests
//!
//! End-to-end behavior of the assembled cache:
//! - Leaf store round trips and corruption handling
//! - Hierarchy backfill and restart
//! - Maintenance aging
//! - Key shortening
//! - Throttling
//! - Pak archives
//! - The request façade

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;

use couchestor_ddc::backend::{
    CacheBackend, FileSystemCacheStore, FileSystemConfig, SharedBackend,
};

async fn open_store(root: &Path) -> FileSystemCacheStore {
    let config = FileSystemConfig {
        speed_test: false,
        ..FileSystemConfig::new("Local", root)
    };
    FileSystemCacheStore::open(config).await
}

// =============================================================================
// Leaf Store Tests
// =============================================================================

mod store_tests {
    use super::*;
    use couchestor_ddc::LegacyKey;

    #[tokio::test]
    async fn test_round_trip_and_idempotent_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let payloads: Vec<(LegacyKey, Bytes)> = (0..8)
            .map(|i| {
                (
                    LegacyKey::new(format!("Texture_{}", i)),
                    Bytes::from(vec![i as u8; 1000 * (i + 1)]),
                )
            })
            .collect();
        for (key, data) in &payloads {
            assert!(store.put(key, data.clone(), false).await.is_cached());
        }
        for (key, data) in &payloads {
            for _ in 0..5 {
                assert_eq!(store.get(key).await.as_ref(), Some(data));
            }
        }
    }

    #[tokio::test]
    async fn test_corruption_in_payload_or_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for (name, offset_from_end) in [("Payload", 40usize), ("Trailer", 3usize)] {
            let key = LegacyKey::new(format!("Corrupt{}", name));
            store.put(&key, Bytes::from(vec![7u8; 64]), false).await;

            let path = store.layout().legacy_path(&key).unwrap();
            let mut bytes = std::fs::read(&path).unwrap();
            let index = bytes.len() - offset_from_end;
            bytes[index] ^= 0x5a;
            std::fs::write(&path, &bytes).unwrap();

            assert!(store.get(&key).await.is_none(), "{} corruption returned data", name);
            assert!(!path.exists());
            assert!(!store.exists(&key).await);
        }
        assert_eq!(store.usage_stats().stats.corruptions, 2);
    }
}

// =============================================================================
// Hierarchy Tests
// =============================================================================

mod hierarchy_tests {
    use super::*;
    use couchestor_ddc::backend::{BackgroundExecutor, HierarchicalBackend, MemoryCacheStore};
    use couchestor_ddc::{CacheGraph, GraphBuilder, GraphConfig, LegacyKey};

    #[tokio::test]
    async fn test_backfill_into_empty_fast_tier() {
        let dir = tempfile::tempdir().unwrap();
        let slow = Arc::new(open_store(dir.path()).await);
        let fast = Arc::new(MemoryCacheStore::new("Memory"));
        let key = LegacyKey::from("BackfillMe");
        slow.put(&key, Bytes::from_static(b"slow data"), false).await;

        let hierarchy = HierarchicalBackend::new(
            "Root",
            vec![fast.clone() as SharedBackend, slow.clone()],
            BackgroundExecutor::new(),
        );
        assert!(!fast.exists(&key).await);
        assert_eq!(hierarchy.get(&key).await.unwrap().as_ref(), b"slow data");

        hierarchy.flush().await;
        assert!(fast.exists(&key).await);
    }

    async fn build_graph(text: &str, base: &Path) -> CacheGraph {
        GraphBuilder::new(GraphConfig::parse(text).unwrap())
            .base_dir(base)
            .speed_test(false)
            .start_maintainers(false)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_restart_with_cold_memory_tier() {
        let dir = tempfile::tempdir().unwrap();
        let text = "Root=(Type=Hierarchical, Inner=Mem, Inner=Local)\n\
                    Mem=(Type=Memory, MaxCacheSize=1)\n\
                    Local=(Type=FileSystem, Path=DDC)";
        let key = LegacyKey::from("A");

        let first = build_graph(text, dir.path()).await;
        assert!(first
            .root()
            .put(&key, Bytes::from_static(&[1, 2, 3]), false)
            .await
            .is_cached());
        first.shutdown().await;
        drop(first);

        let second = build_graph(text, dir.path()).await;
        let memory = second.node("Mem").unwrap();
        assert!(!memory.exists(&key).await);
        assert_eq!(second.root().get(&key).await.unwrap().as_ref(), &[1, 2, 3]);
        second.root().flush().await;
        assert!(memory.exists(&key).await);
    }
}

// =============================================================================
// Maintenance Tests
// =============================================================================

mod maintenance_tests {
    use super::*;
    use couchestor_ddc::backend::{CacheStoreMaintainer, MaintainerConfig};
    use couchestor_ddc::LegacyKey;
    use std::fs::{File, FileTimes};

    fn age(path: &Path, by: Duration) {
        set_times(path, by, by);
    }

    fn set_times(path: &Path, modified_age: Duration, accessed_age: Duration) {
        let now = SystemTime::now();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_times(
                FileTimes::new()
                    .set_accessed(now - accessed_age)
                    .set_modified(now - modified_age),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_age_floor() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let young = LegacyKey::from("Young");
        let old = LegacyKey::from("Old");
        store.put(&young, Bytes::from_static(b"young"), false).await;
        store.put(&old, Bytes::from_static(b"old"), false).await;

        let old_path = store.layout().legacy_path(&old).unwrap();
        age(&old_path, Duration::from_secs(3 * 3600));

        let maintainer = CacheStoreMaintainer::new(
            "Local",
            dir.path(),
            MaintainerConfig {
                max_file_age: Duration::from_secs(3600),
                max_scan_rate: 0,
                time_to_wait_after_init: Duration::ZERO,
                ..Default::default()
            },
        );
        for _ in 0..3 {
            assert!(maintainer.scan_pass().await);
        }

        assert!(store.exists(&young).await);
        assert!(!old_path.exists());
        assert!(store.get(&old).await.is_none());
        assert_eq!(maintainer.stats().files_deleted, 1);
    }

    #[tokio::test]
    async fn test_age_floor_needs_both_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let old_mtime = LegacyKey::from("OldMtimeFreshAtime");
        let old_atime = LegacyKey::from("FreshMtimeOldAtime");
        store.put(&old_mtime, Bytes::from_static(b"read recently"), false).await;
        store.put(&old_atime, Bytes::from_static(b"written recently"), false).await;

        let old_mtime_path = store.layout().legacy_path(&old_mtime).unwrap();
        let old_atime_path = store.layout().legacy_path(&old_atime).unwrap();
        let hour = Duration::from_secs(3600);
        set_times(&old_mtime_path, 3 * hour, Duration::ZERO);
        set_times(&old_atime_path, Duration::ZERO, 3 * hour);

        let maintainer = CacheStoreMaintainer::new(
            "Local",
            dir.path(),
            MaintainerConfig {
                max_file_age: hour,
                max_scan_rate: 0,
                time_to_wait_after_init: Duration::ZERO,
                ..Default::default()
            },
        );
        assert!(maintainer.scan_pass().await);

        assert!(old_mtime_path.exists());
        assert!(old_atime_path.exists());
        assert_eq!(maintainer.stats().files_deleted, 0);
    }
}

// =============================================================================
// Key Length Tests
// =============================================================================

mod key_length_tests {
    use super::*;
    use couchestor_ddc::backend::key_length::{append_key_tail, shorten_key, DEFAULT_MAX_KEY_LENGTH};
    use couchestor_ddc::backend::LimitKeyLengthWrapper;
    use couchestor_ddc::LegacyKey;

    fn long_key(tag: &str) -> LegacyKey {
        LegacyKey::new(format!("{}:{}", tag, "Shader/Permutation/".repeat(20)))
    }

    #[tokio::test]
    async fn test_shortened_round_trip_and_forgery() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()).await);
        let wrapper = LimitKeyLengthWrapper::new("Limit", store.clone(), DEFAULT_MAX_KEY_LENGTH);

        let key = long_key("Genuine");
        assert!(wrapper.put(&key, Bytes::from_static(b"bytecode"), false).await.is_cached());
        assert_eq!(wrapper.get(&key).await.unwrap().as_ref(), b"bytecode");

        let short = shorten_key(&key, DEFAULT_MAX_KEY_LENGTH).unwrap();
        let stored = store.get(&short).await.unwrap();
        assert!(stored.ends_with(&(key.len() as u32).to_le_bytes()));

        // Same short key, tail naming another key
        let forged = append_key_tail(b"forged", &long_key("Forger"));
        store.put(&short, forged, true).await;
        assert!(wrapper.get(&key).await.is_none());
        assert!(!store.exists(&short).await);
    }
}

// =============================================================================
// Throttle Tests
// =============================================================================

mod throttle_tests {
    use super::*;
    use couchestor_ddc::backend::{MemoryCacheStore, ThrottleWrapper};
    use couchestor_ddc::LegacyKey;

    #[tokio::test]
    async fn test_concurrent_puts_respect_bandwidth() {
        let throttle = Arc::new(ThrottleWrapper::new(
            "Throttle",
            Arc::new(MemoryCacheStore::new("Memory")),
            Duration::from_millis(50),
            1_000_000,
        ));

        let start = Instant::now();
        let puts: Vec<_> = (0..10)
            .map(|i| {
                let throttle = Arc::clone(&throttle);
                tokio::spawn(async move {
                    let key = LegacyKey::new(format!("Chunk{}", i));
                    throttle.put(&key, Bytes::from(vec![0u8; 100_000]), false).await
                })
            })
            .collect();
        for put in puts {
            assert!(put.await.unwrap().is_cached());
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}

// =============================================================================
// Pak Tests
// =============================================================================

mod pak_tests {
    use super::*;
    use couchestor_ddc::backend::{PakConfig, PakFileStore};
    use couchestor_ddc::LegacyKey;

    #[tokio::test]
    async fn test_write_close_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Build.pak");
        let entries = [("One", &b"first"[..]), ("Two", b"second"), ("Three", b"third")];

        let writer = PakFileStore::create(PakConfig::new("Writer", &path)).await.unwrap();
        for (key, data) in entries {
            writer
                .put(&LegacyKey::from(key), Bytes::copy_from_slice(data), false)
                .await;
        }
        writer.close().await.unwrap();
        drop(writer);

        let reader = PakFileStore::open(PakConfig::new("Reader", &path)).await.unwrap();
        for (key, data) in entries {
            assert_eq!(reader.get(&LegacyKey::from(key)).await.unwrap().as_ref(), data);
        }
        assert!(reader.get(&LegacyKey::from("Four")).await.is_none());
        assert!(!reader.is_writable());
    }
}

// =============================================================================
// Façade Tests
// =============================================================================

mod facade_tests {
    use super::*;
    use couchestor_ddc::cache::{GetRequest, PutRequest};
    use couchestor_ddc::{
        Cache, CacheKey, CachePolicy, CacheRecord, GraphBuilder, GraphConfig, LegacyKey,
        RequestOwner, Status, Value,
    };

    #[tokio::test]
    async fn test_records_through_file_system_graph() {
        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            "Root=(Type=Hierarchical, Inner=Mem, Inner=Local)\n\
             Mem=(Type=Memory)\n\
             Local=(Type=FileSystem, Path=\"{}\")",
            dir.path().join("DDC").display()
        );
        let cache = Cache::from_config_str(&text).await.unwrap();
        let owner = RequestOwner::default();

        let record = CacheRecord::builder(CacheKey::from_content("Meshes", b"mesh source").unwrap())
            .value(Value::from_raw(&vec![3u8; 200_000]))
            .meta(serde_json::json!({ "lod": 2 }))
            .build();
        let put = cache
            .put(
                &owner,
                vec![PutRequest {
                    name: "mesh".to_string(),
                    record: record.clone(),
                    policy: CachePolicy::DEFAULT,
                    user_data: 0,
                }],
            )
            .wait()
            .await
            .unwrap();
        assert_eq!(put[0].status, Status::Ok);
        cache.wait_for_quiescence().await;

        let local = cache.graph().node("Local").unwrap();
        assert_eq!(
            local.get_record(record.key(), CachePolicy::DEFAULT).await.unwrap(),
            record
        );

        let got = cache
            .get(
                &owner,
                vec![GetRequest {
                    name: "mesh".to_string(),
                    key: record.key().clone(),
                    policy: CachePolicy::DEFAULT,
                    user_data: 1,
                }],
            )
            .wait()
            .await
            .unwrap();
        assert_eq!(got[0].status, Status::Ok);
        assert_eq!(got[0].record.as_ref().unwrap(), &record);

        let stats = cache.usage_stats();
        assert!(stats.totals().put_stored >= 2);
        cache.shutdown().await;
    }

    #[test]
    fn test_build_without_runtime_tasks() {
        let graph = tokio_test::block_on(
            GraphBuilder::new(GraphConfig::parse("Root=(Type=Memory, MaxCacheSize=1)").unwrap()).build(),
        )
        .unwrap();
        let key = LegacyKey::from("Sync");
        let root = graph.root();
        assert!(tokio_test::block_on(root.put(&key, Bytes::from_static(b"sync"), false)).is_cached());
        assert_eq!(
            tokio_test::block_on(root.get(&key)).unwrap().as_ref(),
            b"sync"
        );
    }
}
