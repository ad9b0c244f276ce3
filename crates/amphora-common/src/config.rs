//! Configuration types for a single storage shard.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of one shard: its write-cache, blob store and metabase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Worker pool size for background object flushing.
    pub pool_size: usize,
    /// Number of storage faults after which the shard flips to read-only.
    /// Zero disables the error budget.
    pub ro_error_threshold: u32,
    /// Path of the metabase file.
    pub metabase_path: PathBuf,
    /// Blob store configuration.
    pub blobstor: BlobStorConfig,
    /// Write-cache configuration.
    pub writecache: WriteCacheConfig,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            pool_size: 20,
            ro_error_threshold: 0,
            metabase_path: PathBuf::from("meta.db"),
            blobstor: BlobStorConfig::default(),
            writecache: WriteCacheConfig::default(),
        }
    }
}

/// Blob store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobStorConfig {
    /// Root directory of the blob store.
    pub path: PathBuf,
    /// Objects at or below this marshaled size go to the blobovnicza set;
    /// larger objects go to the fstree.
    pub small_object_size: u64,
    /// Transparently compress stored payloads.
    pub compress: bool,
    /// Directory depth of the large-object fstree.
    pub fstree_depth: usize,
    /// Blobovnicza set configuration.
    pub blobovnicza: BlobovniczaConfig,
}

impl Default for BlobStorConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("blob"),
            small_object_size: 32 * 1024, // 32 KiB
            compress: false,
            fstree_depth: 4,
            blobovnicza: BlobovniczaConfig::default(),
        }
    }
}

/// Configuration of a single blobovnicza and of the hash tree holding them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobovniczaConfig {
    /// Full-size limit of one blobovnicza file.
    pub size: u64,
    /// Per-object size limit inside a blobovnicza.
    pub object_size: u64,
    /// Depth of the hash tree.
    pub depth: usize,
    /// Width of the hash tree (directories per level, at most 16).
    pub width: usize,
    /// Open-handle cache capacity.
    pub opened_cache_size: usize,
}

impl Default for BlobovniczaConfig {
    fn default() -> Self {
        Self {
            size: 1024 * 1024 * 1024, // 1 GiB
            object_size: 1024 * 1024, // 1 MiB
            depth: 2,
            width: 16,
            opened_cache_size: 16,
        }
    }
}

/// Write-cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteCacheConfig {
    /// Directory holding the cache's small-object database and fstree.
    pub path: PathBuf,
    /// Cap on the in-memory buffer, in bytes.
    pub max_mem_size: u64,
    /// Objects at or below this marshaled size use the small-object path.
    pub small_object_size: u64,
    /// Objects above this marshaled size are rejected with `BigObject`.
    pub max_object_size: u64,
    /// Number of flush workers.
    pub workers_count: usize,
    /// Interval between flush scans.
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Request compression of large objects when they reach the blob store.
    pub compress: bool,
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("writecache"),
            max_mem_size: 1024 * 1024 * 1024, // 1 GiB
            small_object_size: 32 * 1024,     // 32 KiB
            max_object_size: 64 * 1024 * 1024, // 64 MiB
            workers_count: 20,
            flush_interval: Duration::from_secs(1),
            compress: false,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ShardConfig::default();
        assert_eq!(cfg.pool_size, 20);
        assert_eq!(cfg.ro_error_threshold, 0);
        assert_eq!(cfg.blobstor.small_object_size, 32 * 1024);
        assert_eq!(cfg.writecache.flush_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_serde_round_trip() {
        let cfg = ShardConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ShardConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.writecache.max_mem_size, cfg.writecache.max_mem_size);
        assert_eq!(back.writecache.flush_interval, cfg.writecache.flush_interval);
    }
}
