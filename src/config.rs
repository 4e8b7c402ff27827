// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Access mode of an engine
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Opens databases read-only (shared lock), no mutations
    ReadOnly,

    /// Mutations only; point reads return [`Error::InvalidMode`]
    WriteOnly,

    /// Mutations and reads, including reads from uncommitted memwriters
    ReadWrite,
}

impl Mode {
    /// Returns `true` if this mode permits reads.
    #[must_use]
    pub fn is_readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Returns `true` if this mode permits writes.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

const MIB: u64 = 1_024 * 1_024;
const GIB: u64 = 1_024 * MIB;

/// Engine-global configuration
///
/// Builder-style setters; validated by [`Engine::start`](crate::Engine::start).
#[derive(Clone, Debug)]
pub struct GlobalConfig {
    /// Access mode
    pub mode: Mode,

    /// Capacity of the index-block cache in bytes
    pub index_cache_size: u64,

    /// Capacity of the data-block cache in bytes
    pub data_cache_size: u64,

    /// Capacity of the bloom-filter cache in bytes
    pub bloom_filter_cache_size: u64,

    /// Directory for cross-process change notifications; empty disables them
    pub notify_dir: Option<PathBuf>,

    /// Seconds after which notify drops are reaped
    pub notify_file_ttl_s: u16,

    /// Threads turning sealed memwriters into segments
    pub write_segment_threads: usize,

    /// Threads (sharded by db path) persisting metadata snapshots
    pub write_metadata_threads: usize,

    /// Threads running size-tiered partial merges
    pub part_merge_threads: usize,

    /// Threads running full merges
    pub full_merge_threads: usize,

    /// Threads reloading databases in read-only engines
    pub reload_db_threads: usize,

    /// Seal a memwriter when it reaches this many bytes (1 MiB..1 GiB)
    pub max_memtable_size: u64,

    /// Seal a memwriter when it holds this many objects (1_000..1_000_000)
    pub max_memtable_objects: u64,

    /// Seal a nonempty memwriter after this many seconds (1..600)
    pub flush_interval_s: u16,

    /// Period of the cleaner thread
    pub clean_interval_s: u16,

    /// Segments per level before a partial merge triggers
    pub merge_factor: usize,

    /// Segments whose inputs would exceed this size are not merged together
    pub max_merge_size: u64,

    /// Read-only engines reopen metadata when peers publish
    pub auto_reload_db: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            mode: Mode::ReadWrite,
            index_cache_size: 512 * MIB,
            data_cache_size: GIB,
            bloom_filter_cache_size: 256 * MIB,
            notify_dir: None,
            notify_file_ttl_s: 30,
            write_segment_threads: 8,
            write_metadata_threads: 4,
            part_merge_threads: 4,
            full_merge_threads: 2,
            reload_db_threads: 4,
            max_memtable_size: 64 * MIB,
            max_memtable_objects: 500_000,
            flush_interval_s: 30,
            clean_interval_s: 30,
            merge_factor: 10,
            max_merge_size: 32 * GIB,
            auto_reload_db: true,
        }
    }
}

impl GlobalConfig {
    /// Defaults with the given access mode.
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Sets the cross-process notification directory.
    #[must_use]
    pub fn notify_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.notify_dir = Some(dir.into());
        self
    }

    /// Sets the memwriter byte threshold.
    #[must_use]
    pub fn max_memtable_size(mut self, bytes: u64) -> Self {
        self.max_memtable_size = bytes;
        self
    }

    /// Sets the memwriter object-count threshold.
    #[must_use]
    pub fn max_memtable_objects(mut self, n: u64) -> Self {
        self.max_memtable_objects = n;
        self
    }

    /// Sets the memwriter age threshold.
    #[must_use]
    pub fn flush_interval_s(mut self, secs: u16) -> Self {
        self.flush_interval_s = secs;
        self
    }

    /// Sets the cleaner period.
    #[must_use]
    pub fn clean_interval_s(mut self, secs: u16) -> Self {
        self.clean_interval_s = secs;
        self
    }

    /// Sets how many same-level segments trigger a partial merge.
    #[must_use]
    pub fn merge_factor(mut self, n: usize) -> Self {
        self.merge_factor = n;
        self
    }

    /// Enables or disables reacting to peer publications (ReadOnly mode).
    #[must_use]
    pub fn auto_reload_db(mut self, enabled: bool) -> Self {
        self.auto_reload_db = enabled;
        self
    }

    /// Validates ranges and mode-dependent combinations.
    pub fn check(&self) -> Result<()> {
        if !(MIB..=GIB).contains(&self.max_memtable_size) {
            return Err(Error::InvalidConfig("max_memtable_size out of range"));
        }
        if !(1_000..=1_000_000).contains(&self.max_memtable_objects) {
            return Err(Error::InvalidConfig("max_memtable_objects out of range"));
        }
        if !(1..=600).contains(&self.flush_interval_s) {
            return Err(Error::InvalidConfig("flush_interval_s out of range"));
        }
        if self.clean_interval_s == 0 {
            return Err(Error::InvalidConfig("clean_interval_s may not be 0"));
        }
        if self.merge_factor < 2 {
            return Err(Error::InvalidConfig("merge_factor must be at least 2"));
        }
        if self.mode == Mode::ReadOnly && self.auto_reload_db && self.notify_dir.is_none() {
            return Err(Error::InvalidConfig(
                "auto_reload_db requires a notify_dir in ReadOnly mode",
            ));
        }
        if self.mode.is_writable()
            && (self.write_segment_threads == 0 || self.write_metadata_threads == 0)
        {
            return Err(Error::InvalidConfig("worker pools may not be empty"));
        }
        Ok(())
    }
}

/// Per-bucket configuration
#[derive(Copy, Clone, Debug)]
pub struct BucketConfig {
    /// Highest level a segment of this bucket may reach (<= 15)
    pub max_level_num: u8,

    /// Bloom filter bits per key; 0 disables the filter
    pub bloom_filter_bitnum: u8,

    /// fsync segment files before publishing them
    pub sync_data: bool,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            max_level_num: crate::segment::id::MAX_LEVEL,
            bloom_filter_bitnum: 10,
            sync_data: false,
        }
    }
}

impl BucketConfig {
    /// Validates the level ceiling.
    pub fn check(&self) -> Result<()> {
        if self.max_level_num > crate::segment::id::MAX_LEVEL {
            return Err(Error::InvalidConfig("max_level_num exceeds 15"));
        }
        Ok(())
    }
}

/// Per-database configuration
#[derive(Clone, Debug, Default)]
pub struct DbConfig {
    /// `set`/`append`/`delete` create the target bucket when missing
    pub create_bucket_if_missing: bool,

    default_bucket_config: BucketConfig,
    bucket_configs: BTreeMap<String, BucketConfig>,
}

impl DbConfig {
    /// Defaults, with on-demand bucket creation enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            create_bucket_if_missing: true,
            ..Self::default()
        }
    }

    /// Enables or disables creating buckets on first write.
    #[must_use]
    pub fn create_bucket_if_missing(mut self, enabled: bool) -> Self {
        self.create_bucket_if_missing = enabled;
        self
    }

    /// Overrides the configuration of one bucket.
    #[must_use]
    pub fn bucket_config(mut self, bucket_name: &str, config: BucketConfig) -> Self {
        self.bucket_configs.insert(bucket_name.into(), config);
        self
    }

    /// Effective configuration of one bucket.
    #[must_use]
    pub fn config_for(&self, bucket_name: &str) -> BucketConfig {
        self.bucket_configs
            .get(bucket_name)
            .copied()
            .unwrap_or(self.default_bucket_config)
    }

    /// Validates every contained bucket configuration.
    pub fn check(&self) -> Result<()> {
        self.default_bucket_config.check()?;
        for config in self.bucket_configs.values() {
            config.check()?;
        }
        Ok(())
    }
}
