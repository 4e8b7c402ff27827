// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// Not every test binary uses every helper
#![allow(dead_code)]

use bucketdb::{DbConfig, Engine, GlobalConfig, Mode, DB};
use std::time::{Duration, Instant};

/// Polls a condition until it holds or a generous timeout elapses.
///
/// Flush and merge are asynchronous; tests wait for the background
/// machinery to quiesce instead of assuming immediacy.
pub fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    condition()
}

pub fn open_rw(path: &std::path::Path) -> bucketdb::Result<(Engine, DB)> {
    let engine = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
    let db = DB::open(&engine, DbConfig::new(), path)?;
    Ok((engine, db))
}

/// Counts the alive `.idx` segment files of a bucket directory, returning
/// `(count, levels)` with the level of each fileid.
pub fn segment_levels(db_path: &std::path::Path, bucket_dir: &str) -> (usize, Vec<u8>) {
    let dir = db_path.join(bucket_dir);

    let mut levels = vec![];
    if let Ok(dirents) = std::fs::read_dir(dir) {
        for dirent in dirents.flatten() {
            let path = dirent.path();
            if path.extension().and_then(|x| x.to_str()) != Some("idx") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|x| x.to_str()) {
                if let Ok(raw) = u64::from_str_radix(stem, 16) {
                    levels.push(((raw & 0xFF) as u8).min(15));
                }
            }
        }
    }

    levels.sort_unstable();
    (levels.len(), levels)
}
