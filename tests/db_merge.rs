// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use bucketdb::{DbConfig, Engine, Error, GlobalConfig, Mode, DB};
use common::{open_rw, segment_levels, wait_until};
use test_log::test;

/// With merge_factor = 3, nine single-flush segments cascade into one
/// segment at level 2.
#[test]
fn merge_cascade_promotes_levels() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

    let config = GlobalConfig::new(Mode::ReadWrite)
        .merge_factor(3)
        .clean_interval_s(1);
    let engine = Engine::start(config)?;
    let db = DB::open(&engine, DbConfig::new(), dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    for round in 0..9 {
        db.set("bbb", "k", format!("v{round}"))?;
        db.flush(Some("bbb"))?;

        assert!(wait_until(|| {
            db.get_bucket_stat("bbb")
                .map(|s| s.memwriter_stat.count == 0)
                .unwrap_or(false)
        }));
    }

    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.segment_stat.count == 1)
            .unwrap_or(false)
    }));

    assert_eq!(b"v8", &*db.get("bbb", "k")?);

    // The surviving segment carries merge count 2. Superseded files can
    // outlive the merge until the cleaner catches up, so only assert that
    // the level-2 output exists on disk.
    let bucket_dir = std::fs::read_dir(dir.path().join("d1"))
        .map_err(Error::FileRead)?
        .flatten()
        .map(|d| d.file_name().to_string_lossy().into_owned())
        .find(|name| name.starts_with("bbb."))
        .ok_or(Error::BucketNotExist)?;

    assert!(wait_until(|| {
        let (_, levels) = segment_levels(&dir.path().join("d1"), &bucket_dir);
        levels.contains(&2)
    }));

    Ok(())
}

/// Iterating before and after a merge yields identical logical streams.
#[test]
fn merge_preserves_logical_content() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    for round in 0..4 {
        for i in 0..300 {
            if i % 10 == round {
                db.delete("bbb", format!("k{i:04}"))?;
            } else {
                db.set("bbb", format!("k{i:04}"), format!("r{round}-{i}"))?;
            }
        }
        db.flush(Some("bbb"))?;
        assert!(wait_until(|| {
            db.get_bucket_stat("bbb")
                .map(|s| s.memwriter_stat.count == 0)
                .unwrap_or(false)
        }));
    }

    let before: Vec<_> = db.new_iterator("bbb")?.collect::<bucketdb::Result<_>>()?;

    db.merge(Some("bbb"))?;
    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.segment_stat.count == 1)
            .unwrap_or(false)
    }));

    let after: Vec<_> = db.new_iterator("bbb")?.collect::<bucketdb::Result<_>>()?;
    assert_eq!(before, after);

    Ok(())
}

/// A full merge of everything drops tombstones for good.
#[test]
fn full_merge_reclaims_tombstones() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    for i in 0..200 {
        db.set("bbb", format!("k{i:04}"), "v")?;
    }
    db.flush(Some("bbb"))?;
    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.memwriter_stat.count == 0)
            .unwrap_or(false)
    }));

    for i in 0..200 {
        db.delete("bbb", format!("k{i:04}"))?;
    }
    db.flush(Some("bbb"))?;
    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.memwriter_stat.count == 0)
            .unwrap_or(false)
    }));

    db.merge(Some("bbb"))?;
    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.segment_stat.count <= 1 && s.object_stat.delete_stat.count == 0)
            .unwrap_or(false)
    }));

    assert_eq!(0, db.new_iterator("bbb")?.count());

    Ok(())
}
