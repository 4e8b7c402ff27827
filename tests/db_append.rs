// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use bucketdb::Error;
use common::{open_rw, wait_until};
use test_log::test;

#[test]
fn append_folds_onto_set() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    db.set("bbb", "k", "A")?;
    db.append("bbb", "k", "B")?;
    db.append("bbb", "k", "C")?;

    assert_eq!(b"ABC", &*db.get("bbb", "k")?);

    Ok(())
}

#[test]
fn append_after_delete_starts_fresh() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    db.set("bbb", "k", "gone")?;
    db.delete("bbb", "k")?;
    db.append("bbb", "k", "X")?;

    assert_eq!(b"X", &*db.get("bbb", "k")?);

    Ok(())
}

#[test]
fn set_shadows_append_chain() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    db.append("bbb", "k", "A")?;
    db.append("bbb", "k", "B")?;
    db.set("bbb", "k", "Z")?;

    assert_eq!(b"Z", &*db.get("bbb", "k")?);

    Ok(())
}

#[test]
fn append_without_base_is_the_value() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    db.append("bbb", "k", "A")?;
    db.append("bbb", "k", "B")?;

    assert_eq!(b"AB", &*db.get("bbb", "k")?);

    Ok(())
}

#[test]
fn append_chain_survives_flush_and_merge() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    db.set("bbb", "a", "1")?;
    db.append("bbb", "a", "2")?;

    db.flush(Some("bbb"))?;
    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.memwriter_stat.count == 0 && s.segment_stat.count == 1)
            .unwrap_or(false)
    }));

    db.append("bbb", "a", "3")?;
    assert_eq!(b"123", &*db.get("bbb", "a")?);

    db.flush(Some("bbb"))?;
    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.memwriter_stat.count == 0 && s.segment_stat.count == 2)
            .unwrap_or(false)
    }));

    db.merge(Some("bbb"))?;
    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.segment_stat.count == 1)
            .unwrap_or(false)
    }));

    assert_eq!(b"123", &*db.get("bbb", "a")?);

    Ok(())
}
