// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use bucketdb::Error;
use common::open_rw;
use test_log::test;

#[test]
fn db_set_get_delete() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    db.set("bbb", "k", "v1")?;
    assert_eq!(b"v1", &*db.get("bbb", "k")?);

    db.delete("bbb", "k")?;
    assert!(matches!(db.get("bbb", "k"), Err(Error::ObjectNotExist)));

    Ok(())
}

#[test]
fn db_overwrite_returns_latest() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    for i in 0..100 {
        db.set("bbb", "key", format!("value-{i}"))?;
    }

    assert_eq!(b"value-99", &*db.get("bbb", "key")?);

    Ok(())
}

#[test]
fn db_get_missing_key() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;
    assert!(matches!(db.get("bbb", "nope"), Err(Error::ObjectNotExist)));

    Ok(())
}

#[test]
fn db_rejects_oversized_objects() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    let huge_key = vec![b'k'; 16 * 1_024 + 1];
    assert!(matches!(
        db.set("bbb", huge_key, "v"),
        Err(Error::ObjectTooLarge)
    ));

    let huge_value = vec![b'v'; 64 * 1_024 + 1];
    assert!(matches!(
        db.set("bbb", "k", huge_value),
        Err(Error::ObjectTooLarge)
    ));

    assert!(matches!(db.set("bbb", "", "v"), Err(Error::ObjectTooLarge)));

    // No side effects
    assert!(matches!(db.get("bbb", "k"), Err(Error::ObjectNotExist)));

    // The limits themselves are fine
    db.set("bbb", vec![b'k'; 16 * 1_024], vec![b'v'; 64 * 1_024])?;

    Ok(())
}

#[test]
fn db_batch_write() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("b-1")?;
    db.create_bucket("b-2")?;

    let mut batch = bucketdb::ObjectBatch::new();
    batch.set("b-1", "a", "1");
    batch.set("b-2", "a", "2");
    batch.set("b-1", "b", "3");
    batch.delete("b-1", "a");
    assert_eq!(4, batch.len());

    db.write(batch)?;

    assert!(matches!(db.get("b-1", "a"), Err(Error::ObjectNotExist)));
    assert_eq!(b"3", &*db.get("b-1", "b")?);
    assert_eq!(b"2", &*db.get("b-2", "a")?);

    Ok(())
}
