// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use bucketdb::Error;
use common::{open_rw, wait_until};
use test_log::test;

#[test]
fn iter_yields_every_pair_sorted() -> bucketdb::Result<()> {
    const ITEM_COUNT: usize = 10_000;

    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    for i in 0..ITEM_COUNT {
        db.set("bbb", format!("k{i}"), i.to_string())?;
    }

    let pairs: Vec<_> = db.new_iterator("bbb")?.collect::<bucketdb::Result<_>>()?;

    assert_eq!(ITEM_COUNT, pairs.len());
    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));

    let value_bytes: usize = pairs.iter().map(|(_, v)| v.len()).sum();
    assert_eq!(38_890, value_bytes);

    Ok(())
}

#[test]
fn iter_skips_tombstones() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    for i in 0..100 {
        db.set("bbb", format!("k{i:03}"), "v")?;
    }
    for i in (0..100).step_by(2) {
        db.delete("bbb", format!("k{i:03}"))?;
    }

    let pairs: Vec<_> = db.new_iterator("bbb")?.collect::<bucketdb::Result<_>>()?;
    assert_eq!(50, pairs.len());

    Ok(())
}

#[test]
fn iter_spans_memory_and_segments() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    for i in 0..500 {
        db.set("bbb", format!("k{i:04}"), "old")?;
    }

    db.flush(Some("bbb"))?;
    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.memwriter_stat.count == 0)
            .unwrap_or(false)
    }));

    // Overwrite half in memory, add some new keys
    for i in 0..250 {
        db.set("bbb", format!("k{i:04}"), "new")?;
    }
    for i in 500..600 {
        db.set("bbb", format!("k{i:04}"), "fresh")?;
    }

    let pairs: Vec<_> = db.new_iterator("bbb")?.collect::<bucketdb::Result<_>>()?;

    assert_eq!(600, pairs.len());
    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));

    assert_eq!(b"new", &*pairs.first().map(|(_, v)| v.clone()).ok_or(Error::NoMoreData)?);
    assert_eq!(b"old", &*db.get("bbb", "k0400")?);
    assert_eq!(b"fresh", &*db.get("bbb", "k0599")?);

    Ok(())
}

#[test]
fn iter_is_stable_against_later_writes() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    for i in 0..100 {
        db.set("bbb", format!("k{i:03}"), "v")?;
    }

    let iter = db.new_iterator("bbb")?;

    // Mutations after iterator creation are not observed
    for i in 100..200 {
        db.set("bbb", format!("k{i:03}"), "v")?;
    }
    db.delete("bbb", "k000")?;

    let pairs: Vec<_> = iter.collect::<bucketdb::Result<_>>()?;
    assert_eq!(100, pairs.len());

    Ok(())
}
