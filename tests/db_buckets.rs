// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use bucketdb::Error;
use common::open_rw;
use test_log::test;

#[test]
fn bucket_lifecycle() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    assert!(db.list_buckets().is_empty());
    assert!(!db.exists_bucket("bbb"));

    db.create_bucket("bbb")?;
    assert!(db.exists_bucket("bbb"));
    assert!(matches!(db.create_bucket("bbb"), Err(Error::BucketExist)));

    db.create_bucket("aaa")?;
    assert_eq!(vec!["aaa".to_string(), "bbb".to_string()], db.list_buckets());

    db.delete_bucket("bbb")?;
    assert!(!db.exists_bucket("bbb"));
    assert!(matches!(db.delete_bucket("bbb"), Err(Error::BucketNotExist)));
    assert!(matches!(db.get("bbb", "k"), Err(Error::BucketNotExist)));

    Ok(())
}

#[test]
fn bucket_names_are_validated() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    assert!(matches!(db.create_bucket("ab"), Err(Error::BucketName)));
    assert!(matches!(db.create_bucket("Big"), Err(Error::BucketName)));
    assert!(matches!(db.create_bucket("-ab"), Err(Error::BucketName)));
    assert!(matches!(
        db.create_bucket(&"x".repeat(64)),
        Err(Error::BucketName)
    ));

    db.create_bucket("ok-name_0")?;

    Ok(())
}

#[test]
fn bucket_created_on_demand() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    // DbConfig::new() enables create_bucket_if_missing
    db.set("lazy", "k", "v")?;
    assert!(db.exists_bucket("lazy"));
    assert_eq!(b"v", &*db.get("lazy", "k")?);

    Ok(())
}

#[test]
fn bucket_creation_opt_out() -> bucketdb::Result<()> {
    use bucketdb::{DbConfig, Engine, GlobalConfig, Mode, DB};

    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

    let engine = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
    let db = DB::open(
        &engine,
        DbConfig::new().create_bucket_if_missing(false),
        dir.path().join("d1"),
    )?;

    assert!(matches!(
        db.set("nope", "k", "v"),
        Err(Error::BucketNotExist)
    ));

    Ok(())
}

#[test]
fn bucket_stat_reflects_mutations() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let (_engine, db) = open_rw(&dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    for i in 0..10 {
        db.set("bbb", format!("k{i}"), "value")?;
    }
    db.delete("bbb", "k0")?;
    db.append("bbb", "k1", "x")?;

    let stat = db.get_bucket_stat("bbb")?;
    assert_eq!(10, stat.object_stat.set_stat.count);
    assert_eq!(1, stat.object_stat.delete_stat.count);
    assert_eq!(1, stat.object_stat.append_stat.count);
    assert_eq!(12, stat.object_stat.count());
    assert_eq!(1, stat.memwriter_stat.count);

    Ok(())
}

#[test]
fn deleted_bucket_survives_reopen_as_deleted() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let db_path = dir.path().join("d1");

    {
        let (engine, db) = open_rw(&db_path)?;
        db.create_bucket("keep-me")?;
        db.create_bucket("drop-me")?;
        db.set("drop-me", "k", "v")?;
        db.delete_bucket("drop-me")?;
        engine.stop();
    }

    let (_engine, db) = open_rw(&db_path)?;
    assert_eq!(vec!["keep-me".to_string()], db.list_buckets());

    Ok(())
}
