// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use bucketdb::{DbConfig, Engine, Error, GlobalConfig, Mode, DB};
use test_log::test;

#[test]
fn second_writable_open_fails() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let db_path = dir.path().join("d1");

    let engine = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
    let _db = DB::open(&engine, DbConfig::new(), &db_path)?;

    // Same engine: the path is already registered
    assert!(matches!(
        DB::open(&engine, DbConfig::new(), &db_path),
        Err(Error::DbOpened)
    ));

    // A second engine in the same process contends on the advisory lock
    let engine2 = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
    assert!(matches!(
        DB::open(&engine2, DbConfig::new(), &db_path),
        Err(Error::FileLock)
    ));

    Ok(())
}

#[test]
fn write_only_mode_rejects_reads() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

    let engine = Engine::start(GlobalConfig::new(Mode::WriteOnly))?;
    let db = DB::open(&engine, DbConfig::new(), dir.path().join("d1"))?;

    db.create_bucket("bbb")?;
    db.set("bbb", "k", "v")?;

    assert!(matches!(db.get("bbb", "k"), Err(Error::InvalidMode)));
    assert!(matches!(db.new_iterator("bbb"), Err(Error::InvalidMode)));

    Ok(())
}

#[test]
fn read_only_mode_rejects_writes() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let db_path = dir.path().join("d1");

    {
        let engine = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
        let db = DB::open(&engine, DbConfig::new(), &db_path)?;
        db.create_bucket("bbb")?;
        db.set("bbb", "k", "v")?;
        db.flush(None)?;
        assert!(common::wait_until(|| {
            db.get_bucket_stat("bbb")
                .map(|s| s.segment_stat.count == 1)
                .unwrap_or(false)
        }));
        engine.stop();
    }

    let engine = Engine::start(GlobalConfig::new(Mode::ReadOnly).auto_reload_db(false))?;
    let db = DB::open(&engine, DbConfig::new(), &db_path)?;

    assert_eq!(b"v", &*db.get("bbb", "k")?);
    assert!(matches!(db.set("bbb", "k", "x"), Err(Error::InvalidMode)));
    assert!(matches!(db.delete("bbb", "k"), Err(Error::InvalidMode)));
    assert!(matches!(db.flush(None), Err(Error::InvalidMode)));
    assert!(matches!(db.merge(None), Err(Error::InvalidMode)));

    Ok(())
}

#[test]
fn readers_share_the_lock() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;
    let db_path = dir.path().join("d1");

    {
        let engine = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
        let db = DB::open(&engine, DbConfig::new(), &db_path)?;
        db.create_bucket("bbb")?;
        engine.stop();
    }

    let engine1 = Engine::start(GlobalConfig::new(Mode::ReadOnly).auto_reload_db(false))?;
    let engine2 = Engine::start(GlobalConfig::new(Mode::ReadOnly).auto_reload_db(false))?;

    let _r1 = DB::open(&engine1, DbConfig::new(), &db_path)?;
    let _r2 = DB::open(&engine2, DbConfig::new(), &db_path)?;

    // A writer cannot squeeze in while readers hold the shared lock
    let engine3 = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
    assert!(matches!(
        DB::open(&engine3, DbConfig::new(), &db_path),
        Err(Error::FileLock)
    ));

    Ok(())
}
