// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use bucketdb::{DbConfig, Engine, Error, GlobalConfig, Mode, DB};
use common::wait_until;
use test_log::test;

const WRITER_COUNT: usize = 8;
const WRITES_PER_THREAD: usize = 5_000;

#[test]
fn concurrent_writers_keep_order_and_count() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

    let config = GlobalConfig::new(Mode::ReadWrite).max_memtable_objects(10_000);
    let engine = Engine::start(config)?;
    let db = DB::open(&engine, DbConfig::new(), dir.path().join("d1"))?;

    db.create_bucket("bbb")?;

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..WRITER_COUNT)
            .map(|tid| {
                let db = db.clone();
                scope.spawn(move || -> bucketdb::Result<()> {
                    for i in 0..WRITES_PER_THREAD {
                        db.set("bbb", format!("t{tid}-{i:06}"), format!("{tid}:{i}"))?;
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            #[allow(clippy::unwrap_used)]
            handle.join().unwrap()?;
        }

        Ok::<(), Error>(())
    })?;

    // Wait for background flushes triggered by the object threshold
    assert!(wait_until(|| {
        db.get_bucket_stat("bbb")
            .map(|s| s.memwriter_stat.count <= 1)
            .unwrap_or(false)
    }));

    let pairs: Vec<_> = db.new_iterator("bbb")?.collect::<bucketdb::Result<_>>()?;

    assert_eq!(WRITER_COUNT * WRITES_PER_THREAD, pairs.len());
    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));

    // Spot-check that every thread's writes are intact
    for tid in 0..WRITER_COUNT {
        for i in (0..WRITES_PER_THREAD).step_by(977) {
            assert_eq!(
                format!("{tid}:{i}").as_bytes(),
                &*db.get("bbb", format!("t{tid}-{i:06}"))?,
            );
        }
    }

    Ok(())
}

#[test]
fn concurrent_readers_during_writes() -> bucketdb::Result<()> {
    let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

    let engine = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
    let db = DB::open(&engine, DbConfig::new(), dir.path().join("d1"))?;

    db.create_bucket("bbb")?;
    for i in 0..1_000 {
        db.set("bbb", format!("k{i:04}"), "base")?;
    }

    std::thread::scope(|scope| {
        let writer = {
            let db = db.clone();
            scope.spawn(move || -> bucketdb::Result<()> {
                for round in 0..20 {
                    for i in 0..1_000 {
                        db.set("bbb", format!("k{i:04}"), format!("r{round}"))?;
                    }
                    db.flush(Some("bbb"))?;
                }
                Ok(())
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                scope.spawn(move || -> bucketdb::Result<()> {
                    for _ in 0..50 {
                        // Every key is always present with some value
                        let value = db.get("bbb", "k0500")?;
                        assert!(!value.is_empty());

                        let count = db.new_iterator("bbb")?.count();
                        assert_eq!(1_000, count);
                    }
                    Ok(())
                })
            })
            .collect();

        #[allow(clippy::unwrap_used)]
        {
            writer.join().unwrap()?;
            for reader in readers {
                reader.join().unwrap()?;
            }
        }

        Ok::<(), Error>(())
    })?;

    Ok(())
}
