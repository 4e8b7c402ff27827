// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::bucket::Bucket;
use crate::cache::{Cache, CacheId};
use crate::config::GlobalConfig;
use crate::db::DbInner;
use crate::notify::{NotifyMessage, NotifyType};
use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::AcqRel, Ordering::SeqCst};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

const TASK_QUEUE_CAPACITY: usize = 256;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

pub(crate) enum Task {
    WriteSegment {
        db: Arc<DbInner>,
        bucket: Arc<Bucket>,
    },
    WriteBucketMeta {
        db: Arc<DbInner>,
        bucket: Arc<Bucket>,
    },
    PartMerge {
        db: Arc<DbInner>,
        bucket: Arc<Bucket>,
    },
    FullMerge {
        db: Arc<DbInner>,
        bucket: Arc<Bucket>,
    },
    Reload {
        db: Arc<DbInner>,
        bucket_name: Option<String>,
    },
    Shutdown,
}

struct Senders {
    write_segment: Sender<Task>,
    write_meta: Vec<Sender<Task>>,
    part_merge: Sender<Task>,
    full_merge: Sender<Task>,
    reload: Option<Sender<Task>>,
}

/// Shared flag the background threads poll to wind down
///
/// Tripped once by [`Engine::stop`]. Workers already blocked on their
/// queue still need a [`Task::Shutdown`] sentinel; the flag covers the
/// periodic threads (try-flush, cleaner, watcher) and long-running
/// merges that check it between steps.
#[derive(Clone, Default)]
struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    fn trip(&self) {
        self.0.store(true, SeqCst);
    }

    fn is_tripped(&self) -> bool {
        self.0.load(SeqCst)
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: GlobalConfig,
    pub(crate) cache: Arc<Cache>,
    cache_ids: AtomicU64,

    /// Open databases, keyed by their path. The engine owns them.
    pub(crate) dbs: Mutex<BTreeMap<PathBuf, Arc<DbInner>>>,

    senders: OnceLock<Senders>,
    threads: Mutex<Vec<JoinHandle<()>>>,

    stop: ShutdownFlag,
    notify_seq: AtomicU64,
    stopped: AtomicBool,
}

impl EngineInner {
    pub(crate) fn next_cache_id(&self) -> CacheId {
        self.cache_ids.fetch_add(1, AcqRel)
    }

    fn meta_shard(&self, db_path: &Path) -> usize {
        let mut hasher = rustc_hash::FxBuildHasher.build_hasher();
        hasher.write(db_path.as_os_str().as_encoded_bytes());

        #[allow(clippy::cast_possible_truncation)]
        let shards = self
            .senders
            .get()
            .map_or(1, |s| s.write_meta.len().max(1));

        (hasher.finish() as usize) % shards
    }

    pub(crate) fn post_write_segment(&self, db: Arc<DbInner>, bucket: Arc<Bucket>) {
        if let Some(senders) = self.senders.get() {
            let _ = senders.write_segment.send(Task::WriteSegment { db, bucket });
        }
    }

    pub(crate) fn post_write_bucket_meta(&self, db: Arc<DbInner>, bucket: Arc<Bucket>) {
        if let Some(senders) = self.senders.get() {
            let shard = self.meta_shard(&db.path);
            if let Some(tx) = senders.write_meta.get(shard) {
                let _ = tx.send(Task::WriteBucketMeta { db, bucket });
            }
        }
    }

    pub(crate) fn post_part_merge(&self, db: Arc<DbInner>, bucket: Arc<Bucket>) {
        if let Some(senders) = self.senders.get() {
            let _ = senders.part_merge.send(Task::PartMerge { db, bucket });
        }
    }

    pub(crate) fn post_full_merge(&self, db: Arc<DbInner>, bucket: Arc<Bucket>) {
        if let Some(senders) = self.senders.get() {
            let _ = senders.full_merge.send(Task::FullMerge { db, bucket });
        }
    }

    fn post_reload(&self, db: Arc<DbInner>, bucket_name: Option<String>) {
        if let Some(senders) = self.senders.get() {
            if let Some(tx) = &senders.reload {
                let _ = tx.send(Task::Reload { db, bucket_name });
            }
        }
    }

    /// Drops a change notification for peer processes. Best-effort.
    pub(crate) fn emit_notify(
        &self,
        notify_type: NotifyType,
        db_path: &Path,
        bucket_name: Option<&str>,
        file_id: u64,
    ) {
        let Some(notify_dir) = &self.config.notify_dir else {
            return;
        };

        let msg = NotifyMessage {
            notify_type,
            pid: std::process::id(),
            db_path: db_path.into(),
            bucket_name: bucket_name.map(Into::into),
            file_id,
        };

        let seq = self.notify_seq.fetch_add(1, AcqRel);
        if let Err(e) = msg.write(notify_dir, seq) {
            log::warn!("Failed to write notify file: {e:?}");
        }
    }

    fn run_task(self: &Arc<Self>, task: Task) {
        match task {
            Task::WriteSegment { db, bucket } => match bucket.write_segments() {
                Ok(true) => self.post_write_bucket_meta(db, bucket),
                Ok(false) => {}
                Err(e) => log::error!("Segment write failed: {e:?}"),
            },

            Task::WriteBucketMeta { db, bucket } => match bucket.write_meta() {
                Ok(Some(fileid)) => {
                    self.emit_notify(
                        NotifyType::UpdateBucketMeta,
                        &db.path,
                        Some(bucket.name()),
                        fileid,
                    );
                    self.post_part_merge(db, bucket);
                }
                Ok(None) => {}
                Err(e) => log::error!("Bucket metadata write failed: {e:?}"),
            },

            Task::PartMerge { db, bucket } => {
                let mut merged = false;

                while let Some(inputs) = bucket.pick_part_merge(&self.config) {
                    match bucket.execute_merge(&inputs) {
                        Ok(true) => merged = true,
                        Ok(false) => break,
                        Err(e) => {
                            log::error!("Part merge failed: {e:?}");
                            break;
                        }
                    }
                }

                if merged {
                    self.post_write_bucket_meta(db, bucket);
                }
            }

            Task::FullMerge { db, bucket } => match bucket.pick_full_merge() {
                Ok(Some(inputs)) => {
                    let result = bucket.execute_merge(&inputs);
                    bucket.end_full_merge();

                    match result {
                        Ok(true) => self.post_write_bucket_meta(db, bucket),
                        Ok(false) => {}
                        Err(e) => log::error!("Full merge failed: {e:?}"),
                    }
                }
                Ok(None) => bucket.end_full_merge(),
                Err(Error::InProcessing) => {
                    // Another full merge is running; retry after a pause
                    if !self.stop.is_tripped() {
                        std::thread::sleep(RETRY_BACKOFF);
                        self.post_full_merge(db, bucket);
                    }
                }
                Err(e) => log::error!("Full merge scheduling failed: {e:?}"),
            },

            Task::Reload { db, bucket_name } => {
                let result = match bucket_name {
                    Some(name) => db.reload_bucket(&name),
                    None => db.reload_meta(self),
                };
                if let Err(e) = result {
                    log::error!("Reload failed: {e:?}");
                }
            }

            Task::Shutdown => unreachable!("handled by the worker loop"),
        }
    }
}

fn worker_loop(engine: Arc<EngineInner>, rx: Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        if matches!(task, Task::Shutdown) {
            break;
        }
        engine.run_task(task);
    }
}

fn try_flush_loop(engine: Arc<EngineInner>) {
    while !engine.stop.is_tripped() {
        std::thread::sleep(Duration::from_secs(1));

        let dbs: Vec<Arc<DbInner>> = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let dbs = engine.dbs.lock().expect("lock is poisoned");
            dbs.values().cloned().collect()
        };

        for db in dbs {
            for bucket in db.buckets() {
                if bucket.try_seal_aged(engine.config.flush_interval_s) {
                    engine.post_write_segment(db.clone(), bucket);
                }
            }
        }
    }
}

fn cleaner_loop(engine: Arc<EngineInner>) {
    let interval = Duration::from_secs(engine.config.clean_interval_s.into());
    let mut last_sweep = std::time::Instant::now();

    while !engine.stop.is_tripped() {
        std::thread::sleep(Duration::from_millis(250));

        if last_sweep.elapsed() < interval {
            continue;
        }
        last_sweep = std::time::Instant::now();

        let dbs: Vec<Arc<DbInner>> = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let dbs = engine.dbs.lock().expect("lock is poisoned");
            dbs.values().cloned().collect()
        };

        for db in dbs {
            if let Err(e) = db.clean() {
                log::warn!("Db cleaning pass failed: {e:?}");
            }
            for bucket in db.buckets() {
                if let Err(e) = bucket.clean() {
                    log::warn!("Bucket cleaning pass failed: {e:?}");
                }
            }
        }

        if let Some(notify_dir) = &engine.config.notify_dir {
            if let Err(e) = crate::notify::reap_expired(notify_dir, engine.config.notify_file_ttl_s)
            {
                log::warn!("Notify reaping failed: {e:?}");
            }
        }
    }
}

/// Watches the notify directory and posts reloads for peer publications.
fn watcher_loop(engine: Arc<EngineInner>, notify_dir: PathBuf) {
    use notify::Watcher;

    let (tx, rx) = crossbeam_channel::unbounded::<PathBuf>();

    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.kind.is_create() || event.kind.is_modify() {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        }
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            log::error!("Failed to create filesystem watcher: {e:?}");
            return;
        }
    };

    let _ = std::fs::create_dir_all(&notify_dir);
    if let Err(e) = watcher.watch(&notify_dir, notify::RecursiveMode::NonRecursive) {
        log::error!("Failed to watch notify dir: {e:?}");
        return;
    }

    let own_pid = std::process::id();

    while !engine.stop.is_tripped() {
        let Ok(path) = rx.recv_timeout(Duration::from_millis(500)) else {
            continue;
        };

        if path.extension().and_then(|x| x.to_str()) != Some(crate::file::NOTIFY_FILE_EXT) {
            continue;
        }

        let Ok(msg) = NotifyMessage::read(&path) else {
            continue;
        };

        if msg.pid == own_pid {
            continue;
        }

        let db = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let dbs = engine.dbs.lock().expect("lock is poisoned");
            dbs.get(&msg.db_path).cloned()
        };

        if let Some(db) = db {
            match msg.notify_type {
                NotifyType::UpdateBucketMeta => engine.post_reload(db, msg.bucket_name),
                NotifyType::UpdateDbMeta | NotifyType::ExitBecomingDead => {
                    engine.post_reload(db, None);
                }
            }
        }
    }
}

/// The process-wide engine: caches, worker pools and background threads
///
/// Created explicitly by the application and passed to [`DB::open`]; there
/// is no global singleton. Dropping the engine stops it.
///
/// [`DB::open`]: crate::DB::open
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Validates the configuration and starts the worker pools.
    pub fn start(config: GlobalConfig) -> Result<Self> {
        config.check()?;

        let cache = Arc::new(Cache::new(
            config.index_cache_size,
            config.data_cache_size,
            config.bloom_filter_cache_size,
        ));

        let inner = Arc::new(EngineInner {
            config,
            cache,
            cache_ids: AtomicU64::new(0),
            dbs: Mutex::new(BTreeMap::new()),
            senders: OnceLock::new(),
            threads: Mutex::new(vec![]),
            stop: ShutdownFlag::default(),
            notify_seq: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        });

        let mut threads = vec![];

        let mut spawn_pool = |n: usize| {
            let (tx, rx) = bounded::<Task>(TASK_QUEUE_CAPACITY);
            for _ in 0..n {
                let engine = inner.clone();
                let rx = rx.clone();
                threads.push(std::thread::spawn(move || worker_loop(engine, rx)));
            }
            tx
        };

        let senders = if inner.config.mode.is_writable() {
            let write_segment = spawn_pool(inner.config.write_segment_threads);
            let write_meta: Vec<Sender<Task>> = (0..inner.config.write_metadata_threads)
                .map(|_| spawn_pool(1))
                .collect();
            let part_merge = spawn_pool(inner.config.part_merge_threads.max(1));
            let full_merge = spawn_pool(inner.config.full_merge_threads.max(1));

            Senders {
                write_segment,
                write_meta,
                part_merge,
                full_merge,
                reload: None,
            }
        } else {
            let reload = spawn_pool(inner.config.reload_db_threads.max(1));

            // The other queues stay unused in read-only mode
            Senders {
                write_segment: spawn_pool(0),
                write_meta: vec![],
                part_merge: spawn_pool(0),
                full_merge: spawn_pool(0),
                reload: Some(reload),
            }
        };

        #[allow(clippy::expect_used)]
        inner
            .senders
            .set(senders)
            .map_err(|_| ())
            .expect("senders are set exactly once");

        if inner.config.mode.is_writable() {
            let engine = inner.clone();
            threads.push(std::thread::spawn(move || try_flush_loop(engine)));

            let engine = inner.clone();
            threads.push(std::thread::spawn(move || cleaner_loop(engine)));
        } else if inner.config.auto_reload_db {
            if let Some(notify_dir) = inner.config.notify_dir.clone() {
                let engine = inner.clone();
                threads.push(std::thread::spawn(move || watcher_loop(engine, notify_dir)));
            }
        }

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        inner.threads.lock().expect("lock is poisoned").extend(threads);

        log::info!("Engine started in {:?} mode", inner.config.mode);

        Ok(Self { inner })
    }

    /// Drains the worker pools and joins all background threads.
    ///
    /// Tasks already dequeued run to completion; the queues are then
    /// terminated by sentinel messages.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, SeqCst) {
            return;
        }

        log::info!("Stopping engine");

        // Announce the shutdown to peers before going quiet
        let dbs: Vec<Arc<DbInner>> = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let dbs = self.inner.dbs.lock().expect("lock is poisoned");
            dbs.values().cloned().collect()
        };
        for db in &dbs {
            self.inner
                .emit_notify(NotifyType::ExitBecomingDead, &db.path, None, 0);
        }

        self.inner.stop.trip();

        let threads = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut threads = self.inner.threads.lock().expect("lock is poisoned");
            std::mem::take(&mut *threads)
        };

        if let Some(senders) = self.inner.senders.get() {
            let all: Vec<&Sender<Task>> = std::iter::once(&senders.write_segment)
                .chain(senders.write_meta.iter())
                .chain([&senders.part_merge, &senders.full_merge])
                .chain(senders.reload.iter())
                .collect();

            // One sentinel per worker thread; extras are harmless
            for tx in &all {
                for _ in 0..threads.len() {
                    let _ = tx.send(Task::Shutdown);
                }
            }
        }

        for handle in threads {
            if handle.join().is_err() {
                log::error!("A worker thread panicked during shutdown");
            }
        }

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.inner.dbs.lock().expect("lock is poisoned").clear();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use test_log::test;

    #[test]
    fn engine_start_stop() -> Result<()> {
        let engine = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
        engine.stop();
        // Stop is idempotent
        engine.stop();
        Ok(())
    }

    #[test]
    fn engine_rejects_invalid_config() {
        let config = GlobalConfig::default().merge_factor(1);
        assert!(matches!(
            Engine::start(config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
