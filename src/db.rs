// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::batch::ObjectBatch;
use crate::bucket::{Bucket, BucketIter};
use crate::config::{DbConfig, Mode};
use crate::engine::{Engine, EngineInner};
use crate::lock::LockFile;
use crate::meta::db_meta::{clean_obsolete_db_meta, DbMetaHandle};
use crate::meta::{BucketInfo, DbMeta};
use crate::notify::NotifyType;
use crate::stats::BucketStat;
use crate::value::{ObjectType, UserKey, UserValue};
use crate::{Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};

const MIN_BUCKET_ID: u32 = 1;
const MIN_META_FILEID: u64 = 1;

/// Metadata bookkeeping protected by the db mutex
struct MetaState {
    next_bucket_id: u32,
    next_meta_fileid: u64,
    handle: Option<Arc<DbMetaHandle>>,

    /// Obsolete db-metadata snapshots awaiting the cleaner
    cleaning_meta_fileids: VecDeque<u64>,

    /// Buckets removed from the namespace but not yet from disk
    deleted_buckets: Vec<BucketInfo>,
}

pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    config: DbConfig,
    mode: Mode,
    _lock: LockFile,

    /// Copy-on-write bucket set
    buckets: RwLock<Arc<BTreeMap<String, Arc<Bucket>>>>,

    meta: Mutex<MetaState>,
}

impl DbInner {
    /// All currently alive buckets.
    pub(crate) fn buckets(&self) -> Vec<Arc<Bucket>> {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let buckets = self.buckets.read().expect("lock is poisoned");
        buckets.values().cloned().collect()
    }

    fn bucket(&self, name: &str) -> Result<Arc<Bucket>> {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let buckets = self.buckets.read().expect("lock is poisoned");
        buckets.get(name).cloned().ok_or(Error::BucketNotExist)
    }

    /// Persists a db-metadata snapshot reflecting the current bucket set.
    fn write_meta_locked(&self, state: &mut MetaState) -> Result<u64> {
        let alive_buckets: Vec<BucketInfo> = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let buckets = self.buckets.read().expect("lock is poisoned");
            buckets.values().map(|b| b.info().clone()).collect()
        };

        let meta = DbMeta {
            alive_buckets,
            deleted_buckets: state.deleted_buckets.clone(),
            next_bucket_id: state.next_bucket_id,
        };

        let fileid = state.next_meta_fileid;
        state.next_meta_fileid += 1;

        meta.write(&self.path, fileid)?;

        let (handle, _) = DbMetaHandle::open(&self.path, fileid)?;

        if let Some(old) = state.handle.replace(Arc::new(handle)) {
            state.cleaning_meta_fileids.push_back(old.fileid());
        }

        Ok(fileid)
    }

    /// Removes obsolete metadata snapshots and deleted bucket directories.
    pub(crate) fn clean(&self) -> Result<()> {
        if !self.mode.is_writable() {
            return Ok(());
        }

        loop {
            let fileid = {
                #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let state = self.meta.lock().expect("lock is poisoned");
                match state.cleaning_meta_fileids.front() {
                    Some(id) => *id,
                    None => break,
                }
            };

            match clean_obsolete_db_meta(&self.path, fileid) {
                Ok(()) => {
                    #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                    let mut state = self.meta.lock().expect("lock is poisoned");
                    state.cleaning_meta_fileids.pop_front();
                }
                Err(Error::InProcessing) => break,
                Err(e) => return Err(e),
            }
        }

        let deleted: Vec<BucketInfo> = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut state = self.meta.lock().expect("lock is poisoned");
            std::mem::take(&mut state.deleted_buckets)
        };

        for info in deleted {
            Bucket::remove_dir(&self.path.join(info.dir_name()))?;
            log::debug!("Removed directory of deleted bucket {:?}", info.name);
        }

        Ok(())
    }

    /// Re-reads the newest db metadata, opening new buckets and dropping
    /// removed ones. Read-only engines run this on peer publications.
    pub(crate) fn reload_meta(&self, engine: &EngineInner) -> Result<()> {
        let meta_files =
            crate::file::list_numbered_files(&self.path, crate::file::DB_META_EXT)?;
        let Some((latest_fileid, _)) = meta_files.last().cloned() else {
            return Ok(());
        };

        let current = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let state = self.meta.lock().expect("lock is poisoned");
            state.handle.as_ref().map_or(0, |h| h.fileid())
        };

        if latest_fileid <= current {
            return Ok(());
        }

        let (handle, meta) = DbMetaHandle::open(&self.path, latest_fileid)?;

        let mut new_buckets = BTreeMap::new();
        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let buckets = self.buckets.read().expect("lock is poisoned").clone();

            for info in &meta.alive_buckets {
                if let Some(existing) = buckets.get(&info.name) {
                    new_buckets.insert(info.name.clone(), existing.clone());
                } else {
                    let bucket = Bucket::open(
                        &self.path,
                        info.clone(),
                        self.config.config_for(&info.name),
                        self.mode,
                        engine.next_cache_id(),
                        engine.cache.clone(),
                    )?;
                    new_buckets.insert(info.name.clone(), bucket);
                }
            }

            for (name, bucket) in buckets.iter() {
                if !new_buckets.contains_key(name) {
                    bucket.mark_deleted();
                }
            }
        }

        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut buckets = self.buckets.write().expect("lock is poisoned");
            *buckets = Arc::new(new_buckets);
        }

        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut state = self.meta.lock().expect("lock is poisoned");
            state.handle = Some(Arc::new(handle));
            state.next_bucket_id = state.next_bucket_id.max(meta.next_bucket_id);
        }

        log::debug!("Reloaded db {:?} at metadata {latest_fileid}", self.path);

        Ok(())
    }

    pub(crate) fn reload_bucket(&self, name: &str) -> Result<()> {
        match self.bucket(name) {
            Ok(bucket) => bucket.reload(),
            Err(Error::BucketNotExist) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn check_bucket_name(name: &str) -> Result<()> {
    let bytes = name.as_bytes();

    if !(3..=63).contains(&bytes.len()) {
        return Err(Error::BucketName);
    }

    let mut chars = bytes.iter();

    #[allow(clippy::expect_used)]
    let first = chars.next().expect("length was checked");
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return Err(Error::BucketName);
    }

    if chars.any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == b'-' || *c == b'_')) {
        return Err(Error::BucketName);
    }

    Ok(())
}

/// A handle to one open database
///
/// Cheap to clone; the engine owns the underlying state until it stops.
#[derive(Clone)]
pub struct DB {
    inner: Arc<DbInner>,
    engine: Weak<EngineInner>,
}

impl DB {
    /// Opens a database at `path`, creating it when the engine is
    /// writable. A writable open takes the exclusive `LOCK`; a second
    /// writable open of the same path fails with [`Error::FileLock`].
    pub fn open<P: Into<PathBuf>>(engine: &Engine, config: DbConfig, path: P) -> Result<Self> {
        config.check()?;

        let engine_inner = engine.inner.clone();
        let mode = engine_inner.config.mode;
        let path: PathBuf = path.into();

        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let dbs = engine_inner.dbs.lock().expect("lock is poisoned");
            if dbs.contains_key(&path) {
                return Err(Error::DbOpened);
            }
        }

        if !path.is_dir() {
            if !mode.is_writable() {
                return Err(Error::DbNotExist);
            }
            std::fs::create_dir_all(&path).map_err(Error::PathCreate)?;
        }

        let lock = if mode.is_writable() {
            LockFile::acquire_exclusive(&path)?
        } else {
            LockFile::acquire_shared(&path)?
        };

        if mode.is_writable() {
            crate::file::sweep_tmp_files(&path)?;
        }

        let meta_files = crate::file::list_numbered_files(&path, crate::file::DB_META_EXT)?;

        let (latest_fileid, initial) = match meta_files.last() {
            Some((fileid, _)) => (*fileid, false),
            None => {
                if !mode.is_writable() {
                    return Err(Error::DbNotExist);
                }
                let meta = DbMeta {
                    next_bucket_id: MIN_BUCKET_ID,
                    ..DbMeta::default()
                };
                meta.write(&path, MIN_META_FILEID)?;
                (MIN_META_FILEID, true)
            }
        };

        let (handle, meta) = DbMetaHandle::open(&path, latest_fileid)?;

        let mut buckets = BTreeMap::new();
        for info in &meta.alive_buckets {
            let bucket = Bucket::open(
                &path,
                info.clone(),
                config.config_for(&info.name),
                mode,
                engine_inner.next_cache_id(),
                engine_inner.cache.clone(),
            )?;
            buckets.insert(info.name.clone(), bucket);
        }

        // Finish what a crashed deletion started
        if mode.is_writable() {
            for info in &meta.deleted_buckets {
                Bucket::remove_dir(&path.join(info.dir_name()))?;
            }
        }

        let inner = Arc::new(DbInner {
            path: path.clone(),
            config,
            mode,
            _lock: lock,
            buckets: RwLock::new(Arc::new(buckets)),
            meta: Mutex::new(MetaState {
                next_bucket_id: meta.next_bucket_id.max(MIN_BUCKET_ID),
                next_meta_fileid: latest_fileid + 1,
                handle: Some(Arc::new(handle)),
                cleaning_meta_fileids: meta_files
                    .iter()
                    .map(|(id, _)| *id)
                    .filter(|id| *id != latest_fileid)
                    .collect(),
                deleted_buckets: vec![],
            }),
        });

        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut dbs = engine_inner.dbs.lock().expect("lock is poisoned");
            if dbs.contains_key(&path) {
                return Err(Error::DbOpened);
            }
            dbs.insert(path.clone(), inner.clone());
        }

        log::info!(
            "Opened db {path:?} with {} buckets{}",
            inner.buckets().len(),
            if initial { " (created)" } else { "" },
        );

        Ok(Self {
            inner,
            engine: Arc::downgrade(&engine.inner),
        })
    }

    /// Deletes a whole database directory.
    ///
    /// Fails with [`Error::DbOpened`] when this engine has it open, or
    /// [`Error::FileLock`] when another process holds it.
    pub fn remove(engine: &Engine, path: &Path) -> Result<()> {
        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let dbs = engine.inner.dbs.lock().expect("lock is poisoned");
            if dbs.contains_key(path) {
                return Err(Error::DbOpened);
            }
        }

        if !path.is_dir() {
            return Err(Error::DbNotExist);
        }

        let lock = LockFile::acquire_exclusive(path)?;
        drop(lock);

        std::fs::remove_dir_all(path).map_err(Error::PathDelete)?;
        Ok(())
    }

    fn engine(&self) -> Result<Arc<EngineInner>> {
        self.engine.upgrade().ok_or(Error::Stopped)
    }

    fn require_writable(&self) -> Result<()> {
        if self.inner.mode.is_writable() {
            Ok(())
        } else {
            Err(Error::InvalidMode)
        }
    }

    fn require_readable(&self) -> Result<()> {
        if self.inner.mode.is_readable() {
            Ok(())
        } else {
            Err(Error::InvalidMode)
        }
    }

    /// Creates a bucket, writing the db metadata durably before returning.
    pub fn create_bucket(&self, name: &str) -> Result<()> {
        self.create_bucket_inner(name).map(|_| ())
    }

    fn create_bucket_inner(&self, name: &str) -> Result<Arc<Bucket>> {
        self.require_writable()?;
        check_bucket_name(name)?;

        let engine = self.engine()?;

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut state = self.inner.meta.lock().expect("lock is poisoned");

        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let buckets = self.inner.buckets.read().expect("lock is poisoned");
            if buckets.contains_key(name) {
                return Err(Error::BucketExist);
            }
        }

        let id = state.next_bucket_id;
        state.next_bucket_id += 1;

        let info = BucketInfo::new(name.into(), id);
        let bucket = Bucket::open(
            &self.inner.path,
            info,
            self.inner.config.config_for(name),
            self.inner.mode,
            engine.next_cache_id(),
            engine.cache.clone(),
        )?;

        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut buckets = self.inner.buckets.write().expect("lock is poisoned");
            let mut map = (**buckets).clone();
            map.insert(name.into(), bucket.clone());
            *buckets = Arc::new(map);
        }

        let fileid = self.inner.write_meta_locked(&mut state)?;
        engine.emit_notify(NotifyType::UpdateDbMeta, &self.inner.path, None, fileid);

        Ok(bucket)
    }

    /// Removes a bucket from the namespace; its files are reclaimed by
    /// the cleaner once the metadata is durable.
    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        self.require_writable()?;

        let engine = self.engine()?;

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut state = self.inner.meta.lock().expect("lock is poisoned");

        let bucket = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut buckets = self.inner.buckets.write().expect("lock is poisoned");
            let mut map = (**buckets).clone();
            let Some(bucket) = map.remove(name) else {
                return Err(Error::BucketNotExist);
            };
            *buckets = Arc::new(map);
            bucket
        };

        bucket.mark_deleted();
        state.deleted_buckets.push(bucket.info().clone());

        let fileid = self.inner.write_meta_locked(&mut state)?;
        engine.emit_notify(NotifyType::UpdateDbMeta, &self.inner.path, None, fileid);

        Ok(())
    }

    /// Names of all alive buckets, sorted.
    #[must_use]
    pub fn list_buckets(&self) -> Vec<String> {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let buckets = self.inner.buckets.read().expect("lock is poisoned");
        buckets.keys().cloned().collect()
    }

    /// Returns `true` if a bucket with that name is alive.
    #[must_use]
    pub fn exists_bucket(&self, name: &str) -> bool {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let buckets = self.inner.buckets.read().expect("lock is poisoned");
        buckets.contains_key(name)
    }

    /// Aggregated statistics of one bucket.
    pub fn get_bucket_stat(&self, name: &str) -> Result<BucketStat> {
        Ok(self.inner.bucket(name)?.stat())
    }

    fn bucket_for_write(&self, name: &str) -> Result<Arc<Bucket>> {
        match self.inner.bucket(name) {
            Ok(bucket) => Ok(bucket),
            Err(Error::BucketNotExist) if self.inner.config.create_bucket_if_missing => {
                match self.create_bucket_inner(name) {
                    Ok(bucket) => Ok(bucket),
                    // Lost a race against another creator
                    Err(Error::BucketExist) => self.inner.bucket(name),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn apply(&self, bucket_name: &str, object_type: ObjectType, key: UserKey, value: UserValue) -> Result<()> {
        self.require_writable()?;

        let engine = self.engine()?;
        let bucket = self.bucket_for_write(bucket_name)?;

        if bucket.write(object_type, key, value, &engine.config)? {
            engine.post_write_segment(self.inner.clone(), bucket);
        }

        Ok(())
    }

    /// Stores a value under the key, shadowing earlier records.
    pub fn set<K: Into<UserKey>, V: Into<UserValue>>(
        &self,
        bucket: &str,
        key: K,
        value: V,
    ) -> Result<()> {
        self.apply(bucket, ObjectType::Set, key.into(), value.into())
    }

    /// Appends a fragment onto the key's current value.
    pub fn append<K: Into<UserKey>, V: Into<UserValue>>(
        &self,
        bucket: &str,
        key: K,
        value: V,
    ) -> Result<()> {
        self.apply(bucket, ObjectType::Append, key.into(), value.into())
    }

    /// Writes a tombstone hiding all earlier records of the key.
    pub fn delete<K: Into<UserKey>>(&self, bucket: &str, key: K) -> Result<()> {
        self.apply(
            bucket,
            ObjectType::Delete,
            key.into(),
            UserValue::from(vec![]),
        )
    }

    /// Applies a batch, bucket by bucket.
    pub fn write(&self, batch: ObjectBatch) -> Result<()> {
        self.require_writable()?;

        let engine = self.engine()?;

        for (bucket_name, mutations) in batch.mutations {
            let bucket = self.bucket_for_write(&bucket_name)?;

            if bucket.write_many(mutations.into_iter(), &engine.config)? {
                engine.post_write_segment(self.inner.clone(), bucket);
            }
        }

        Ok(())
    }

    /// Point lookup; [`Error::ObjectNotExist`] for absent or tombstoned keys.
    pub fn get<K: AsRef<[u8]>>(&self, bucket: &str, key: K) -> Result<UserValue> {
        self.require_readable()?;

        self.inner
            .bucket(bucket)?
            .get(key.as_ref())?
            .ok_or(Error::ObjectNotExist)
    }

    /// Forward iterator over the live `(key, value)` pairs of a bucket.
    pub fn new_iterator(&self, bucket: &str) -> Result<BucketIter> {
        self.require_readable()?;
        Ok(self.inner.bucket(bucket)?.iter())
    }

    /// Asynchronously flushes the bucket (or all buckets): seals active
    /// memwriters and enqueues their segment writes.
    pub fn flush(&self, bucket: Option<&str>) -> Result<()> {
        self.require_writable()?;

        let engine = self.engine()?;

        for bucket in self.target_buckets(bucket)? {
            if bucket.force_seal() {
                engine.post_write_segment(self.inner.clone(), bucket);
            }
        }

        Ok(())
    }

    /// Asynchronously schedules a full merge of the bucket (or all).
    pub fn merge(&self, bucket: Option<&str>) -> Result<()> {
        self.require_writable()?;

        let engine = self.engine()?;

        for bucket in self.target_buckets(bucket)? {
            engine.post_full_merge(self.inner.clone(), bucket);
        }

        Ok(())
    }

    fn target_buckets(&self, name: Option<&str>) -> Result<Vec<Arc<Bucket>>> {
        match name {
            Some(name) => Ok(vec![self.inner.bucket(name)?]),
            None => Ok(self.inner.buckets()),
        }
    }

    /// The database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}
