// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod snapshot;

use crate::cache::{Cache, CacheId};
use crate::config::{BucketConfig, GlobalConfig, Mode};
use crate::memtable::{MemWriter, MemWriterOps};
use crate::merge::{BoxedIterator, Merger};
use crate::meta::{BucketInfo, BucketMeta, BucketMetaHandle};
use crate::query::{LookupState, QueryStream};
use crate::segment::writer as segment_writer;
use crate::segment::{SegmentFileId, SegmentReader};
use crate::seqno::ObjectIdCounter;
use crate::stats::BucketStat;
use crate::value::{ObjectId, ObjectType, UserKey, UserValue, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::{Error, Result};
use snapshot::{ReaderSnapshot, View};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::AcqRel, Ordering::Acquire, Ordering::SeqCst};
use std::sync::{Arc, Mutex, RwLock};

const MIN_SEGMENT_ID: u64 = 1;
const MIN_META_FILEID: u64 = 1;

/// Bookkeeping protected by the bucket mutex
#[derive(Default)]
struct Pending {
    /// Introduced since the last metadata snapshot
    new_fileids: Vec<SegmentFileId>,

    /// Superseded since the last metadata snapshot
    merged_fileids: Vec<SegmentFileId>,

    /// Obsolete metadata snapshots awaiting the cleaner
    cleaning_meta_fileids: VecDeque<u64>,

    /// Segments currently feeding a merge
    merging: BTreeSet<SegmentFileId>,
}

/// One named keyspace: the per-bucket LSM engine
///
/// Short critical sections only: the mutex guards counters and
/// bookkeeping, the rwlock guards the swap of the three view pointers.
/// Readers clone the pointers and proceed lock-free.
pub struct Bucket {
    info: BucketInfo,
    path: PathBuf,
    config: BucketConfig,
    mode: Mode,

    cache_id: CacheId,
    cache: Arc<Cache>,

    next_object_id: ObjectIdCounter,
    next_segment_id: AtomicU64,
    next_meta_fileid: AtomicU64,

    pending: Mutex<Pending>,
    view: RwLock<View>,

    /// Serializes memwriter flushes of this bucket
    flush_mutex: Mutex<()>,

    full_merge_running: AtomicBool,
    deleted: AtomicBool,
}

impl Bucket {
    /// Opens (or creates) the bucket directory and publishes the first
    /// reader snapshot.
    pub fn open(
        db_path: &Path,
        info: BucketInfo,
        config: BucketConfig,
        mode: Mode,
        cache_id: CacheId,
        cache: Arc<Cache>,
    ) -> Result<Arc<Self>> {
        let path = db_path.join(info.dir_name());

        if !path.is_dir() {
            if !mode.is_writable() {
                return Err(Error::BucketNotExist);
            }
            std::fs::create_dir_all(&path).map_err(Error::PathCreate)?;

            let meta = BucketMeta {
                next_segment_id: MIN_SEGMENT_ID,
                next_object_id: crate::value::MIN_OBJECT_ID,
                max_level_num: config.max_level_num,
                ..BucketMeta::default()
            };
            meta.write(&path, MIN_META_FILEID)?;
        }

        if mode.is_writable() {
            crate::file::sweep_tmp_files(&path)?;
        }

        let meta_files = crate::file::list_numbered_files(&path, crate::file::BUCKET_META_EXT)?;
        let Some((latest_fileid, _)) = meta_files.last().cloned() else {
            return Err(Error::FileFormat(crate::coding::DecodeError::InvalidLength(
                "bucket has no metadata file",
            )));
        };

        let (handle, meta) = BucketMetaHandle::open(&path, latest_fileid)?;

        // A crash between segment rename and metadata rename leaves
        // unreferenced segment files; the exclusive db lock means nobody
        // else can be holding them
        if mode.is_writable() {
            sweep_orphan_segments(&path, &meta_files)?;
        }

        // The level ceiling is frozen into the bucket's first metadata file
        let mut config = config;
        config.max_level_num = meta.max_level_num.min(crate::segment::id::MAX_LEVEL);

        let mut segments = BTreeMap::new();
        for stat in &meta.alive_segments {
            match SegmentReader::open(&path, *stat, cache_id, cache.clone()) {
                Ok(reader) => {
                    segments.insert(stat.segment_fileid, Arc::new(reader));
                }
                Err(Error::FileFormat(e)) => {
                    log::error!(
                        "Detaching segment {} of bucket {:?}: {e:?}",
                        stat.segment_fileid,
                        info.name,
                    );
                }
                Err(Error::FileOpen(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::error!(
                        "Detaching missing segment {} of bucket {:?}",
                        stat.segment_fileid,
                        info.name,
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let bucket = Self {
            info,
            path,
            config,
            mode,
            cache_id,
            cache,
            next_object_id: ObjectIdCounter::new(meta.next_object_id),
            next_segment_id: AtomicU64::new(meta.next_segment_id),
            next_meta_fileid: AtomicU64::new(latest_fileid + 1),
            pending: Mutex::new(Pending {
                cleaning_meta_fileids: meta_files
                    .iter()
                    .map(|(id, _)| *id)
                    .filter(|id| *id != latest_fileid)
                    .collect(),
                ..Pending::default()
            }),
            view: RwLock::new(View {
                active: None,
                sealed: Arc::new(vec![]),
                readers: Arc::new(ReaderSnapshot {
                    segments,
                    meta_handle: Some(Arc::new(handle)),
                }),
            }),
            flush_mutex: Mutex::new(()),
            full_merge_running: AtomicBool::default(),
            deleted: AtomicBool::default(),
        };

        log::debug!(
            "Opened bucket {:?} with {} segments (meta {latest_fileid})",
            bucket.info.name,
            bucket.view().readers.segments.len(),
        );

        Ok(Arc::new(bucket))
    }

    /// Name of the bucket.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Identity of the bucket.
    #[must_use]
    pub fn info(&self) -> &BucketInfo {
        &self.info
    }

    /// Directory holding the bucket's files.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, SeqCst);
    }

    #[must_use]
    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(SeqCst)
    }

    /// Clones the three view pointers under a short read lock.
    #[must_use]
    pub(crate) fn view(&self) -> View {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let view = self.view.read().expect("lock is poisoned");
        view.clone()
    }

    fn check_sizes(key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE || value.len() > MAX_VALUE_SIZE {
            return Err(Error::ObjectTooLarge);
        }
        Ok(())
    }

    /// Appends one mutation; returns `true` if the active memwriter was
    /// sealed and a flush task should be posted.
    pub fn write(
        &self,
        object_type: ObjectType,
        key: UserKey,
        value: UserValue,
        config: &GlobalConfig,
    ) -> Result<bool> {
        self.write_many(std::iter::once((object_type, key, value)), config)
    }

    /// Appends a group of mutations under one lock acquisition.
    pub fn write_many<I: Iterator<Item = (ObjectType, UserKey, UserValue)>>(
        &self,
        mutations: I,
        config: &GlobalConfig,
    ) -> Result<bool> {
        if self.is_deleted() {
            return Err(Error::BucketDeleted);
        }

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut view = self.view.write().expect("lock is poisoned");

        let mut sealed = false;

        for (object_type, key, value) in mutations {
            Self::check_sizes(&key, &value)?;

            let active = match &view.active {
                Some(active) => active.clone(),
                None => {
                    let writer = Arc::new(MemWriter::for_mode(self.mode));
                    view.active = Some(writer.clone());
                    writer
                }
            };

            let id = self.next_object_id.next();
            active.write(id, object_type, key, value)?;

            if active.size() >= config.max_memtable_size
                || active.object_count() >= config.max_memtable_objects
            {
                self.seal_locked(&mut view);
                sealed = true;
            }
        }

        Ok(sealed)
    }

    fn seal_locked(&self, view: &mut View) {
        let Some(active) = view.active.take() else {
            return;
        };
        active.seal();

        let mut chain = vec![active];
        chain.extend(view.sealed.iter().cloned());
        view.sealed = Arc::new(chain);
    }

    /// Seals the active memwriter if it is older than the flush interval.
    pub fn try_seal_aged(&self, flush_interval_s: u16) -> bool {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut view = self.view.write().expect("lock is poisoned");

        let should = view.active.as_ref().is_some_and(|active| {
            active.object_count() > 0 && active.elapsed_secs() >= u64::from(flush_interval_s)
        });

        if should {
            self.seal_locked(&mut view);
        }
        should
    }

    /// Unconditionally seals a nonempty active memwriter.
    pub fn force_seal(&self) -> bool {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut view = self.view.write().expect("lock is poisoned");

        let should = view
            .active
            .as_ref()
            .is_some_and(|active| active.object_count() > 0);

        if should {
            self.seal_locked(&mut view);
        }
        should
    }

    /// Point lookup under the current view.
    pub fn get(&self, key: &[u8]) -> Result<Option<UserValue>> {
        if self.is_deleted() {
            return Err(Error::BucketDeleted);
        }

        let view = self.view();
        let visible_id = self.next_object_id.get().saturating_sub(1);

        let mut state = LookupState::new();

        if let Some(active) = &view.active {
            match state.feed(active.get(key, visible_id)) {
                Ok(result) => return Ok(result),
                Err(s) => state = s,
            }
        }

        for writer in view.sealed.iter() {
            match state.feed(writer.get(key, visible_id)) {
                Ok(result) => return Ok(result),
                Err(s) => state = s,
            }
        }

        for reader in view.readers.segments.values().rev() {
            match state.feed(reader.get(key)?) {
                Ok(result) => return Ok(result),
                Err(s) => state = s,
            }
        }

        Ok(state.finish())
    }

    /// Ordered iterator over the live `(key, value)` pairs of the bucket.
    ///
    /// Memwriter contents are snapshotted at creation; segments stream
    /// lazily. The iterator stays stable against later mutations.
    pub fn iter(&self) -> BucketIter {
        let view = self.view();
        let visible_id = self.next_object_id.get().saturating_sub(1);

        let mut sources: Vec<BoxedIterator<'static>> = vec![];

        if let Some(active) = &view.active {
            let records: Vec<_> = active.iter(visible_id).collect();
            sources.push(Box::new(records.into_iter()));
        }

        for writer in view.sealed.iter() {
            let records: Vec<_> = writer.iter(visible_id).collect();
            sources.push(Box::new(records.into_iter()));
        }

        for reader in view.readers.segments.values().rev() {
            sources.push(Box::new(reader.clone().scan()));
        }

        BucketIter {
            inner: QueryStream::new(Merger::new(sources)),
            _view: view,
        }
    }

    /// Aggregated statistics of the bucket.
    #[must_use]
    pub fn stat(&self) -> BucketStat {
        let view = self.view();
        let mut stat = BucketStat::default();

        if let Some(active) = &view.active {
            stat.memwriter_stat.add(active.size());
            stat.object_stat.merge(&active.object_stat());
        }
        for writer in view.sealed.iter() {
            stat.memwriter_stat.add(writer.size());
            stat.object_stat.merge(&writer.object_stat());
        }
        for reader in view.readers.segments.values() {
            stat.segment_stat.add(reader.disk_size());
            stat.object_stat.merge(&reader.meta().object_stat);
        }

        stat
    }

    /// Turns sealed memwriters into segments, oldest first; returns
    /// `true` if a metadata write should follow.
    ///
    /// At most one flush runs per bucket; the publish is incremental so a
    /// failure leaves the remaining chain intact for a retry.
    pub fn write_segments(&self) -> Result<bool> {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let _guard = self.flush_mutex.lock().expect("lock is poisoned");

        let mut wrote_any = false;

        loop {
            if self.is_deleted() {
                break;
            }

            let Some(mem) = self.view().sealed.last().cloned() else {
                break;
            };

            let fileid = SegmentFileId::new(self.next_segment_id.fetch_add(1, AcqRel), 0);

            let mut writer = segment_writer::Writer::new(segment_writer::Options {
                bucket_path: self.path.clone(),
                fileid,
                bloom_filter_bitnum: self.config.bloom_filter_bitnum,
                sync_data: self.config.sync_data,
                max_merge_segment_id: fileid.segment_id(),
            })?;

            for obj in mem.iter(ObjectId::MAX) {
                writer.write(obj?)?;
            }

            let reader = match writer.finish()? {
                Some(stat) => Some(Arc::new(SegmentReader::open(
                    &self.path,
                    stat,
                    self.cache_id,
                    self.cache.clone(),
                )?)),
                None => None,
            };

            // Publish: insert the segment and drop the flushed memwriter
            // in one swap, so readers never miss its data
            {
                #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let mut pending = self.pending.lock().expect("lock is poisoned");

                #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let mut view = self.view.write().expect("lock is poisoned");

                let mut segments = view.readers.segments.clone();
                if let Some(reader) = reader {
                    segments.insert(fileid, reader);
                    pending.new_fileids.push(fileid);
                    wrote_any = true;
                }

                let sealed: Vec<_> = view
                    .sealed
                    .iter()
                    .filter(|w| !Arc::ptr_eq(w, &mem))
                    .cloned()
                    .collect();

                view.sealed = Arc::new(sealed);
                view.readers = Arc::new(ReaderSnapshot {
                    segments,
                    meta_handle: view.readers.meta_handle.clone(),
                });
            }

            log::trace!("Flushed memwriter of bucket {:?} into {fileid}", self.info.name);
        }

        Ok(wrote_any)
    }

    /// Persists a new metadata snapshot covering everything introduced or
    /// superseded since the previous one; returns the new fileid.
    pub fn write_meta(&self) -> Result<Option<u64>> {
        if self.is_deleted() {
            return Ok(None);
        }

        let (new_fileids, merged_fileids) = {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let pending = self.pending.lock().expect("lock is poisoned");
            if pending.new_fileids.is_empty() && pending.merged_fileids.is_empty() {
                return Ok(None);
            }
            (pending.new_fileids.clone(), pending.merged_fileids.clone())
        };

        let fileid = self.next_meta_fileid.fetch_add(1, AcqRel);

        let view = self.view();
        let meta = BucketMeta {
            alive_segments: view.readers.alive_stats(),
            pending_delete_fileids: merged_fileids.clone(),
            new_fileids: new_fileids.clone(),
            next_segment_id: self.next_segment_id.load(Acquire),
            next_object_id: self.next_object_id.get(),
            max_level_num: self.config.max_level_num,
        };

        meta.write(&self.path, fileid)?;

        let (handle, _) = BucketMetaHandle::open(&self.path, fileid)?;

        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut pending = self.pending.lock().expect("lock is poisoned");

            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut view = self.view.write().expect("lock is poisoned");

            let old_handle = view.readers.meta_handle.clone();

            view.readers = Arc::new(ReaderSnapshot {
                segments: view.readers.segments.clone(),
                meta_handle: Some(Arc::new(handle)),
            });

            pending.new_fileids.drain(..new_fileids.len());
            pending.merged_fileids.drain(..merged_fileids.len());

            if let Some(old) = old_handle {
                pending.cleaning_meta_fileids.push_back(old.fileid());
            }
        }

        Ok(Some(fileid))
    }

    /// Picks a part-merge input set at the lowest eligible level and
    /// reserves it, or returns `None` when nothing qualifies.
    pub fn pick_part_merge(&self, config: &GlobalConfig) -> Option<Vec<SegmentFileId>> {
        let view = self.view();

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut pending = self.pending.lock().expect("lock is poisoned");

        for level in 0..self.config.max_level_num {
            let candidates: Vec<SegmentFileId> = view
                .readers
                .fileids_at_level(level, self.config.max_level_num)
                .into_iter()
                .filter(|id| !pending.merging.contains(id))
                .collect();

            if candidates.len() < config.merge_factor {
                continue;
            }

            let group: Vec<SegmentFileId> =
                candidates.into_iter().take(config.merge_factor).collect();

            let total_size: u64 = group
                .iter()
                .filter_map(|id| view.readers.segments.get(id))
                .map(|r| r.disk_size())
                .sum();

            if total_size > config.max_merge_size {
                continue;
            }

            pending.merging.extend(group.iter().copied());
            return Some(group);
        }

        None
    }

    /// Reserves all alive segments for a full merge.
    ///
    /// Fails with [`Error::InProcessing`] when a full merge is already
    /// running, so the caller can reschedule.
    pub fn pick_full_merge(&self) -> Result<Option<Vec<SegmentFileId>>> {
        if self
            .full_merge_running
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_err()
        {
            return Err(Error::InProcessing);
        }

        let view = self.view();

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut pending = self.pending.lock().expect("lock is poisoned");

        let group: Vec<SegmentFileId> = view
            .readers
            .segments
            .keys()
            .copied()
            .filter(|id| !pending.merging.contains(id))
            .collect();

        // A lone segment is already fully merged
        if group.len() < 2 {
            self.full_merge_running.store(false, SeqCst);
            return Ok(None);
        }

        pending.merging.extend(group.iter().copied());
        Ok(Some(group))
    }

    pub(crate) fn end_full_merge(&self) {
        self.full_merge_running.store(false, SeqCst);
    }

    fn unreserve(&self, inputs: &[SegmentFileId]) {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut pending = self.pending.lock().expect("lock is poisoned");
        for id in inputs {
            pending.merging.remove(id);
        }
    }

    /// Output fileid for a merge of `inputs` (ascending).
    fn output_fileid(&self, inputs: &[SegmentFileId]) -> SegmentFileId {
        #[allow(clippy::expect_used)]
        let first = inputs.first().expect("merge inputs are nonempty");

        if first.can_increment_merge_count() {
            first.incremented()
        } else {
            SegmentFileId::new(self.next_segment_id.fetch_add(1, AcqRel), 0xFF)
        }
    }

    /// Merges the reserved input set into one segment and publishes the
    /// result; returns `true` if a metadata write should follow.
    pub fn execute_merge(&self, inputs: &[SegmentFileId]) -> Result<bool> {
        // Hold a snapshot for the whole merge: it pins the segment readers
        // and the metadata lock that keeps the input files on disk
        let view = self.view();

        let result = self.execute_merge_inner(&view, inputs);
        self.unreserve(inputs);
        result
    }

    fn execute_merge_inner(&self, view: &View, inputs: &[SegmentFileId]) -> Result<bool> {
        if self.is_deleted() {
            return Ok(false);
        }

        let Some(readers) = inputs
            .iter()
            .map(|id| view.readers.segments.get(id).cloned())
            .collect::<Option<Vec<_>>>()
        else {
            log::warn!("Merge inputs vanished from bucket {:?}", self.info.name);
            return Ok(false);
        };

        if readers.len() < 2 {
            return Ok(false);
        }

        let output = self.output_fileid(inputs);

        // The output is the bucket's oldest data iff every alive segment
        // is an input; only then may tombstones be dropped
        let evict_tombstones = view.readers.segments.len() == inputs.len();

        let max_merge_segment_id = inputs
            .iter()
            .map(|id| id.segment_id())
            .max()
            .unwrap_or_default();

        let mut sources: Vec<BoxedIterator<'_>> = vec![];
        for reader in readers.iter().rev() {
            sources.push(Box::new(reader.clone().scan()));
        }

        let stream = crate::compaction::stream::CompactionStream::new(
            Merger::new(sources),
            evict_tombstones,
        );

        let mut writer = segment_writer::Writer::new(segment_writer::Options {
            bucket_path: self.path.clone(),
            fileid: output,
            bloom_filter_bitnum: self.config.bloom_filter_bitnum,
            sync_data: self.config.sync_data,
            max_merge_segment_id,
        })?;

        for obj in stream {
            writer.write(obj?)?;
        }

        let new_reader = match writer.finish()? {
            Some(stat) => Some(Arc::new(SegmentReader::open(
                &self.path,
                stat,
                self.cache_id,
                self.cache.clone(),
            )?)),
            None => None,
        };

        {
            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut pending = self.pending.lock().expect("lock is poisoned");

            #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut view = self.view.write().expect("lock is poisoned");

            let mut segments = view.readers.segments.clone();
            for id in inputs {
                segments.remove(id);
            }
            if let Some(reader) = new_reader {
                segments.insert(output, reader);
                pending.new_fileids.push(output);
            }

            pending.merged_fileids.extend(inputs.iter().copied());

            view.readers = Arc::new(ReaderSnapshot {
                segments,
                meta_handle: view.readers.meta_handle.clone(),
            });
        }

        log::debug!(
            "Merged {} segments of bucket {:?} into {output}",
            inputs.len(),
            self.info.name,
        );

        Ok(true)
    }

    /// Deletes obsolete metadata snapshots and the segment files they
    /// superseded. Stops early when a snapshot is still referenced.
    pub fn clean(&self) -> Result<()> {
        loop {
            let fileid = {
                #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let pending = self.pending.lock().expect("lock is poisoned");
                match pending.cleaning_meta_fileids.front() {
                    Some(id) => *id,
                    None => return Ok(()),
                }
            };

            match crate::meta::bucket_meta::clean_obsolete_meta(&self.path, fileid) {
                Ok(()) => {
                    #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                    let mut pending = self.pending.lock().expect("lock is poisoned");
                    pending.cleaning_meta_fileids.pop_front();
                }
                Err(Error::InProcessing) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Reloads the reader snapshot from the newest metadata file,
    /// reusing already-open segment readers. Read-only engines call this
    /// when a peer process publishes.
    pub fn reload(&self) -> Result<()> {
        let meta_files =
            crate::file::list_numbered_files(&self.path, crate::file::BUCKET_META_EXT)?;
        let Some((latest_fileid, _)) = meta_files.last().cloned() else {
            return Ok(());
        };

        let current_fileid = self
            .view()
            .readers
            .meta_handle
            .as_ref()
            .map_or(0, |h| h.fileid());

        if latest_fileid <= current_fileid {
            return Ok(());
        }

        let (handle, meta) = BucketMetaHandle::open(&self.path, latest_fileid)?;

        let old_view = self.view();
        let mut segments = BTreeMap::new();

        for stat in &meta.alive_segments {
            if let Some(existing) = old_view.readers.segments.get(&stat.segment_fileid) {
                segments.insert(stat.segment_fileid, existing.clone());
                continue;
            }
            match SegmentReader::open(&self.path, *stat, self.cache_id, self.cache.clone()) {
                Ok(reader) => {
                    segments.insert(stat.segment_fileid, Arc::new(reader));
                }
                Err(Error::FileFormat(e)) => {
                    log::error!(
                        "Detaching segment {} of bucket {:?}: {e:?}",
                        stat.segment_fileid,
                        self.info.name,
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.next_object_id.fetch_max(meta.next_object_id);
        self.next_segment_id.fetch_max(meta.next_segment_id, AcqRel);

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut view = self.view.write().expect("lock is poisoned");

        view.readers = Arc::new(ReaderSnapshot {
            segments,
            meta_handle: Some(Arc::new(handle)),
        });

        log::debug!(
            "Reloaded bucket {:?} at metadata {latest_fileid}",
            self.info.name
        );

        Ok(())
    }

    /// Removes the bucket directory and everything in it.
    pub fn remove_dir(path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::PathDelete(e)),
        }
    }
}

/// Deletes segment files no metadata snapshot on disk references.
fn sweep_orphan_segments(
    bucket_path: &Path,
    meta_files: &[(u64, PathBuf)],
) -> Result<()> {
    use crate::coding::Decode;

    let mut referenced = BTreeSet::new();

    for (_, meta_path) in meta_files {
        let body =
            crate::file::read_with_header(meta_path, crate::file::BUCKET_META_MAGIC)?;
        let meta = BucketMeta::decode_from(&mut &body[..])?;

        referenced.extend(meta.alive_segments.iter().map(|s| s.segment_fileid));
        referenced.extend(meta.pending_delete_fileids.iter().copied());
        referenced.extend(meta.new_fileids.iter().copied());
    }

    for fileid in crate::file::list_segment_files(bucket_path)? {
        if referenced.contains(&fileid) {
            continue;
        }

        log::warn!("Sweeping orphan segment {fileid}");

        for path in [
            crate::file::data_file_path(bucket_path, fileid),
            crate::file::index_file_path(bucket_path, fileid),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::PathDelete(e)),
            }
        }
    }

    Ok(())
}

/// Forward iterator over the live pairs of one bucket
pub struct BucketIter {
    inner: QueryStream<Merger<'static>>,

    /// Keeps the memwriters and segment readers of the iteration alive
    _view: View,
}

impl Iterator for BucketIter {
    type Item = Result<(UserKey, UserValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
