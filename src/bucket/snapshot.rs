// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::memtable::MemWriter;
use crate::meta::BucketMetaHandle;
use crate::segment::{SegmentFileId, SegmentReader, SegmentStat};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Immutable mapping of the bucket's visible on-disk state
///
/// Shared by pointer; replaced copy-on-write under the bucket's snapshot
/// rwlock. The metadata handle's shared lock keeps the referenced segment
/// files reachable across processes for as long as any holder lives.
pub struct ReaderSnapshot {
    /// Alive segments, ascending by fileid (descending = newest first)
    pub segments: BTreeMap<SegmentFileId, Arc<SegmentReader>>,

    /// The metadata file this snapshot is anchored on
    pub meta_handle: Option<Arc<BucketMetaHandle>>,
}

impl ReaderSnapshot {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            segments: BTreeMap::new(),
            meta_handle: None,
        }
    }

    /// Per-segment stats, fileid ascending, as recorded in metadata.
    #[must_use]
    pub fn alive_stats(&self) -> Vec<SegmentStat> {
        self.segments.values().map(|r| *r.stat()).collect()
    }

    /// Fileids at the given visible level, ascending.
    #[must_use]
    pub fn fileids_at_level(&self, level: u8, max_level: u8) -> Vec<SegmentFileId> {
        self.segments
            .keys()
            .copied()
            .filter(|id| id.merge_count().min(max_level) == level)
            .collect()
    }
}

/// The three pointers a reader clones under the snapshot rwlock
#[derive(Clone)]
pub struct View {
    /// The memwriter accepting new mutations, if any
    pub active: Option<Arc<MemWriter>>,

    /// Sealed memwriters not yet persisted, newest first
    pub sealed: Arc<Vec<Arc<MemWriter>>>,

    /// The persisted state
    pub readers: Arc<ReaderSnapshot>,
}

impl View {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            active: None,
            sealed: Arc::new(vec![]),
            readers: Arc::new(ReaderSnapshot::empty()),
        }
    }
}
