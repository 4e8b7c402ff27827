// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::segment::id::SegmentFileId;
use crate::segment::index_block::L0Entry;
use crate::Slice;
use quick_cache::{sync::Cache as QuickCache, Equivalent, Weighter};
use std::sync::Arc;

/// Process-unique id distinguishing buckets in the shared caches
pub type CacheId = u64;

#[derive(Eq, std::hash::Hash, PartialEq)]
struct CacheKey(CacheId, u64, u64);

impl Equivalent<CacheKey> for (CacheId, u64, u64) {
    fn equivalent(&self, key: &CacheKey) -> bool {
        self.0 == key.0 && self.1 == key.1 && self.2 == key.2
    }
}

impl From<(CacheId, SegmentFileId, u64)> for CacheKey {
    fn from((cache_id, fileid, offset): (CacheId, SegmentFileId, u64)) -> Self {
        Self(cache_id, fileid.raw(), offset)
    }
}

#[derive(Clone)]
struct SliceWeighter;

impl Weighter<CacheKey, Slice> for SliceWeighter {
    fn weight(&self, _: &CacheKey, item: &Slice) -> u64 {
        item.len() as u64
    }
}

#[derive(Clone)]
struct L0EntriesWeighter;

impl Weighter<CacheKey, Arc<[L0Entry]>> for L0EntriesWeighter {
    fn weight(&self, _: &CacheKey, item: &Arc<[L0Entry]>) -> u64 {
        item.iter()
            .map(|e| e.start_key.len() as u64 + 24)
            .sum::<u64>()
            .max(1)
    }
}

type SliceCache = QuickCache<CacheKey, Slice, SliceWeighter, rustc_hash::FxBuildHasher>;
type IndexCache = QuickCache<CacheKey, Arc<[L0Entry]>, L0EntriesWeighter, rustc_hash::FxBuildHasher>;

fn slice_cache(bytes: u64) -> SliceCache {
    use quick_cache::sync::DefaultLifecycle;

    // Capacity and hot-allocation values are constants, so this cannot fail
    #[allow(clippy::expect_used)]
    let opts = quick_cache::OptionsBuilder::new()
        .weight_capacity(bytes)
        .hot_allocation(0.9)
        .estimated_items_capacity(100_000)
        .build()
        .expect("cache options should be valid");

    #[allow(clippy::default_trait_access)]
    let cache = QuickCache::with_options(
        opts,
        SliceWeighter,
        Default::default(),
        DefaultLifecycle::default(),
    );

    cache
}

/// Process-wide block caches shared by all buckets of an engine
///
/// Holds bloom filter bytes, decoded L0-index entries and raw data blocks,
/// each bounded by its configured capacity. Lookups degrade to direct file
/// reads on a miss; correctness never depends on a hit.
pub struct Cache {
    filter: SliceCache,
    index: IndexCache,
    data: SliceCache,
}

impl Cache {
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(index_bytes: u64, data_bytes: u64, filter_bytes: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        let index_opts = quick_cache::OptionsBuilder::new()
            .weight_capacity(index_bytes)
            .hot_allocation(0.9)
            .estimated_items_capacity(100_000)
            .build()
            .expect("cache options should be valid");

        #[allow(clippy::default_trait_access)]
        let index = QuickCache::with_options(
            index_opts,
            L0EntriesWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            filter: slice_cache(filter_bytes),
            index,
            data: slice_cache(data_bytes),
        }
    }

    pub fn insert_filter(&self, id: CacheId, fileid: SegmentFileId, offset: u64, bytes: Slice) {
        self.filter.insert((id, fileid, offset).into(), bytes);
    }

    #[must_use]
    pub fn get_filter(&self, id: CacheId, fileid: SegmentFileId, offset: u64) -> Option<Slice> {
        self.filter.get(&(id, fileid.raw(), offset))
    }

    pub fn insert_index(
        &self,
        id: CacheId,
        fileid: SegmentFileId,
        offset: u64,
        entries: Arc<[L0Entry]>,
    ) {
        self.index.insert((id, fileid, offset).into(), entries);
    }

    #[must_use]
    pub fn get_index(
        &self,
        id: CacheId,
        fileid: SegmentFileId,
        offset: u64,
    ) -> Option<Arc<[L0Entry]>> {
        self.index.get(&(id, fileid.raw(), offset))
    }

    pub fn insert_data(&self, id: CacheId, fileid: SegmentFileId, offset: u64, bytes: Slice) {
        self.data.insert((id, fileid, offset).into(), bytes);
    }

    #[must_use]
    pub fn get_data(&self, id: CacheId, fileid: SegmentFileId, offset: u64) -> Option<Slice> {
        self.data.get(&(id, fileid.raw(), offset))
    }
}
