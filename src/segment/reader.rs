// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::data_block::{DataBlock, DataItem};
use super::filter::BloomFilter;
use super::id::SegmentFileId;
use super::index_block::{decode_index_block, L0Entry};
use super::meta::{SegmentMeta, SegmentStat};
use crate::cache::{Cache, CacheId};
use crate::coding::{read_str, Decode, DecodeError};
use crate::file::{
    data_file_path, index_file_path, read_exact_at, FileHeader, DATA_FILE_MAGIC, INDEX_FILE_MAGIC,
};
use crate::query::PointRead;
use crate::value::{InternalKey, ObjectType, UserKey, UserValue};
use crate::{Error, Object, Result, Slice};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use varint_rs::VarintReader;

/// In-memory form of one L2-index entry, with its absolute file offset
#[derive(Clone, Debug)]
struct L1Entry {
    start_key: UserKey,
    offset: u64,
    bloom_size: u32,
    compress_size: u32,
    index_size: u32,
}

/// Random-access lookup and ordered iteration over one persisted segment
///
/// Only the L2 index and segment meta are memory-resident; block bodies are
/// fetched (and cached) on demand.
pub struct SegmentReader {
    fileid: SegmentFileId,
    cache_id: CacheId,
    stat: SegmentStat,
    meta: SegmentMeta,
    l1_entries: Vec<L1Entry>,
    data_file: File,
    index_file: File,
    cache: Arc<Cache>,
}

impl SegmentReader {
    pub fn open(
        bucket_path: &Path,
        stat: SegmentStat,
        cache_id: CacheId,
        cache: Arc<Cache>,
    ) -> Result<Self> {
        let index_path = index_file_path(bucket_path, stat.segment_fileid);
        let data_path = data_file_path(bucket_path, stat.segment_fileid);

        let mut index_file = File::open(&index_path).map_err(Error::FileOpen)?;
        let mut data_file = File::open(&data_path).map_err(Error::FileOpen)?;

        FileHeader::decode_from(&mut index_file, INDEX_FILE_MAGIC)?;
        FileHeader::decode_from(&mut data_file, DATA_FILE_MAGIC)?;

        let tail_size = stat.l2_index_meta_size as usize;
        if stat.index_filesize < tail_size as u64 {
            return Err(Error::FileFormat(DecodeError::InvalidLength(
                "index file shorter than its tail",
            )));
        }

        let tail = read_exact_at(
            &index_file,
            stat.index_filesize - tail_size as u64,
            tail_size,
        )
        .map_err(Error::FileRead)?;

        #[allow(clippy::indexing_slicing)]
        let (l2_index_size, meta_size) = {
            let mut trailer = &tail[tail_size - 8..];
            (
                trailer
                    .read_u32::<LittleEndian>()
                    .map_err(DecodeError::Io)? as usize,
                trailer
                    .read_u32::<LittleEndian>()
                    .map_err(DecodeError::Io)? as usize,
            )
        };

        if l2_index_size + meta_size + 8 != tail_size {
            return Err(Error::FileFormat(DecodeError::InvalidLength(
                "index trailer sizes do not add up",
            )));
        }

        #[allow(clippy::indexing_slicing)]
        let meta = {
            let region = &tail[l2_index_size..l2_index_size + meta_size];
            verify_region_crc(region)?;
            SegmentMeta::decode_from(&mut &*region)?
        };

        #[allow(clippy::indexing_slicing)]
        let l1_entries = {
            let region = &tail[..l2_index_size];
            verify_region_crc(region)?;
            parse_l2_index(region, meta.bloom_filter_bitnum)?
        };

        if l1_entries.is_empty() {
            return Err(Error::FileFormat(DecodeError::InvalidLength(
                "segment has no L1 index entries",
            )));
        }

        log::trace!(
            "Opened segment {} ({} L1 blocks, {} objects)",
            stat.segment_fileid,
            l1_entries.len(),
            meta.object_stat.count(),
        );

        Ok(Self {
            fileid: stat.segment_fileid,
            cache_id,
            stat,
            meta,
            l1_entries,
            data_file,
            index_file,
            cache,
        })
    }

    #[must_use]
    pub fn fileid(&self) -> SegmentFileId {
        self.fileid
    }

    #[must_use]
    pub fn stat(&self) -> &SegmentStat {
        &self.stat
    }

    #[must_use]
    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    #[must_use]
    pub fn max_key(&self) -> &UserKey {
        &self.meta.max_key
    }

    /// Total on-disk size of the file pair.
    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.stat.data_filesize + self.stat.index_filesize
    }

    /// Bloom filter of one L1 block, from cache or disk.
    fn load_filter(&self, entry: &L1Entry) -> Result<Option<BloomFilter>> {
        if entry.bloom_size == 0 {
            return Ok(None);
        }

        let bytes = if let Some(bytes) = self.cache.get_filter(self.cache_id, self.fileid, entry.offset) {
            bytes
        } else {
            let bytes = Slice::from(
                read_exact_at(&self.index_file, entry.offset, entry.bloom_size as usize)
                    .map_err(Error::FileRead)?,
            );
            self.cache
                .insert_filter(self.cache_id, self.fileid, entry.offset, bytes.clone());
            bytes
        };

        Ok(Some(BloomFilter::from_bytes(
            bytes,
            self.meta.bloom_filter_bitnum,
        )))
    }

    /// L0 entries of one L1 block, from cache or disk.
    fn load_l0_entries(&self, l1_idx: usize) -> Result<Arc<[L0Entry]>> {
        let Some(entry) = self.l1_entries.get(l1_idx) else {
            return Err(Error::FileFormat(DecodeError::InvalidLength(
                "L1 index out of range",
            )));
        };

        let block_offset = entry.offset + u64::from(entry.bloom_size);

        if let Some(entries) = self.cache.get_index(self.cache_id, self.fileid, block_offset) {
            return Ok(entries);
        }

        let block_size = (entry.compress_size - entry.bloom_size) as usize;
        let bytes = read_exact_at(&self.index_file, block_offset, block_size)
            .map_err(Error::FileRead)?;

        let entries: Arc<[L0Entry]> =
            decode_index_block(&bytes, entry.index_size as usize)?.into();

        self.cache
            .insert_index(self.cache_id, self.fileid, block_offset, entries.clone());

        Ok(entries)
    }

    /// One data block, from cache or disk.
    fn load_data_block(&self, entry: &L0Entry) -> Result<DataBlock> {
        let bytes = if let Some(bytes) = self.cache.get_data(self.cache_id, self.fileid, entry.offset)
        {
            bytes
        } else {
            let bytes = Slice::from(
                read_exact_at(&self.data_file, entry.offset, entry.compress_size as usize)
                    .map_err(Error::FileRead)?,
            );
            self.cache
                .insert_data(self.cache_id, self.fileid, entry.offset, bytes.clone());
            bytes
        };

        Ok(DataBlock::new(bytes, entry.index_size as usize)?)
    }

    /// Point lookup, folding the key's Append run within this segment.
    pub fn get(&self, key: &[u8]) -> Result<PointRead> {
        if key > &**self.max_key() {
            return Ok(PointRead::Miss);
        }

        // The run of a key starts in the last L1 block whose start key is
        // below it, except when a block boundary falls exactly on the key.
        let part = self
            .l1_entries
            .partition_point(|e| &*e.start_key < key);

        let l1_idx = match part.checked_sub(1) {
            Some(idx) => idx,
            None => {
                let starts_here = self
                    .l1_entries
                    .first()
                    .is_some_and(|e| &*e.start_key == key);

                if !starts_here {
                    return Ok(PointRead::Miss);
                }
                0
            }
        };

        #[allow(clippy::indexing_slicing)]
        let candidate = &self.l1_entries[l1_idx];

        if let Some(filter) = self.load_filter(candidate)? {
            if !filter.contains(key) {
                // The run may still start exactly at the next L1 boundary
                let next_starts_here = self
                    .l1_entries
                    .get(l1_idx + 1)
                    .is_some_and(|e| &*e.start_key == key);

                if !next_starts_here {
                    return Ok(PointRead::Miss);
                }
                return self.fold_run(l1_idx + 1, 0, key);
            }
        }

        let l0_entries = self.load_l0_entries(l1_idx)?;
        let l0_idx = l0_entries
            .partition_point(|e| &*e.start_key < key)
            .saturating_sub(1);

        self.fold_run(l1_idx, l0_idx, key)
    }

    /// Walks records from `(l1_idx, l0_idx)` forward, skipping keys below
    /// the target and folding the target's run until a Set or Delete.
    fn fold_run(&self, mut l1_idx: usize, mut l0_idx: usize, key: &[u8]) -> Result<PointRead> {
        let mut fragments: Vec<UserValue> = vec![];
        let mut found = false;

        let mut l0_entries = self.load_l0_entries(l1_idx)?;

        loop {
            let Some(entry) = l0_entries.get(l0_idx) else {
                l1_idx += 1;
                if l1_idx >= self.l1_entries.len() {
                    break;
                }
                l0_entries = self.load_l0_entries(l1_idx)?;
                l0_idx = 0;
                continue;
            };

            let block = self.load_data_block(entry)?;

            let first_group = if found { 0 } else { block.find_run_group(key) };

            for group_idx in first_group..block.group_count() {
                for item in block.group_items(group_idx)? {
                    if !found {
                        match (*item.key).cmp(key) {
                            std::cmp::Ordering::Less => continue,
                            std::cmp::Ordering::Greater => return Ok(PointRead::Miss),
                            std::cmp::Ordering::Equal => found = true,
                        }
                    } else if &*item.key != key {
                        return Ok(finish_fold(found, fragments));
                    }

                    match item.object_type {
                        ObjectType::Append => fragments.push(item.value),
                        ObjectType::Set => {
                            if fragments.is_empty() {
                                return Ok(PointRead::Set(item.value));
                            }
                            fragments.push(item.value);
                            return Ok(PointRead::Set(crate::slice::concat_slices(
                                fragments.iter().rev(),
                            )));
                        }
                        ObjectType::Delete => return Ok(PointRead::Tombstone(fragments)),
                    }
                }
            }

            l0_idx += 1;
        }

        Ok(finish_fold(found, fragments))
    }

    /// Ordered scan over all records of the segment.
    #[must_use]
    pub fn scan(self: Arc<Self>) -> SegmentScanner {
        SegmentScanner {
            reader: self,
            l1_idx: 0,
            l0_entries: None,
            l0_idx: 0,
            items: VecDeque::new(),
            done: false,
        }
    }
}

fn finish_fold(found: bool, fragments: Vec<UserValue>) -> PointRead {
    if !found {
        PointRead::Miss
    } else if fragments.is_empty() {
        // A key's run cannot be empty; reaching this means the only
        // records were consumed without a terminal, which leaves nothing
        PointRead::Miss
    } else {
        PointRead::Fragments(fragments)
    }
}

fn verify_region_crc(region: &[u8]) -> Result<()> {
    if region.len() < 4 {
        return Err(Error::FileFormat(DecodeError::InvalidLength(
            "region shorter than its checksum",
        )));
    }

    #[allow(clippy::indexing_slicing)]
    {
        let body = &region[..region.len() - 4];
        let stored = (&region[region.len() - 4..])
            .read_u32::<LittleEndian>()
            .map_err(DecodeError::Io)?;

        if stored != 0 {
            let crc = crc32fast::hash(body);
            if crc != stored {
                return Err(Error::FileFormat(DecodeError::InvalidChecksum((
                    crc, stored,
                ))));
            }
        }
    }

    Ok(())
}

fn parse_l2_index(region: &[u8], bloom_filter_bitnum: u8) -> Result<Vec<L1Entry>> {
    #[allow(clippy::indexing_slicing)]
    let mut reader = &region[..region.len() - 4];

    let mut offset = reader.read_u64_varint().map_err(DecodeError::Io)?;
    let count = reader.read_u32_varint().map_err(DecodeError::Io)?;

    let mut entries = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let start_key = UserKey::from(&*read_str(&mut reader)?);

        let bloom_size = if bloom_filter_bitnum > 0 {
            reader.read_u32_varint().map_err(DecodeError::Io)?
        } else {
            0
        };

        let compress_size = reader.read_u32_varint().map_err(DecodeError::Io)?;
        let _origin_diff = reader.read_u32_varint().map_err(DecodeError::Io)?;
        let index_size = reader.read_u32_varint().map_err(DecodeError::Io)?;

        entries.push(L1Entry {
            start_key,
            offset,
            bloom_size,
            compress_size,
            index_size,
        });

        offset += u64::from(compress_size);
    }

    Ok(entries)
}

/// Iterator over all records of a segment, in `(key asc, newest first)` order
pub struct SegmentScanner {
    reader: Arc<SegmentReader>,
    l1_idx: usize,
    l0_entries: Option<Arc<[L0Entry]>>,
    l0_idx: usize,
    items: VecDeque<DataItem>,
    done: bool,
}

impl SegmentScanner {
    fn refill(&mut self) -> Result<bool> {
        loop {
            let l0_entries = match self.l0_entries.clone() {
                Some(entries) => entries,
                None => {
                    if self.l1_idx >= self.reader.l1_entries.len() {
                        return Ok(false);
                    }
                    let entries = self.reader.load_l0_entries(self.l1_idx)?;
                    self.l0_entries = Some(entries.clone());
                    self.l0_idx = 0;
                    entries
                }
            };

            if let Some(entry) = l0_entries.get(self.l0_idx) {
                let block = self.reader.load_data_block(entry)?;
                self.items.extend(block.items()?);
                self.l0_idx += 1;
                return Ok(true);
            }

            self.l0_entries = None;
            self.l1_idx += 1;
        }
    }
}

impl Iterator for SegmentScanner {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        while self.items.is_empty() {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        let item = self.items.pop_front()?;

        Some(Ok(Object {
            key: InternalKey {
                user_key: item.key,
                id: 0,
                object_type: item.object_type,
            },
            value: item.value,
        }))
    }
}
