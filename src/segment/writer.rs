// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::block::{encode_block, MAX_BLOCK_ITEMS, MAX_BLOCK_SIZE};
use super::data_block::DataItem;
use super::filter::{get_hash, BloomFilter, CompositeHash};
use super::id::SegmentFileId;
use super::index_block::L0Entry;
use super::meta::{SegmentMeta, SegmentStat};
use crate::coding::{write_str, Encode};
use crate::file::{
    data_file_path, fsync_directory, index_file_path, tmp_path, FileHeader, DATA_FILE_MAGIC,
    FILE_HEADER_SIZE, INDEX_FILE_MAGIC,
};
use crate::stats::ObjectStat;
use crate::value::{UserKey, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::{Error, Object, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use varint_rs::VarintWriter;

/// L1 index blocks cut at this many L0 entries
const MAX_L1_ENTRIES: usize = MAX_BLOCK_ITEMS;

/// ... or at this much raw entry data
const MAX_L1_RAW_SIZE: usize = MAX_BLOCK_SIZE;

pub struct Options {
    pub bucket_path: PathBuf,
    pub fileid: SegmentFileId,

    /// Bloom bits per key; 0 disables filter blocks
    pub bloom_filter_bitnum: u8,

    /// fsync both files before renaming them into place
    pub sync_data: bool,

    /// Greatest input segment id for merges; the writer's own segment id
    /// for memwriter flushes
    pub max_merge_segment_id: u64,
}

struct L1Entry {
    start_key: UserKey,
    bloom_size: u32,
    compress_size: u32,
    origin_size: u32,
    index_size: u32,
}

/// Serializes a sorted object stream into an (index, data) file pair
///
/// Both files are written under `~`-prefixed temp names and renamed
/// atomically by [`Writer::finish`]. A failed write leaves only temp files
/// behind, which the startup sweeper reclaims.
pub struct Writer {
    opts: Options,

    data_writer: BufWriter<File>,
    index_writer: BufWriter<File>,

    tmp_data_path: PathBuf,
    tmp_index_path: PathBuf,

    /// Records of the data block currently being assembled
    chunk: Vec<DataItem>,
    chunk_size: usize,

    /// Write position in the data file
    data_offset: u64,

    /// Write position in the index file
    index_offset: u64,

    /// L0 entries waiting for the next L1 index block
    pending_l0: Vec<L0Entry>,
    pending_l0_raw: usize,

    /// Key hashes accumulated since the last L1 cut
    filter_hashes: Vec<CompositeHash>,

    l1_entries: Vec<L1Entry>,

    object_stat: ObjectStat,
    max_key: Option<UserKey>,
    max_object_id: u64,
}

impl Writer {
    pub fn new(opts: Options) -> Result<Self> {
        let tmp_data_path = tmp_path(&data_file_path(&opts.bucket_path, opts.fileid));
        let tmp_index_path = tmp_path(&index_file_path(&opts.bucket_path, opts.fileid));

        let mut data_writer = BufWriter::with_capacity(
            64 * 1_024,
            File::create(&tmp_data_path).map_err(Error::FileWrite)?,
        );
        let mut index_writer = BufWriter::with_capacity(
            64 * 1_024,
            File::create(&tmp_index_path).map_err(Error::FileWrite)?,
        );

        FileHeader::new(DATA_FILE_MAGIC).encode_into(&mut data_writer)?;
        FileHeader::new(INDEX_FILE_MAGIC).encode_into(&mut index_writer)?;

        Ok(Self {
            opts,
            data_writer,
            index_writer,
            tmp_data_path,
            tmp_index_path,
            chunk: vec![],
            chunk_size: 0,
            data_offset: FILE_HEADER_SIZE as u64,
            index_offset: FILE_HEADER_SIZE as u64,
            pending_l0: vec![],
            pending_l0_raw: 0,
            filter_hashes: vec![],
            l1_entries: vec![],
            object_stat: ObjectStat::default(),
            max_key: None,
            max_object_id: 0,
        })
    }

    /// Writes an item.
    ///
    /// # Note
    ///
    /// The incoming stream must be sorted by `(key asc, newest first)`,
    /// otherwise the block layout will be nonsense.
    pub fn write(&mut self, obj: Object) -> Result<()> {
        if obj.key.user_key.len() > MAX_KEY_SIZE || obj.value.len() > MAX_VALUE_SIZE {
            return Err(Error::ObjectTooLarge);
        }

        self.object_stat.add(
            obj.key.object_type,
            obj.key.user_key.len() as u64,
            obj.value.len() as u64,
        );
        self.max_object_id = self.max_object_id.max(obj.key.id);
        self.max_key = Some(obj.key.user_key.clone());

        if self.opts.bloom_filter_bitnum > 0 {
            self.filter_hashes.push(get_hash(&obj.key.user_key));
        }

        self.chunk_size += obj.key.user_key.len() + obj.value.len() + 8;
        self.chunk.push(DataItem {
            key: obj.key.user_key,
            object_type: obj.key.object_type,
            value: obj.value,
        });

        if self.chunk.len() >= MAX_BLOCK_ITEMS || self.chunk_size >= MAX_BLOCK_SIZE {
            self.spill_block()?;
        }

        Ok(())
    }

    /// Writes the buffered data block and registers its index entry.
    fn spill_block(&mut self) -> Result<()> {
        let Some(first) = self.chunk.first() else {
            return Ok(());
        };
        let start_key = first.key.clone();

        let (bytes, index_size) = encode_block(&self.chunk);

        self.data_writer
            .write_all(&bytes)
            .map_err(Error::FileWrite)?;

        #[allow(clippy::cast_possible_truncation)]
        let entry = L0Entry {
            start_key,
            offset: self.data_offset,
            compress_size: bytes.len() as u32,
            origin_size: bytes.len() as u32,
            index_size,
        };

        self.data_offset += bytes.len() as u64;
        self.pending_l0_raw += entry.start_key.len() + 16;
        self.pending_l0.push(entry);

        self.chunk.clear();
        self.chunk_size = 0;

        if self.pending_l0.len() >= MAX_L1_ENTRIES || self.pending_l0_raw >= MAX_L1_RAW_SIZE {
            self.cut_l1_block()?;
        }

        Ok(())
    }

    /// Writes `[bloom bytes][L0-index block]` to the index file.
    fn cut_l1_block(&mut self) -> Result<()> {
        let Some(first) = self.pending_l0.first() else {
            return Ok(());
        };
        let start_key = first.start_key.clone();

        let filter_bytes = if self.opts.bloom_filter_bitnum > 0 && !self.filter_hashes.is_empty() {
            let filter =
                BloomFilter::from_hashes(&self.filter_hashes, self.opts.bloom_filter_bitnum);
            self.filter_hashes.clear();
            filter.bytes().to_vec()
        } else {
            vec![]
        };

        let (block_bytes, index_size) = encode_block(&self.pending_l0);

        self.index_writer
            .write_all(&filter_bytes)
            .map_err(Error::FileWrite)?;
        self.index_writer
            .write_all(&block_bytes)
            .map_err(Error::FileWrite)?;

        let total = filter_bytes.len() + block_bytes.len();

        #[allow(clippy::cast_possible_truncation)]
        self.l1_entries.push(L1Entry {
            start_key,
            bloom_size: filter_bytes.len() as u32,
            compress_size: total as u32,
            origin_size: total as u32,
            index_size,
        });

        self.index_offset += total as u64;
        self.pending_l0.clear();
        self.pending_l0_raw = 0;

        Ok(())
    }

    /// Serializes the L2 index: start offset, L1 count, one entry per L1
    /// block, trailing CRC.
    fn encode_l2_index(&self) -> Vec<u8> {
        let mut body = vec![];

        #[allow(clippy::expect_used, clippy::cast_possible_truncation)]
        {
            body.write_u64_varint(FILE_HEADER_SIZE as u64)
                .expect("cannot fail");
            body.write_u32_varint(self.l1_entries.len() as u32)
                .expect("cannot fail");

            for entry in &self.l1_entries {
                write_str(&mut body, &entry.start_key).expect("cannot fail");
                if self.opts.bloom_filter_bitnum > 0 {
                    body.write_u32_varint(entry.bloom_size).expect("cannot fail");
                }
                body.write_u32_varint(entry.compress_size).expect("cannot fail");
                body.write_u32_varint(entry.origin_size - entry.compress_size)
                    .expect("cannot fail");
                body.write_u32_varint(entry.index_size).expect("cannot fail");
            }

            let crc = crc32fast::hash(&body);
            body.write_u32::<LittleEndian>(crc).expect("cannot fail");
        }

        body
    }

    /// Finishes the segment, making sure all data is written durably.
    ///
    /// Returns `None` if no objects were written.
    pub fn finish(mut self) -> Result<Option<SegmentStat>> {
        self.spill_block()?;
        self.cut_l1_block()?;

        let Some(max_key) = self.max_key.take() else {
            // No items written; drop the temp files
            drop(self.data_writer);
            drop(self.index_writer);
            let _ = std::fs::remove_file(&self.tmp_data_path);
            let _ = std::fs::remove_file(&self.tmp_index_path);
            return Ok(None);
        };

        let meta = SegmentMeta {
            object_stat: self.object_stat,
            bloom_filter_bitnum: self.opts.bloom_filter_bitnum,
            max_key,
            max_object_id: self.max_object_id,
            max_merge_segment_id: self.opts.max_merge_segment_id,
        };

        let l2_index = self.encode_l2_index();
        let meta_bytes = meta.encode_into_vec();

        self.index_writer
            .write_all(&l2_index)
            .map_err(Error::FileWrite)?;
        self.index_writer
            .write_all(&meta_bytes)
            .map_err(Error::FileWrite)?;

        #[allow(clippy::cast_possible_truncation)]
        {
            self.index_writer
                .write_u32::<LittleEndian>(l2_index.len() as u32)
                .map_err(Error::FileWrite)?;
            self.index_writer
                .write_u32::<LittleEndian>(meta_bytes.len() as u32)
                .map_err(Error::FileWrite)?;
        }

        #[allow(clippy::cast_possible_truncation)]
        let l2_index_meta_size = (l2_index.len() + meta_bytes.len() + 8) as u32;
        let index_filesize = self.index_offset + u64::from(l2_index_meta_size);

        let data_file = self
            .data_writer
            .into_inner()
            .map_err(|e| Error::FileWrite(e.into_error()))?;
        let index_file = self
            .index_writer
            .into_inner()
            .map_err(|e| Error::FileWrite(e.into_error()))?;

        if self.opts.sync_data {
            data_file.sync_all().map_err(Error::FileWrite)?;
            index_file.sync_all().map_err(Error::FileWrite)?;
        }

        drop(data_file);
        drop(index_file);

        std::fs::rename(
            &self.tmp_data_path,
            data_file_path(&self.opts.bucket_path, self.opts.fileid),
        )
        .map_err(Error::FileWrite)?;
        std::fs::rename(
            &self.tmp_index_path,
            index_file_path(&self.opts.bucket_path, self.opts.fileid),
        )
        .map_err(Error::FileWrite)?;

        fsync_directory(&self.opts.bucket_path).map_err(Error::FileWrite)?;

        log::debug!(
            "Written segment {} ({} objects, {} data bytes)",
            self.opts.fileid,
            meta.object_stat.count(),
            self.data_offset,
        );

        Ok(Some(SegmentStat {
            segment_fileid: self.opts.fileid,
            data_filesize: self.data_offset,
            index_filesize,
            l2_index_meta_size,
        }))
    }
}
