// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{
    write_end, write_tagged_u64, Decode, DecodeError, Encode, EncodeError, MID_END, MID_START,
};
use crate::file::{bucket_meta_path, rewrite_atomic, FileHeader, BUCKET_META_MAGIC};
use crate::segment::{SegmentFileId, SegmentStat};
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs2::FileExt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use varint_rs::{VarintReader, VarintWriter};

const MID_SEGMENT_ID: u32 = MID_START;
const MID_L2INDEX_META_SIZE: u32 = 3;
const MID_INDEX_FILESIZE: u32 = 4;
const MID_DATA_FILESIZE: u32 = 5;

const MID_NEXT_SEGMENT_ID: u32 = 20;
const MID_NEXT_OBJECT_ID: u32 = 21;
const MID_MAX_LEVEL_NUM: u32 = 22;

/// One bucket-metadata snapshot
///
/// The union over all historic snapshots is monotonic: a fileid that was
/// once recorded pending-delete never reappears alive.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BucketMeta {
    /// Stats of every segment alive in this snapshot, fileid ascending
    pub alive_segments: Vec<SegmentStat>,

    /// Superseded by a completed merge; deletable once unreferenced
    pub pending_delete_fileids: Vec<SegmentFileId>,

    /// Introduced since the previous snapshot
    pub new_fileids: Vec<SegmentFileId>,

    pub next_segment_id: u64,
    pub next_object_id: u64,
    pub max_level_num: u8,
}

impl Encode for BucketMeta {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        let mut body = vec![];

        #[allow(clippy::cast_possible_truncation)]
        body.write_u32_varint(self.alive_segments.len() as u32)?;
        for stat in &self.alive_segments {
            write_tagged_u64(&mut body, MID_SEGMENT_ID, stat.segment_fileid.raw())?;
            write_tagged_u64(&mut body, MID_L2INDEX_META_SIZE, stat.l2_index_meta_size.into())?;
            write_tagged_u64(&mut body, MID_INDEX_FILESIZE, stat.index_filesize)?;
            write_tagged_u64(&mut body, MID_DATA_FILESIZE, stat.data_filesize)?;
            write_end(&mut body)?;
        }

        for fileids in [&self.pending_delete_fileids, &self.new_fileids] {
            #[allow(clippy::cast_possible_truncation)]
            body.write_u32_varint(fileids.len() as u32)?;
            for fileid in fileids {
                body.write_u64_varint(fileid.raw())?;
            }
        }

        write_tagged_u64(&mut body, MID_NEXT_SEGMENT_ID, self.next_segment_id)?;
        write_tagged_u64(&mut body, MID_NEXT_OBJECT_ID, self.next_object_id)?;
        write_tagged_u64(&mut body, MID_MAX_LEVEL_NUM, self.max_level_num.into())?;
        write_end(&mut body)?;

        let crc = crc32fast::hash(&body);
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(crc)?;

        Ok(())
    }
}

impl Decode for BucketMeta {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let mut meta = Self::default();

        let alive_count = reader.read_u32_varint()?;
        for _ in 0..alive_count {
            let mut stat = SegmentStat {
                segment_fileid: SegmentFileId::from_raw(0),
                data_filesize: 0,
                index_filesize: 0,
                l2_index_meta_size: 0,
            };

            loop {
                let tag = reader.read_u32_varint()?;
                match tag {
                    MID_END => break,
                    MID_SEGMENT_ID => {
                        stat.segment_fileid = SegmentFileId::from_raw(reader.read_u64_varint()?);
                    }
                    MID_L2INDEX_META_SIZE => {
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            stat.l2_index_meta_size = reader.read_u64_varint()? as u32;
                        }
                    }
                    MID_INDEX_FILESIZE => stat.index_filesize = reader.read_u64_varint()?,
                    MID_DATA_FILESIZE => stat.data_filesize = reader.read_u64_varint()?,
                    _ => return Err(DecodeError::InvalidTag(("SegmentStat", tag.into()))),
                }
            }

            meta.alive_segments.push(stat);
        }

        let pending_count = reader.read_u32_varint()?;
        for _ in 0..pending_count {
            meta.pending_delete_fileids
                .push(SegmentFileId::from_raw(reader.read_u64_varint()?));
        }

        let new_count = reader.read_u32_varint()?;
        for _ in 0..new_count {
            meta.new_fileids
                .push(SegmentFileId::from_raw(reader.read_u64_varint()?));
        }

        loop {
            let tag = reader.read_u32_varint()?;
            match tag {
                MID_END => break,
                MID_NEXT_SEGMENT_ID => meta.next_segment_id = reader.read_u64_varint()?,
                MID_NEXT_OBJECT_ID => meta.next_object_id = reader.read_u64_varint()?,
                MID_MAX_LEVEL_NUM => {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        meta.max_level_num = reader.read_u64_varint()? as u8;
                    }
                }
                _ => return Err(DecodeError::InvalidTag(("BucketMeta", tag.into()))),
            }
        }

        let _crc = reader.read_u32::<LittleEndian>()?;

        Ok(meta)
    }
}

impl BucketMeta {
    /// Writes one snapshot durably: temp file, fsync, rename.
    pub fn write(&self, bucket_path: &Path, fileid: u64) -> Result<()> {
        let mut content = vec![];
        FileHeader::new(BUCKET_META_MAGIC).encode_into(&mut content)?;
        self.encode_into(&mut content)?;

        rewrite_atomic(&bucket_meta_path(bucket_path, fileid), &content)?;

        log::debug!(
            "Wrote bucket metadata {fileid} ({} alive, {} pending delete)",
            self.alive_segments.len(),
            self.pending_delete_fileids.len(),
        );

        Ok(())
    }
}

/// An open, share-locked bucket-metadata file
///
/// The shared advisory lock keeps the referenced segment files reachable:
/// the cleaner only unlinks files listed by snapshots it can lock
/// exclusively.
pub struct BucketMetaHandle {
    fileid: u64,
    _file: File,
}

impl BucketMetaHandle {
    /// Opens and parses a snapshot, holding the shared lock until drop.
    pub fn open(bucket_path: &Path, fileid: u64) -> Result<(Self, BucketMeta)> {
        let path = bucket_meta_path(bucket_path, fileid);

        let mut file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::PathNotExist
            } else {
                Error::FileOpen(e)
            }
        })?;

        file.try_lock_shared().map_err(|_| Error::FileLock)?;

        FileHeader::decode_from(&mut file, BUCKET_META_MAGIC)?;
        let meta = BucketMeta::decode_from(&mut file)?;

        Ok((Self { fileid, _file: file }, meta))
    }

    #[must_use]
    pub fn fileid(&self) -> u64 {
        self.fileid
    }
}

/// Reads the pending-delete list of an obsolete snapshot and unlinks those
/// segment files, then the snapshot itself.
///
/// Returns [`Error::InProcessing`] when another process still holds the
/// snapshot open; the caller retries on its next cleaning pass.
pub fn clean_obsolete_meta(bucket_path: &Path, fileid: u64) -> Result<()> {
    let path = bucket_meta_path(bucket_path, fileid);

    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::FileOpen(e)),
    };

    if file.try_lock_exclusive().is_err() {
        return Err(Error::InProcessing);
    }

    FileHeader::decode_from(&mut file, BUCKET_META_MAGIC)?;
    let meta = BucketMeta::decode_from(&mut file)?;

    for fileid in &meta.pending_delete_fileids {
        for path in [
            crate::file::data_file_path(bucket_path, *fileid),
            crate::file::index_file_path(bucket_path, *fileid),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("Cleaned segment file {path:?}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::PathDelete(e)),
            }
        }
    }

    drop(file);
    std::fs::remove_file(&path).map_err(Error::PathDelete)?;
    log::debug!("Cleaned bucket metadata {fileid}");

    Ok(())
}
