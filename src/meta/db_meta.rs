// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{
    read_str, write_end, write_tagged_str, write_tagged_u64, Decode, DecodeError, Encode,
    EncodeError, MID_END, MID_START,
};
use crate::file::{db_meta_path, rewrite_atomic, FileHeader, DB_META_MAGIC};
use crate::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::path::Path;
use varint_rs::{VarintReader, VarintWriter};

const MID_BUCKET_ID: u32 = MID_START;
const MID_BUCKET_NAME: u32 = 3;
const MID_CREATE_TIME: u32 = 4;

const MID_NEXT_BUCKET_ID: u32 = 20;

/// Identity of one bucket
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BucketInfo {
    pub id: u32,
    pub name: String,
    pub create_time: u64,
}

impl BucketInfo {
    #[must_use]
    pub fn new(name: String, id: u32) -> Self {
        Self {
            id,
            name,
            create_time: crate::file::unix_timestamp_s(),
        }
    }

    /// Directory name of the bucket below the db path.
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.name, self.id)
    }
}

fn encode_bucket_info<W: Write>(
    writer: &mut W,
    info: &BucketInfo,
) -> std::result::Result<(), EncodeError> {
    write_tagged_u64(writer, MID_BUCKET_ID, info.id.into())?;
    write_tagged_str(writer, MID_BUCKET_NAME, info.name.as_bytes())?;
    write_tagged_u64(writer, MID_CREATE_TIME, info.create_time)?;
    write_end(writer)
}

fn decode_bucket_info<R: Read>(reader: &mut R) -> std::result::Result<BucketInfo, DecodeError> {
    let mut info = BucketInfo {
        id: 0,
        name: String::new(),
        create_time: 0,
    };

    loop {
        let tag = reader.read_u32_varint()?;
        match tag {
            MID_END => break,
            MID_BUCKET_ID => {
                #[allow(clippy::cast_possible_truncation)]
                {
                    info.id = reader.read_u64_varint()? as u32;
                }
            }
            MID_BUCKET_NAME => {
                info.name = String::from_utf8(read_str(reader)?)
                    .map_err(|_| DecodeError::InvalidLength("bucket name not utf-8"))?;
            }
            MID_CREATE_TIME => info.create_time = reader.read_u64_varint()?,
            _ => return Err(DecodeError::InvalidTag(("BucketInfo", tag.into()))),
        }
    }

    Ok(info)
}

/// One db-metadata snapshot: the set of buckets and the id counter
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DbMeta {
    pub alive_buckets: Vec<BucketInfo>,

    /// Deleted but not yet physically removed
    pub deleted_buckets: Vec<BucketInfo>,

    pub next_bucket_id: u32,
}

impl Encode for DbMeta {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        let mut body = vec![];

        for buckets in [&self.alive_buckets, &self.deleted_buckets] {
            #[allow(clippy::cast_possible_truncation)]
            body.write_u32_varint(buckets.len() as u32)?;
            for info in buckets {
                encode_bucket_info(&mut body, info)?;
            }
        }

        write_tagged_u64(&mut body, MID_NEXT_BUCKET_ID, self.next_bucket_id.into())?;
        write_end(&mut body)?;

        let crc = crc32fast::hash(&body);
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(crc)?;

        Ok(())
    }
}

impl Decode for DbMeta {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let mut meta = Self::default();

        let alive_count = reader.read_u32_varint()?;
        for _ in 0..alive_count {
            meta.alive_buckets.push(decode_bucket_info(reader)?);
        }

        let deleted_count = reader.read_u32_varint()?;
        for _ in 0..deleted_count {
            meta.deleted_buckets.push(decode_bucket_info(reader)?);
        }

        loop {
            let tag = reader.read_u32_varint()?;
            match tag {
                MID_END => break,
                MID_NEXT_BUCKET_ID => {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        meta.next_bucket_id = reader.read_u64_varint()? as u32;
                    }
                }
                _ => return Err(DecodeError::InvalidTag(("DbMeta", tag.into()))),
            }
        }

        let _crc = reader.read_u32::<LittleEndian>()?;

        Ok(meta)
    }
}

impl DbMeta {
    /// Writes one snapshot durably: temp file, fsync, rename.
    pub fn write(&self, db_path: &Path, fileid: u64) -> Result<()> {
        let mut content = vec![];
        FileHeader::new(DB_META_MAGIC).encode_into(&mut content)?;
        self.encode_into(&mut content)?;

        rewrite_atomic(&db_meta_path(db_path, fileid), &content)?;

        log::debug!(
            "Wrote db metadata {fileid} ({} buckets)",
            self.alive_buckets.len()
        );

        Ok(())
    }

    /// Reads and parses one snapshot.
    pub fn read(db_path: &Path, fileid: u64) -> Result<Self> {
        let body = crate::file::read_with_header(&db_meta_path(db_path, fileid), DB_META_MAGIC)?;
        Ok(Self::decode_from(&mut &body[..])?)
    }
}

/// An open, share-locked db-metadata file
///
/// Every consuming process keeps the latest snapshot open with the shared
/// advisory lock; the cleaner only removes snapshots it can lock
/// exclusively.
pub struct DbMetaHandle {
    fileid: u64,
    _file: std::fs::File,
}

impl DbMetaHandle {
    /// Opens and parses a snapshot, holding the shared lock until drop.
    pub fn open(db_path: &Path, fileid: u64) -> Result<(Self, DbMeta)> {
        use crate::Error;

        let path = db_meta_path(db_path, fileid);

        let mut file = std::fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::PathNotExist
            } else {
                Error::FileOpen(e)
            }
        })?;

        file.try_lock_shared().map_err(|_| Error::FileLock)?;

        FileHeader::decode_from(&mut file, DB_META_MAGIC)?;
        let meta = DbMeta::decode_from(&mut file)?;

        Ok((Self { fileid, _file: file }, meta))
    }

    #[must_use]
    pub fn fileid(&self) -> u64 {
        self.fileid
    }
}

/// Removes an obsolete db-metadata snapshot once no process references it.
pub fn clean_obsolete_db_meta(db_path: &Path, fileid: u64) -> Result<()> {
    use crate::Error;
    use fs2::FileExt;

    let path = db_meta_path(db_path, fileid);

    let file = match std::fs::File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::FileOpen(e)),
    };

    if file.try_lock_exclusive().is_err() {
        return Err(Error::InProcessing);
    }

    drop(file);
    std::fs::remove_file(&path).map_err(Error::PathDelete)?;
    log::debug!("Cleaned db metadata {fileid}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use test_log::test;

    #[test]
    fn db_meta_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

        let meta = DbMeta {
            alive_buckets: vec![
                BucketInfo::new("users".into(), 1),
                BucketInfo::new("posts".into(), 2),
            ],
            deleted_buckets: vec![BucketInfo::new("tmp".into(), 3)],
            next_bucket_id: 4,
        };

        meta.write(dir.path(), 1)?;
        assert_eq!(meta, DbMeta::read(dir.path(), 1)?);

        Ok(())
    }

    #[test]
    fn db_meta_missing_file() {
        #[allow(clippy::expect_used)]
        let dir = tempfile::tempdir().expect("tempdir should be creatable");

        assert!(matches!(
            DbMeta::read(dir.path(), 1),
            Err(Error::PathNotExist)
        ));
    }
}
