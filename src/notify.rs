// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cross-process change notifications: small `.ntf` file drops in a shared
//! directory, watched by reader processes.
//!
//! This is a sidecar; its failure never affects correctness within one
//! process, so the writer side only logs on error.

use crate::coding::{
    read_str, write_end, write_tagged_str, write_tagged_u64, Decode, DecodeError, Encode,
    EncodeError, MID_END, MID_START,
};
use crate::file::{rewrite_atomic, FileHeader, NOTIFY_FILE_EXT, NOTIFY_FILE_MAGIC};
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use varint_rs::VarintReader;

const MID_TYPE: u32 = MID_START;
const MID_PID: u32 = 3;
const MID_DB_PATH: u32 = 4;
const MID_BUCKET_NAME: u32 = 5;
const MID_FILE_ID: u32 = 6;

/// What a peer process just did
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NotifyType {
    /// The writer is shutting down
    ExitBecomingDead,

    /// A new db-metadata snapshot was published
    UpdateDbMeta,

    /// A new bucket-metadata snapshot was published
    UpdateBucketMeta,
}

impl TryFrom<u8> for NotifyType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            0 => Ok(Self::ExitBecomingDead),
            1 => Ok(Self::UpdateDbMeta),
            2 => Ok(Self::UpdateBucketMeta),
            _ => Err(()),
        }
    }
}

impl From<NotifyType> for u8 {
    fn from(value: NotifyType) -> Self {
        match value {
            NotifyType::ExitBecomingDead => 0,
            NotifyType::UpdateDbMeta => 1,
            NotifyType::UpdateBucketMeta => 2,
        }
    }
}

/// Body of one notify drop
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotifyMessage {
    pub notify_type: NotifyType,
    pub pid: u32,
    pub db_path: PathBuf,
    pub bucket_name: Option<String>,
    pub file_id: u64,
}

impl Encode for NotifyMessage {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        let mut body = vec![];

        write_tagged_u64(&mut body, MID_TYPE, u8::from(self.notify_type).into())?;
        write_tagged_u64(&mut body, MID_PID, self.pid.into())?;
        write_tagged_str(
            &mut body,
            MID_DB_PATH,
            self.db_path.to_string_lossy().as_bytes(),
        )?;
        if let Some(bucket_name) = &self.bucket_name {
            write_tagged_str(&mut body, MID_BUCKET_NAME, bucket_name.as_bytes())?;
        }
        write_tagged_u64(&mut body, MID_FILE_ID, self.file_id)?;
        write_end(&mut body)?;

        let crc = crc32fast::hash(&body);
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(crc)?;

        Ok(())
    }
}

impl Decode for NotifyMessage {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let mut msg = Self {
            notify_type: NotifyType::ExitBecomingDead,
            pid: 0,
            db_path: PathBuf::new(),
            bucket_name: None,
            file_id: 0,
        };

        loop {
            let tag = reader.read_u32_varint()?;
            match tag {
                MID_END => break,
                MID_TYPE => {
                    #[allow(clippy::cast_possible_truncation)]
                    let raw = reader.read_u64_varint()? as u8;
                    msg.notify_type = NotifyType::try_from(raw)
                        .map_err(|()| DecodeError::InvalidTag(("NotifyType", raw.into())))?;
                }
                MID_PID => {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        msg.pid = reader.read_u64_varint()? as u32;
                    }
                }
                MID_DB_PATH => {
                    let raw = read_str(reader)?;
                    msg.db_path = PathBuf::from(
                        String::from_utf8(raw)
                            .map_err(|_| DecodeError::InvalidLength("db path not utf-8"))?,
                    );
                }
                MID_BUCKET_NAME => {
                    msg.bucket_name = Some(
                        String::from_utf8(read_str(reader)?)
                            .map_err(|_| DecodeError::InvalidLength("bucket name not utf-8"))?,
                    );
                }
                MID_FILE_ID => msg.file_id = reader.read_u64_varint()?,
                _ => return Err(DecodeError::InvalidTag(("NotifyMessage", tag.into()))),
            }
        }

        let _crc = reader.read_u32::<LittleEndian>()?;

        Ok(msg)
    }
}

impl NotifyMessage {
    /// Drops the message into the notify directory as `<pid>-<seq>.ntf`.
    pub fn write(&self, notify_dir: &Path, seq: u64) -> Result<()> {
        std::fs::create_dir_all(notify_dir).map_err(Error::PathCreate)?;

        let mut content = vec![];
        FileHeader::new(NOTIFY_FILE_MAGIC).encode_into(&mut content)?;
        self.encode_into(&mut content)?;

        let path = notify_dir.join(format!("{}-{seq}.{NOTIFY_FILE_EXT}", self.pid));
        rewrite_atomic(&path, &content)
    }

    /// Reads one notify drop.
    pub fn read(path: &Path) -> Result<Self> {
        let body = crate::file::read_with_header(path, NOTIFY_FILE_MAGIC)?;
        Ok(Self::decode_from(&mut &body[..])?)
    }
}

/// Deletes notify drops older than the TTL. Any process may reap.
pub fn reap_expired(notify_dir: &Path, ttl_s: u16) -> Result<usize> {
    let mut reaped = 0;

    let dirents = match std::fs::read_dir(notify_dir) {
        Ok(dirents) => dirents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::FileRead(e)),
    };

    let now = std::time::SystemTime::now();

    for dirent in dirents {
        let dirent = dirent.map_err(Error::FileRead)?;
        let path = dirent.path();

        if path.extension().and_then(|x| x.to_str()) != Some(NOTIFY_FILE_EXT) {
            continue;
        }

        let expired = dirent
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .is_some_and(|age| age.as_secs() >= u64::from(ttl_s));

        if expired {
            match std::fs::remove_file(&path) {
                Ok(()) => reaped += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::PathDelete(e)),
            }
        }
    }

    Ok(reaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn notify_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

        let msg = NotifyMessage {
            notify_type: NotifyType::UpdateBucketMeta,
            pid: 1234,
            db_path: "/tmp/d1".into(),
            bucket_name: Some("b".into()),
            file_id: 9,
        };

        msg.write(dir.path(), 1)?;

        let path = dir.path().join("1234-1.ntf");
        assert_eq!(msg, NotifyMessage::read(&path)?);

        Ok(())
    }

    #[test]
    fn notify_reap_honors_ttl() -> Result<()> {
        let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

        let msg = NotifyMessage {
            notify_type: NotifyType::UpdateDbMeta,
            pid: 1,
            db_path: "/tmp/d1".into(),
            bucket_name: None,
            file_id: 1,
        };
        msg.write(dir.path(), 1)?;

        // Fresh file survives a zero-aged sweep with a long TTL
        assert_eq!(0, reap_expired(dir.path(), 600)?);
        // TTL 0 reaps immediately
        assert_eq!(1, reap_expired(dir.path(), 0)?);
        assert_eq!(0, std::fs::read_dir(dir.path()).map_err(Error::FileRead)?.count());

        Ok(())
    }
}
