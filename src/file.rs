// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use crate::segment::id::SegmentFileId;
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "LOCK";

pub const DB_META_EXT: &str = "dbm";
pub const BUCKET_META_EXT: &str = "btm";
pub const INDEX_FILE_EXT: &str = "idx";
pub const DATA_FILE_EXT: &str = "dat";
pub const NOTIFY_FILE_EXT: &str = "ntf";

pub const DB_META_MAGIC: [u8; 4] = *b"DMET";
pub const BUCKET_META_MAGIC: [u8; 4] = *b"BMET";
pub const INDEX_FILE_MAGIC: [u8; 4] = *b"INDX";
pub const DATA_FILE_MAGIC: [u8; 4] = *b"DATA";
pub const NOTIFY_FILE_MAGIC: [u8; 4] = *b"NTFY";

pub const FORMAT_VERSION: u16 = 1;
const HEADER_VERSION: u8 = 1;

/// Size of the fixed header that starts every file
pub const FILE_HEADER_SIZE: usize = 32;

/// Temp files carry this prefix until they are renamed into place
pub const TMP_FILE_PREFIX: &str = "~";

/// The fixed 32-byte header that starts every file
///
/// Layout: 4 magic, 1 reserved, 1 header version, 2 LE format version,
/// 8 LE creation time (seconds), 16 reserved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub format_version: u16,
    pub created_at_s: u64,
}

impl FileHeader {
    #[must_use]
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            format_version: FORMAT_VERSION,
            created_at_s: unix_timestamp_s(),
        }
    }

    pub fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_all(&self.magic)?;
        writer.write_u8(0)?;
        writer.write_u8(HEADER_VERSION)?;
        writer.write_u16::<LittleEndian>(self.format_version)?;
        writer.write_u64::<LittleEndian>(self.created_at_s)?;
        writer.write_all(&[0; 16])?;
        Ok(())
    }

    /// Reads and checks a file header against the expected magic.
    pub fn decode_from<R: Read>(
        reader: &mut R,
        expected_magic: [u8; 4],
    ) -> std::result::Result<Self, DecodeError> {
        let mut magic = [0; 4];
        reader.read_exact(&mut magic)?;

        if magic != expected_magic {
            return Err(DecodeError::InvalidMagic(magic));
        }

        let _reserved = reader.read_u8()?;

        let header_version = reader.read_u8()?;
        if header_version != HEADER_VERSION {
            return Err(DecodeError::InvalidVersion(header_version.into()));
        }

        let format_version = reader.read_u16::<LittleEndian>()?;
        if format_version > FORMAT_VERSION {
            return Err(DecodeError::InvalidVersion(format_version));
        }

        let created_at_s = reader.read_u64::<LittleEndian>()?;

        let mut reserved = [0; 16];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            magic,
            format_version,
            created_at_s,
        })
    }
}

#[allow(clippy::expect_used)]
pub fn unix_timestamp_s() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time should be monotone")
        .as_secs()
}

pub fn db_meta_path(db_path: &Path, fileid: u64) -> PathBuf {
    db_path.join(format!("{fileid}.{DB_META_EXT}"))
}

pub fn bucket_meta_path(bucket_path: &Path, fileid: u64) -> PathBuf {
    bucket_path.join(format!("{fileid}.{BUCKET_META_EXT}"))
}

pub fn index_file_path(bucket_path: &Path, fileid: SegmentFileId) -> PathBuf {
    bucket_path.join(format!("{fileid}.{INDEX_FILE_EXT}"))
}

pub fn data_file_path(bucket_path: &Path, fileid: SegmentFileId) -> PathBuf {
    bucket_path.join(format!("{fileid}.{DATA_FILE_EXT}"))
}

/// Sibling path carrying the temp prefix.
#[allow(clippy::expect_used)]
pub fn tmp_path(path: &Path) -> PathBuf {
    let file_name = path.file_name().expect("path should have a file name");
    let mut tmp_name = std::ffi::OsString::from(TMP_FILE_PREFIX);
    tmp_name.push(file_name);
    path.with_file_name(tmp_name)
}

/// Lists `<decimal id>.<ext>` files in a directory, ascending by id.
pub fn list_numbered_files(dir: &Path, ext: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = vec![];

    for dirent in std::fs::read_dir(dir).map_err(Error::FileRead)? {
        let dirent = dirent.map_err(Error::FileRead)?;
        let path = dirent.path();

        if path.extension().and_then(|x| x.to_str()) != Some(ext) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|x| x.to_str()) else {
            continue;
        };
        if let Ok(id) = stem.parse::<u64>() {
            files.push((id, path));
        }
    }

    files.sort_by_key(|(id, _)| *id);
    Ok(files)
}

/// Lists `<hex fileid>.idx` segments in a bucket directory, ascending by fileid.
pub fn list_segment_files(bucket_path: &Path) -> Result<Vec<SegmentFileId>> {
    let mut fileids = vec![];

    for dirent in std::fs::read_dir(bucket_path).map_err(Error::FileRead)? {
        let dirent = dirent.map_err(Error::FileRead)?;
        let path = dirent.path();

        if path.extension().and_then(|x| x.to_str()) != Some(INDEX_FILE_EXT) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|x| x.to_str()) else {
            continue;
        };
        if let Ok(raw) = u64::from_str_radix(stem, 16) {
            fileids.push(SegmentFileId::from_raw(raw));
        }
    }

    fileids.sort();
    Ok(fileids)
}

/// Deletes leftover `~`-prefixed temp files, returning how many were removed.
pub fn sweep_tmp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;

    for dirent in std::fs::read_dir(dir).map_err(Error::FileRead)? {
        let dirent = dirent.map_err(Error::FileRead)?;
        let path = dirent.path();

        let Some(name) = path.file_name().and_then(|x| x.to_str()) else {
            continue;
        };
        if name.starts_with(TMP_FILE_PREFIX) && path.is_file() {
            log::debug!("Sweeping leftover temp file {path:?}");
            std::fs::remove_file(&path).map_err(Error::PathDelete)?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Atomically writes a file: temp name, fsync, rename, directory fsync.
#[allow(clippy::expect_used)]
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let folder = path.parent().expect("should have a parent");

    let mut temp_file = tempfile::Builder::new()
        .prefix(TMP_FILE_PREFIX)
        .tempfile_in(folder)
        .map_err(Error::FileWrite)?;

    temp_file.write_all(content).map_err(Error::FileWrite)?;
    temp_file.flush().map_err(Error::FileWrite)?;
    temp_file
        .as_file_mut()
        .sync_all()
        .map_err(Error::FileWrite)?;
    temp_file
        .persist(path)
        .map_err(|e| Error::FileWrite(e.error))?;

    fsync_directory(folder).map_err(Error::FileWrite)?;

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}

/// Reads bytes from a file using `pread`.
pub fn read_exact_at(file: &File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0; size];

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(&mut buf, offset)?;
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;

        let mut pos = 0;
        while pos < size {
            let read = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "unexpected EOF in read_exact_at",
                ));
            }
            pos += read;
        }
    }

    Ok(buf)
}

/// Reads a whole file after checking its header.
pub fn read_with_header(path: &Path, expected_magic: [u8; 4]) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::PathNotExist
        } else {
            Error::FileOpen(e)
        }
    })?;

    let _header = FileHeader::decode_from(&mut file, expected_magic)?;

    let mut body = vec![];
    file.read_to_end(&mut body).map_err(Error::FileRead)?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn file_header_roundtrip() -> crate::Result<()> {
        let header = FileHeader::new(DATA_FILE_MAGIC);

        let mut buf = vec![];
        header.encode_into(&mut buf)?;
        assert_eq!(FILE_HEADER_SIZE, buf.len());

        let decoded = FileHeader::decode_from(&mut &buf[..], DATA_FILE_MAGIC)?;
        assert_eq!(header, decoded);

        assert!(matches!(
            FileHeader::decode_from(&mut &buf[..], INDEX_FILE_MAGIC),
            Err(DecodeError::InvalidMagic(_))
        ));

        Ok(())
    }

    #[test]
    fn file_atomic_rewrite() -> crate::Result<()> {
        let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

        let path = dir.path().join("42.dbm");
        rewrite_atomic(&path, b"content")?;
        rewrite_atomic(&path, b"newcontent")?;

        let content = std::fs::read(&path).map_err(Error::FileRead)?;
        assert_eq!(b"newcontent", &*content);

        Ok(())
    }

    #[test]
    fn file_tmp_sweep() -> crate::Result<()> {
        let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

        std::fs::write(dir.path().join("~1.btm"), b"x").map_err(Error::FileWrite)?;
        std::fs::write(dir.path().join("1.btm"), b"x").map_err(Error::FileWrite)?;

        assert_eq!(1, sweep_tmp_files(dir.path())?);
        assert!(dir.path().join("1.btm").exists());
        assert!(!dir.path().join("~1.btm").exists());

        Ok(())
    }

    #[test]
    fn file_numbered_listing_sorts() -> crate::Result<()> {
        let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

        for id in [10u64, 2, 1] {
            std::fs::write(db_meta_path(dir.path(), id), b"x").map_err(Error::FileWrite)?;
        }
        std::fs::write(dir.path().join("garbage.txt"), b"x").map_err(Error::FileWrite)?;

        let ids: Vec<u64> = list_numbered_files(dir.path(), DB_META_EXT)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        assert_eq!(vec![1, 2, 10], ids);

        Ok(())
    }
}
