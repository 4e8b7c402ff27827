// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// Path does not exist
    PathNotExist,

    /// Path already exists
    PathExist,

    /// Directory could not be created
    PathCreate(std::io::Error),

    /// Directory or file could not be deleted
    PathDelete(std::io::Error),

    /// Path is not a valid database or bucket path
    PathInvalid,

    /// File could not be opened
    FileOpen(std::io::Error),

    /// File could not be read
    FileRead(std::io::Error),

    /// File could not be written
    FileWrite(std::io::Error),

    /// Advisory lock could not be acquired
    FileLock,

    /// File header, trailer or body failed the format check
    FileFormat(DecodeError),

    /// Memory allocation failed
    MemoryNotEnough,

    /// A bounded buffer or queue is full
    BufferFull,

    /// An iterator or queue is exhausted
    NoMoreData,

    /// A bounded resource (worker pool, id space) is exhausted
    ResExhaust,

    /// The engine is already started
    Started,

    /// The engine is stopped
    Stopped,

    /// The operation is not allowed in the engine's mode
    InvalidMode,

    /// The configuration failed validation
    InvalidConfig(&'static str),

    /// Another task of the same kind is already running
    InProcessing,

    /// The database is already open in this engine
    DbOpened,

    /// The database handle is closed
    DbClosed,

    /// The database already exists
    DbExist,

    /// The database does not exist
    DbNotExist,

    /// The bucket already exists
    BucketExist,

    /// The bucket does not exist
    BucketNotExist,

    /// The bucket was deleted while the operation was in flight
    BucketDeleted,

    /// The bucket contains no data
    BucketEmpty,

    /// The bucket name is not valid
    BucketName,

    /// No object with that key is visible
    ObjectNotExist,

    /// Key or value exceeds the size ceiling
    ObjectTooLarge,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BucketDbError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PathCreate(e)
            | Self::PathDelete(e)
            | Self::FileOpen(e)
            | Self::FileRead(e)
            | Self::FileWrite(e) => Some(e),
            Self::FileFormat(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        let EncodeError::Io(e) = value;
        Self::FileWrite(e)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::FileFormat(value)
    }
}

/// Storage engine result
pub type Result<T> = std::result::Result<T, Error>;
