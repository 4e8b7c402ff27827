// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Terminates a property list
pub const MID_END: u32 = 1;

/// First component-specific property tag
pub const MID_START: u32 = 2;

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EncodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
            }
        )
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// Unexpected file magic
    InvalidMagic([u8; 4]),

    /// Unsupported header or format version
    InvalidVersion(u16),

    /// Unknown enum or property tag
    InvalidTag((&'static str, u64)),

    /// Checksum mismatch (got, expected)
    InvalidChecksum((u32, u32)),

    /// A length or offset points outside its container
    InvalidLength(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecodeError({self:?})")
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for DecodeError {}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    #[allow(clippy::expect_used)]
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("cannot fail");
        v
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// Writes a length-prefixed byte string.
pub fn write_str<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), EncodeError> {
    // NOTE: Keys and values are limited far below u32::MAX
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Reads a length-prefixed byte string.
pub fn read_str<R: Read>(reader: &mut R) -> Result<Vec<u8>, DecodeError> {
    let len = reader.read_u32_varint()? as usize;
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a `(tag, varint)` property.
pub fn write_tagged_u64<W: Write>(writer: &mut W, tag: u32, value: u64) -> Result<(), EncodeError> {
    writer.write_u32_varint(tag)?;
    writer.write_u64_varint(value)?;
    Ok(())
}

/// Writes a `(tag, string)` property.
pub fn write_tagged_str<W: Write>(writer: &mut W, tag: u32, bytes: &[u8]) -> Result<(), EncodeError> {
    writer.write_u32_varint(tag)?;
    write_str(writer, bytes)
}

/// Terminates a property list.
pub fn write_end<W: Write>(writer: &mut W) -> Result<(), EncodeError> {
    writer.write_u32_varint(MID_END)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn coding_str_roundtrip() -> Result<(), DecodeError> {
        let mut buf = vec![];

        #[allow(clippy::expect_used)]
        {
            write_str(&mut buf, b"hello").expect("cannot fail");
            write_str(&mut buf, b"").expect("cannot fail");
        }

        let mut reader = &buf[..];
        assert_eq!(b"hello".to_vec(), read_str(&mut reader)?);
        assert_eq!(Vec::<u8>::new(), read_str(&mut reader)?);

        Ok(())
    }
}
