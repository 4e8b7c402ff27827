// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::block::{decode_group, parse_layout, BlockItem};
use crate::coding::{DecodeError, EncodeError};
use crate::value::UserKey;
use std::io::Write;
use varint_rs::{VarintReader, VarintWriter};

/// Index entry describing one L0 data block
///
/// Offsets are delta-encoded against the previous entry of the L1-group;
/// the first entry of each group carries the absolute offset.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct L0Entry {
    pub start_key: UserKey,
    pub offset: u64,
    pub compress_size: u32,
    pub origin_size: u32,
    pub index_size: u32,
}

impl BlockItem for L0Entry {
    fn key(&self) -> &[u8] {
        &self.start_key
    }

    fn encode_payload<W: Write>(
        &self,
        writer: &mut W,
        prev: Option<&Self>,
    ) -> Result<(), EncodeError> {
        let prev_offset = prev.map_or(0, |p| p.offset);
        debug_assert!(prev.is_none() || self.offset > prev_offset);

        writer.write_u64_varint(self.offset - prev_offset)?;
        writer.write_u32_varint(self.compress_size)?;
        writer.write_u32_varint(self.origin_size - self.compress_size)?;
        writer.write_u32_varint(self.index_size)?;
        Ok(())
    }

    fn decode_payload(
        reader: &mut &[u8],
        key: UserKey,
        prev: Option<&Self>,
    ) -> Result<Self, DecodeError> {
        let offset_delta = reader.read_u64_varint()?;
        let compress_size = reader.read_u32_varint()?;
        let origin_diff = reader.read_u32_varint()?;
        let index_size = reader.read_u32_varint()?;

        let offset = prev.map_or(offset_delta, |p| p.offset + offset_delta);

        Ok(Self {
            start_key: key,
            offset,
            compress_size,
            origin_size: compress_size + origin_diff,
            index_size,
        })
    }
}

/// Decodes every L0 entry of one L0-index block, in order.
pub fn decode_index_block(bytes: &[u8], index_size: usize) -> Result<Vec<L0Entry>, DecodeError> {
    let groups = parse_layout(bytes, index_size)?;

    let mut entries = vec![];
    for region in &groups {
        entries.extend(decode_group::<L0Entry>(bytes, region)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::block::encode_block;
    use test_log::test;

    #[test]
    fn index_block_roundtrip() -> Result<(), DecodeError> {
        let entries: Vec<L0Entry> = (0..100u64)
            .map(|i| L0Entry {
                start_key: UserKey::from(format!("block-{i:04}").as_bytes()),
                offset: 32 + i * 1_000,
                compress_size: 900,
                origin_size: 900,
                index_size: 48,
            })
            .collect();

        let (bytes, index_size) = encode_block(&entries);
        let decoded = decode_index_block(&bytes, index_size as usize)?;

        assert_eq!(entries, decoded);

        Ok(())
    }
}
