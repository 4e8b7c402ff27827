// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::block::{decode_group, parse_layout, BlockItem, GroupRegion};
use crate::coding::{read_str, write_str, DecodeError, EncodeError};
use crate::value::{ObjectType, UserKey, UserValue};
use crate::Slice;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::Write;

/// One record as stored in a data block
///
/// Object ids are not persisted; within a segment, records of one key
/// appear newest-first, and across segments recency follows the fileid.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataItem {
    pub key: UserKey,
    pub object_type: ObjectType,
    pub value: UserValue,
}

impl BlockItem for DataItem {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn encode_payload<W: Write>(
        &self,
        writer: &mut W,
        _prev: Option<&Self>,
    ) -> Result<(), EncodeError> {
        writer.write_u8(u8::from(self.object_type))?;
        write_str(writer, &self.value)
    }

    fn decode_payload(
        reader: &mut &[u8],
        key: UserKey,
        _prev: Option<&Self>,
    ) -> Result<Self, DecodeError> {
        let type_byte = reader.read_u8()?;
        let object_type = ObjectType::try_from(type_byte)
            .map_err(|()| DecodeError::InvalidTag(("ObjectType", type_byte.into())))?;

        let value = UserValue::from(&*read_str(reader)?);

        Ok(Self {
            key,
            object_type,
            value,
        })
    }
}

/// A decoded view over one data block
pub struct DataBlock {
    bytes: Slice,
    groups: Vec<GroupRegion>,
}

impl DataBlock {
    /// Parses the group layout (and verifies the checksum) without
    /// decoding any records.
    pub fn new(bytes: Slice, index_size: usize) -> Result<Self, DecodeError> {
        let groups = parse_layout(&bytes, index_size)?;
        Ok(Self { bytes, groups })
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Decodes the items of one group.
    pub fn group_items(&self, group_idx: usize) -> Result<Vec<DataItem>, DecodeError> {
        let Some(region) = self.groups.get(group_idx) else {
            return Err(DecodeError::InvalidLength("group index out of range"));
        };
        decode_group(&self.bytes, region)
    }

    /// Index of the group in which the run of `key` can start.
    ///
    /// A key's records can spill into following groups, and a group
    /// boundary can fall exactly on the key, so callers scan forward from
    /// here until the key changes.
    #[must_use]
    pub fn find_run_group(&self, key: &[u8]) -> usize {
        self.groups
            .partition_point(|g| &*g.start_key < key)
            .saturating_sub(1)
    }

    /// Decodes all records in order.
    pub fn items(&self) -> Result<Vec<DataItem>, DecodeError> {
        let mut items = vec![];
        for idx in 0..self.groups.len() {
            items.extend(self.group_items(idx)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::block::encode_block;
    use test_log::test;

    fn item(key: &str, t: ObjectType, value: &str) -> DataItem {
        DataItem {
            key: UserKey::from(key.as_bytes()),
            object_type: t,
            value: UserValue::from(value.as_bytes()),
        }
    }

    #[test]
    fn data_block_roundtrip() -> Result<(), DecodeError> {
        let items = vec![
            item("apple", ObjectType::Set, "red"),
            item("banana", ObjectType::Append, "!"),
            item("banana", ObjectType::Set, "yellow"),
            item("cherry", ObjectType::Delete, ""),
        ];

        let (bytes, index_size) = encode_block(&items);
        let block = DataBlock::new(Slice::from(bytes), index_size as usize)?;

        assert_eq!(items, block.items()?);

        Ok(())
    }

    #[test]
    fn data_block_find_run_group() -> Result<(), DecodeError> {
        let items: Vec<DataItem> = (0..64)
            .map(|i| item(&format!("k{i:04}"), ObjectType::Set, "v"))
            .collect();

        let (bytes, index_size) = encode_block(&items);
        let block = DataBlock::new(Slice::from(bytes), index_size as usize)?;

        assert_eq!(0, block.find_run_group(b"k0000"));
        assert_eq!(0, block.find_run_group(b"k0007"));
        // Boundary key: scan starts one group early
        assert_eq!(0, block.find_run_group(b"k0008"));
        assert_eq!(1, block.find_run_group(b"k0009"));
        assert_eq!(7, block.find_run_group(b"zzz"));
        assert_eq!(0, block.find_run_group(b"a"));

        Ok(())
    }
}
