// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Two-level grouped block codec shared by data blocks and L0-index blocks.
//!
//! A block is laid out as:
//!
//! ```text
//! [ L2-group ]{1..8}            -- each L2-group: [ L1-group ]{1..8} [ L1-group index ]
//! [ L2-group index ]
//! [ CRC-32 LE ]
//! ```
//!
//! An L1-group holds up to 8 items with prefix-compressed keys; the first
//! key of every group is recoverable from the group indexes, so groups are
//! independently scannable. The index regions trail their payload, which is
//! why every index entry carries the byte size of the region it describes.

use crate::coding::{read_str, write_str, DecodeError, EncodeError};
use crate::value::UserKey;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;
use varint_rs::{VarintReader, VarintWriter};

/// Fan-out of both group levels
pub const MAX_GROUP_ITEMS: usize = 8;

/// A block holds at most this many items
pub const MAX_BLOCK_ITEMS: usize = MAX_GROUP_ITEMS * MAX_GROUP_ITEMS * MAX_GROUP_ITEMS;

/// Soft byte ceiling of an uncompressed block
pub const MAX_BLOCK_SIZE: usize = 32 * 1_024;

const CRC_SIZE: usize = std::mem::size_of::<u32>();

/// One entry type storable in a grouped block
pub trait BlockItem: Sized {
    fn key(&self) -> &[u8];

    /// Encodes everything but the key. `prev` is the previous item of the
    /// same L1-group, if any (used for delta fields).
    fn encode_payload<W: Write>(
        &self,
        writer: &mut W,
        prev: Option<&Self>,
    ) -> Result<(), EncodeError>;

    /// Decodes the payload, pairing it with the already-reconstructed key.
    fn decode_payload(
        reader: &mut &[u8],
        key: UserKey,
        prev: Option<&Self>,
    ) -> Result<Self, DecodeError>;
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn write_prefixed_key<W: Write>(
    writer: &mut W,
    prev: &[u8],
    key: &[u8],
) -> Result<(), EncodeError> {
    let shared = shared_prefix_len(prev, key);

    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(shared as u32)?;

    #[allow(clippy::indexing_slicing)]
    let nonshared = &key[shared..];
    write_str(writer, nonshared)
}

fn read_prefixed_key(reader: &mut &[u8], prev: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let shared = reader.read_u32_varint()? as usize;
    let nonshared = read_str(reader)?;

    let Some(shared_part) = prev.get(..shared) else {
        return Err(DecodeError::InvalidLength("shared key prefix"));
    };

    let mut key = Vec::with_capacity(shared + nonshared.len());
    key.extend_from_slice(shared_part);
    key.extend_from_slice(&nonshared);
    Ok(key)
}

/// Serializes items into a grouped block, returning `(bytes, index_size)`
/// where `index_size` is the byte length of the trailing L2-group index.
///
/// The caller is responsible for the item count and sort order.
#[allow(clippy::expect_used, reason = "writes into a Vec cannot fail")]
pub fn encode_block<T: BlockItem>(items: &[T]) -> (Vec<u8>, u32) {
    assert!(!items.is_empty(), "block may not be empty");
    assert!(items.len() <= MAX_BLOCK_ITEMS, "too many items for one block");

    struct L2Entry {
        start_key: Vec<u8>,
        group_size: usize,
        index_size: usize,
    }

    let mut block = vec![];
    let mut l2_entries = vec![];

    for l2_chunk in items.chunks(MAX_GROUP_ITEMS * MAX_GROUP_ITEMS) {
        let l2_start = block.len();

        struct L1Entry {
            start_key: Vec<u8>,
            group_size: usize,
        }

        let mut l1_entries = vec![];

        for l1_chunk in l2_chunk.chunks(MAX_GROUP_ITEMS) {
            let l1_start = block.len();

            let mut prev_item: Option<&T> = None;
            let mut prev_key: &[u8] = l1_chunk.first().expect("chunk is nonempty").key();

            for item in l1_chunk {
                write_prefixed_key(&mut block, prev_key, item.key()).expect("cannot fail");
                item.encode_payload(&mut block, prev_item)
                    .expect("cannot fail");

                prev_key = item.key();
                prev_item = Some(item);
            }

            l1_entries.push(L1Entry {
                start_key: l1_chunk.first().expect("chunk is nonempty").key().to_vec(),
                group_size: block.len() - l1_start,
            });
        }

        // L1-group index, prefix-compressed against the L2-group start key
        let index_start = block.len();
        let mut prev_key: &[u8] = &l1_entries.first().expect("group is nonempty").start_key;

        for entry in &l1_entries {
            write_prefixed_key(&mut block, prev_key, &entry.start_key).expect("cannot fail");

            #[allow(clippy::cast_possible_truncation)]
            block
                .write_u32_varint(entry.group_size as u32)
                .expect("cannot fail");

            prev_key = &entry.start_key;
        }

        l2_entries.push(L2Entry {
            start_key: l1_entries
                .first()
                .expect("group is nonempty")
                .start_key
                .clone(),
            group_size: block.len() - l2_start,
            index_size: block.len() - index_start,
        });
    }

    // L2-group index, prefix-compressed with an empty initial key
    let index_start = block.len();
    let mut prev_key: &[u8] = &[];

    for entry in &l2_entries {
        write_prefixed_key(&mut block, prev_key, &entry.start_key).expect("cannot fail");

        #[allow(clippy::cast_possible_truncation)]
        {
            block
                .write_u32_varint(entry.group_size as u32)
                .expect("cannot fail");
            block
                .write_u32_varint(entry.index_size as u32)
                .expect("cannot fail");
        }

        prev_key = &entry.start_key;
    }

    #[allow(clippy::cast_possible_truncation)]
    let index_size = (block.len() - index_start) as u32;

    let crc = crc32fast::hash(&block);
    block
        .write_u32::<LittleEndian>(crc)
        .expect("cannot fail");

    (block, index_size)
}

/// Byte region of one L1-group plus its reconstructed start key
#[derive(Clone, Debug)]
pub struct GroupRegion {
    pub start_key: UserKey,
    pub offset: usize,
    pub len: usize,
}

/// Verifies the trailing CRC-32 and resolves the L1-group regions.
///
/// A stored checksum of zero is accepted as "unchecked".
pub fn parse_layout(bytes: &[u8], index_size: usize) -> Result<Vec<GroupRegion>, DecodeError> {
    if bytes.len() < CRC_SIZE + index_size {
        return Err(DecodeError::InvalidLength("block shorter than its index"));
    }

    let body_len = bytes.len() - CRC_SIZE;

    #[allow(clippy::indexing_slicing)]
    {
        let stored_crc = (&bytes[body_len..]).read_u32::<LittleEndian>()?;
        if stored_crc != 0 {
            let crc = crc32fast::hash(&bytes[..body_len]);
            if crc != stored_crc {
                return Err(DecodeError::InvalidChecksum((crc, stored_crc)));
            }
        }
    }

    let mut groups = vec![];

    #[allow(clippy::indexing_slicing)]
    let mut l2_index = &bytes[body_len - index_size..body_len];

    let mut prev_l2_key: Vec<u8> = vec![];
    let mut l2_offset = 0;

    while !l2_index.is_empty() {
        let l2_key = read_prefixed_key(&mut l2_index, &prev_l2_key)?;
        let l2_group_size = l2_index.read_u32_varint()? as usize;
        let l2_group_index_size = l2_index.read_u32_varint()? as usize;

        if l2_offset + l2_group_size > body_len - index_size
            || l2_group_index_size > l2_group_size
        {
            return Err(DecodeError::InvalidLength("L2 group overflows block"));
        }

        // Walk this group's trailing L1-group index
        #[allow(clippy::indexing_slicing)]
        let mut l1_index =
            &bytes[l2_offset + l2_group_size - l2_group_index_size..l2_offset + l2_group_size];

        let mut prev_l1_key = l2_key.clone();
        let mut l1_offset = l2_offset;

        while !l1_index.is_empty() {
            let l1_key = read_prefixed_key(&mut l1_index, &prev_l1_key)?;
            let l1_group_size = l1_index.read_u32_varint()? as usize;

            if l1_offset + l1_group_size > l2_offset + l2_group_size {
                return Err(DecodeError::InvalidLength("L1 group overflows L2 group"));
            }

            groups.push(GroupRegion {
                start_key: UserKey::from(&*l1_key),
                offset: l1_offset,
                len: l1_group_size,
            });

            l1_offset += l1_group_size;
            prev_l1_key = l1_key;
        }

        l2_offset += l2_group_size;
        prev_l2_key = l2_key;
    }

    Ok(groups)
}

/// Decodes all items of one L1-group region.
pub fn decode_group<T: BlockItem>(
    bytes: &[u8],
    region: &GroupRegion,
) -> Result<Vec<T>, DecodeError> {
    let Some(mut reader) = bytes.get(region.offset..region.offset + region.len) else {
        return Err(DecodeError::InvalidLength("group region out of bounds"));
    };

    let mut items: Vec<T> = vec![];
    let mut prev_key: Vec<u8> = region.start_key.to_vec();

    while !reader.is_empty() {
        let key = read_prefixed_key(&mut reader, &prev_key)?;
        let item = T::decode_payload(&mut reader, UserKey::from(&*key), items.last())?;

        prev_key = key;
        items.push(item);
    }

    Ok(items)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    #[derive(Clone, Debug, Eq, PartialEq)]
    struct TestItem {
        key: UserKey,
        payload: u64,
    }

    impl BlockItem for TestItem {
        fn key(&self) -> &[u8] {
            &self.key
        }

        fn encode_payload<W: Write>(
            &self,
            writer: &mut W,
            _prev: Option<&Self>,
        ) -> Result<(), EncodeError> {
            writer.write_u64_varint(self.payload)?;
            Ok(())
        }

        fn decode_payload(
            reader: &mut &[u8],
            key: UserKey,
            _prev: Option<&Self>,
        ) -> Result<Self, DecodeError> {
            let payload = reader.read_u64_varint()?;
            Ok(Self { key, payload })
        }
    }

    fn test_items(n: usize) -> Vec<TestItem> {
        (0..n)
            .map(|i| TestItem {
                key: UserKey::from(format!("key-{i:06}").as_bytes()),
                payload: i as u64,
            })
            .collect()
    }

    #[test]
    fn block_roundtrip_single_group() -> Result<(), DecodeError> {
        let items = test_items(5);
        let (bytes, index_size) = encode_block(&items);

        let groups = parse_layout(&bytes, index_size as usize)?;
        assert_eq!(1, groups.len());

        let decoded: Vec<TestItem> = decode_group(&bytes, groups.first().unwrap())?;
        assert_eq!(items, decoded);

        Ok(())
    }

    #[test]
    fn block_roundtrip_many_groups() -> Result<(), DecodeError> {
        let items = test_items(500);
        let (bytes, index_size) = encode_block(&items);

        let groups = parse_layout(&bytes, index_size as usize)?;
        assert_eq!(500usize.div_ceil(8), groups.len());

        let decoded: Vec<TestItem> = groups
            .iter()
            .map(|g| decode_group(&bytes, g))
            .collect::<Result<Vec<Vec<TestItem>>, _>>()?
            .into_iter()
            .flatten()
            .collect();

        assert_eq!(items, decoded);

        Ok(())
    }

    #[test]
    fn block_rejects_flipped_bit() {
        let items = test_items(50);
        let (mut bytes, index_size) = encode_block(&items);

        *bytes.first_mut().unwrap() ^= 0xFF;

        assert!(matches!(
            parse_layout(&bytes, index_size as usize),
            Err(DecodeError::InvalidChecksum(_))
        ));
    }

    #[test]
    fn block_accepts_zero_checksum() -> Result<(), DecodeError> {
        let items = test_items(50);
        let (mut bytes, index_size) = encode_block(&items);

        let len = bytes.len();
        bytes.get_mut(len - 4..).unwrap().fill(0);

        assert!(parse_layout(&bytes, index_size as usize).is_ok());
        Ok(())
    }

    #[test]
    fn block_group_start_keys() -> Result<(), DecodeError> {
        let items = test_items(64);
        let (bytes, index_size) = encode_block(&items);

        let groups = parse_layout(&bytes, index_size as usize)?;

        for (i, group) in groups.iter().enumerate() {
            assert_eq!(
                format!("key-{:06}", i * 8).as_bytes(),
                &*group.start_key,
            );
        }

        Ok(())
    }
}
