// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::id::SegmentFileId;
use crate::coding::{
    read_str, write_end, write_tagged_str, write_tagged_u64, Decode, DecodeError, Encode,
    EncodeError, MID_END, MID_START,
};
use crate::stats::{ObjectStat, TypeObjectStat};
use crate::value::{ObjectType, UserKey};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

const MID_BLOOM_FILTER_BITNUM: u32 = MID_START;
const MID_MAX_KEY: u32 = 100;
const MID_MAX_OBJECT_ID: u32 = 101;
const MID_MAX_MERGE_SEGMENT_ID: u32 = 102;

/// Self-description of a segment, stored at the tail of its index file
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentMeta {
    pub object_stat: ObjectStat,
    pub bloom_filter_bitnum: u8,
    pub max_key: UserKey,
    pub max_object_id: u64,
    pub max_merge_segment_id: u64,
}

impl Encode for SegmentMeta {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut body = vec![];

        body.write_u32_varint(3)?;
        for (object_type, stat) in [
            (ObjectType::Set, &self.object_stat.set_stat),
            (ObjectType::Delete, &self.object_stat.delete_stat),
            (ObjectType::Append, &self.object_stat.append_stat),
        ] {
            body.write_u8(u8::from(object_type))?;
            body.write_u64_varint(stat.count)?;
            body.write_u64_varint(stat.key_size)?;
            body.write_u64_varint(stat.value_size)?;
        }

        if self.bloom_filter_bitnum > 0 {
            write_tagged_u64(
                &mut body,
                MID_BLOOM_FILTER_BITNUM,
                self.bloom_filter_bitnum.into(),
            )?;
        }
        write_tagged_str(&mut body, MID_MAX_KEY, &self.max_key)?;
        write_tagged_u64(&mut body, MID_MAX_OBJECT_ID, self.max_object_id)?;
        write_tagged_u64(&mut body, MID_MAX_MERGE_SEGMENT_ID, self.max_merge_segment_id)?;
        write_end(&mut body)?;

        let crc = crc32fast::hash(&body);
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(crc)?;

        Ok(())
    }
}

impl Decode for SegmentMeta {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut object_stat = ObjectStat::default();

        let stat_count = reader.read_u32_varint()?;
        for _ in 0..stat_count {
            let type_byte = reader.read_u8()?;
            let object_type = ObjectType::try_from(type_byte)
                .map_err(|()| DecodeError::InvalidTag(("ObjectType", type_byte.into())))?;

            let stat = TypeObjectStat {
                count: reader.read_u64_varint()?,
                key_size: reader.read_u64_varint()?,
                value_size: reader.read_u64_varint()?,
            };
            *object_stat.of_type(object_type) = stat;
        }

        let mut bloom_filter_bitnum = 0;
        let mut max_key = None;
        let mut max_object_id = 0;
        let mut max_merge_segment_id = 0;

        loop {
            let tag = reader.read_u32_varint()?;
            match tag {
                MID_END => break,
                MID_BLOOM_FILTER_BITNUM => {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        bloom_filter_bitnum = reader.read_u64_varint()? as u8;
                    }
                }
                MID_MAX_KEY => max_key = Some(UserKey::from(&*read_str(reader)?)),
                MID_MAX_OBJECT_ID => max_object_id = reader.read_u64_varint()?,
                MID_MAX_MERGE_SEGMENT_ID => max_merge_segment_id = reader.read_u64_varint()?,
                _ => return Err(DecodeError::InvalidTag(("SegmentMeta", tag.into()))),
            }
        }

        // Trailing CRC is validated by the caller over the raw bytes
        let _crc = reader.read_u32::<LittleEndian>()?;

        let Some(max_key) = max_key else {
            return Err(DecodeError::InvalidLength("segment meta lacks max_key"));
        };

        Ok(Self {
            object_stat,
            bloom_filter_bitnum,
            max_key,
            max_object_id,
            max_merge_segment_id,
        })
    }
}

/// Size and identity of one persisted segment, as recorded in bucket metadata
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentStat {
    pub segment_fileid: SegmentFileId,
    pub data_filesize: u64,
    pub index_filesize: u64,

    /// Bytes of L2 index + meta + trailer at the tail of the index file
    pub l2_index_meta_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn segment_meta_roundtrip() -> Result<(), DecodeError> {
        let mut object_stat = ObjectStat::default();
        object_stat.add(ObjectType::Set, 10, 100);
        object_stat.add(ObjectType::Delete, 3, 0);
        object_stat.add(ObjectType::Append, 5, 50);

        let meta = SegmentMeta {
            object_stat,
            bloom_filter_bitnum: 10,
            max_key: UserKey::from(b"zzz" as &[u8]),
            max_object_id: 42,
            max_merge_segment_id: 7,
        };

        let bytes = meta.encode_into_vec();
        let decoded = SegmentMeta::decode_from(&mut &bytes[..])?;

        assert_eq!(meta, decoded);

        Ok(())
    }

    #[test]
    fn segment_meta_rejects_unknown_tag() {
        let mut bytes = vec![];

        #[allow(clippy::expect_used)]
        {
            bytes.write_u32_varint(0).expect("cannot fail");
            bytes.write_u32_varint(99).expect("cannot fail");
        }

        assert!(matches!(
            SegmentMeta::decode_from(&mut &bytes[..]),
            Err(DecodeError::InvalidTag(_))
        ));
    }
}
