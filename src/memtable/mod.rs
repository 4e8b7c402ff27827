// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod read_write;
pub mod write_only;

use crate::config::Mode;
use crate::merge::BoxedIterator;
use crate::query::PointRead;
use crate::stats::ObjectStat;
use crate::value::{ObjectId, ObjectType, UserKey, UserValue};
use crate::Result;
use enum_dispatch::enum_dispatch;

pub use read_write::ReadWriteMemWriter;
pub use write_only::WriteOnlyMemWriter;

/// Capability set shared by both memwriter variants
#[enum_dispatch]
pub trait MemWriterOps {
    /// Appends one mutation, stamping it with the given id.
    fn write(
        &self,
        id: ObjectId,
        object_type: ObjectType,
        key: UserKey,
        value: UserValue,
    ) -> Result<()>;

    /// Point lookup honoring the visibility ceiling.
    ///
    /// Unsupported on the write-only variant (always misses); the engine
    /// never point-reads in WriteOnly mode.
    fn get(&self, key: &[u8], visible_id: ObjectId) -> PointRead;

    /// Iterates records in `(key asc, id desc)` order up to the ceiling.
    fn iter(&self, visible_id: ObjectId) -> BoxedIterator<'_>;

    /// Approximate heap footprint in bytes.
    fn size(&self) -> u64;

    /// Number of buffered records.
    fn object_count(&self) -> u64;

    /// Per-type statistics.
    fn object_stat(&self) -> ObjectStat;

    /// Seconds since the writer was created.
    fn elapsed_secs(&self) -> u64;

    /// Freezes the writer; write-only writers sort exactly once here.
    fn seal(&self);

    fn is_sealed(&self) -> bool;

    /// Greatest key observed; fixed at seal.
    fn max_key(&self) -> Option<UserKey>;
}

/// In-memory buffer of recent mutations, in one of two flavors
#[enum_dispatch(MemWriterOps)]
pub enum MemWriter {
    WriteOnly(WriteOnlyMemWriter),
    ReadWrite(ReadWriteMemWriter),
}

impl MemWriter {
    /// Creates the variant matching the engine mode.
    #[must_use]
    pub fn for_mode(mode: Mode) -> Self {
        if mode.is_readable() {
            Self::ReadWrite(ReadWriteMemWriter::new())
        } else {
            Self::WriteOnly(WriteOnlyMemWriter::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn memwriter_mode_selection() {
        assert!(matches!(
            MemWriter::for_mode(Mode::WriteOnly),
            MemWriter::WriteOnly(_)
        ));
        assert!(matches!(
            MemWriter::for_mode(Mode::ReadWrite),
            MemWriter::ReadWrite(_)
        ));
        assert!(matches!(
            MemWriter::for_mode(Mode::ReadOnly),
            MemWriter::ReadWrite(_)
        ));
    }
}
