// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::MemWriterOps;
use crate::merge::BoxedIterator;
use crate::query::{fold_records, PointRead};
use crate::stats::ObjectStat;
use crate::value::{InternalKey, Object, ObjectId, ObjectType, UserKey, UserValue};
use crate::Result;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::AcqRel, Ordering::Acquire, Ordering::Release};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Skiplist-ordered memwriter for engines that read uncommitted data
///
/// The content lives in a lock-free skiplist sorted by
/// `(key asc, id desc)`, so point reads and iteration work at any time.
pub struct ReadWriteMemWriter {
    /// Records keyed by `(user key asc, id desc)`
    items: SkipMap<InternalKey, UserValue>,

    approximate_size: AtomicU64,
    object_stat: Mutex<ObjectStat>,
    sealed: AtomicBool,
    max_key: OnceLock<Option<UserKey>>,
    created_at: Instant,
}

impl ReadWriteMemWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: SkipMap::new(),
            approximate_size: AtomicU64::default(),
            object_stat: Mutex::new(ObjectStat::default()),
            sealed: AtomicBool::default(),
            max_key: OnceLock::new(),
            created_at: Instant::now(),
        }
    }
}

impl Default for ReadWriteMemWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemWriterOps for ReadWriteMemWriter {
    fn write(
        &self,
        id: ObjectId,
        object_type: ObjectType,
        key: UserKey,
        value: UserValue,
    ) -> Result<()> {
        debug_assert!(!self.is_sealed(), "sealed memwriter never mutates");

        self.approximate_size
            .fetch_add((key.len() + value.len() + 24) as u64, AcqRel);

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.object_stat
            .lock()
            .expect("lock is poisoned")
            .add(object_type, key.len() as u64, value.len() as u64);

        self.items
            .insert(InternalKey::new(key, id, object_type), value);

        Ok(())
    }

    fn get(&self, key: &[u8], visible_id: ObjectId) -> PointRead {
        if visible_id == crate::value::INVALID_OBJECT_ID {
            return PointRead::Miss;
        }

        // Entries sort by (key asc, id desc): starting at (key, visible_id)
        // skips everything newer than the ceiling, and walking forward
        // visits the key's records newest to oldest.
        let lower_bound = InternalKey::new(key, visible_id, ObjectType::Set);

        let records: Vec<(ObjectType, UserValue)> = self
            .items
            .range(lower_bound..)
            .take_while(|entry| &*entry.key().user_key == key)
            .map(|entry| (entry.key().object_type, entry.value().clone()))
            .take_while_inclusive_terminal()
            .collect();

        fold_records(records.iter().map(|(t, v)| (*t, v)))
    }

    fn iter(&self, visible_id: ObjectId) -> BoxedIterator<'_> {
        Box::new(
            self.items
                .iter()
                .filter(move |entry| entry.key().id <= visible_id)
                .map(|entry| {
                    Ok(Object {
                        key: entry.key().clone(),
                        value: entry.value().clone(),
                    })
                }),
        )
    }

    fn size(&self) -> u64 {
        self.approximate_size.load(Acquire)
    }

    fn object_count(&self) -> u64 {
        self.object_stat().count()
    }

    fn object_stat(&self) -> ObjectStat {
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let stat = self.object_stat.lock().expect("lock is poisoned");
        *stat
    }

    fn elapsed_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    fn seal(&self) {
        self.sealed.store(true, Release);
        let _ = self
            .max_key
            .set(self.items.back().map(|entry| entry.key().user_key.clone()));
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(Acquire)
    }

    fn max_key(&self) -> Option<UserKey> {
        self.max_key.get().cloned().flatten()
    }
}

/// Stops a record stream after the first Set or Delete, inclusively.
trait TakeWhileInclusiveTerminal: Iterator<Item = (ObjectType, UserValue)> + Sized {
    fn take_while_inclusive_terminal(self) -> TerminalTaker<Self> {
        TerminalTaker {
            inner: self,
            done: false,
        }
    }
}

impl<I: Iterator<Item = (ObjectType, UserValue)>> TakeWhileInclusiveTerminal for I {}

struct TerminalTaker<I> {
    inner: I,
    done: bool,
}

impl<I: Iterator<Item = (ObjectType, UserValue)>> Iterator for TerminalTaker<I> {
    type Item = (ObjectType, UserValue);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.inner.next()?;
        if item.0 != ObjectType::Append {
            self.done = true;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn write(writer: &ReadWriteMemWriter, id: u64, t: ObjectType, key: &str, value: &str) {
        #[allow(clippy::unwrap_used)]
        writer
            .write(
                id,
                t,
                UserKey::from(key.as_bytes()),
                UserValue::from(value.as_bytes()),
            )
            .unwrap();
    }

    #[test]
    fn read_write_point_read() {
        let writer = ReadWriteMemWriter::new();

        write(&writer, 1, ObjectType::Set, "abc", "old");
        write(&writer, 2, ObjectType::Set, "abc", "new");

        assert_eq!(
            PointRead::Set(UserValue::from(b"new" as &[u8])),
            writer.get(b"abc", u64::MAX)
        );
        assert_eq!(
            PointRead::Set(UserValue::from(b"old" as &[u8])),
            writer.get(b"abc", 1)
        );
        assert_eq!(PointRead::Miss, writer.get(b"ab", u64::MAX));
        assert_eq!(PointRead::Miss, writer.get(b"abcd", u64::MAX));
    }

    #[test]
    fn read_write_visibility_ceiling_excludes_newer() {
        let writer = ReadWriteMemWriter::new();

        write(&writer, 5, ObjectType::Set, "k", "v5");

        assert_eq!(PointRead::Miss, writer.get(b"k", 4));
        assert_eq!(
            PointRead::Set(UserValue::from(b"v5" as &[u8])),
            writer.get(b"k", 5)
        );
    }

    #[test]
    fn read_write_append_fold() {
        let writer = ReadWriteMemWriter::new();

        write(&writer, 1, ObjectType::Set, "k", "A");
        write(&writer, 2, ObjectType::Append, "k", "B");
        write(&writer, 3, ObjectType::Append, "k", "C");

        assert_eq!(
            PointRead::Set(UserValue::from(b"ABC" as &[u8])),
            writer.get(b"k", u64::MAX)
        );
    }

    #[test]
    fn read_write_append_after_delete() {
        let writer = ReadWriteMemWriter::new();

        write(&writer, 1, ObjectType::Delete, "k", "");
        write(&writer, 2, ObjectType::Append, "k", "X");

        assert_eq!(
            PointRead::Tombstone(vec![UserValue::from(b"X" as &[u8])]),
            writer.get(b"k", u64::MAX)
        );
    }

    #[test]
    fn read_write_bare_appends_stay_open() {
        let writer = ReadWriteMemWriter::new();

        write(&writer, 1, ObjectType::Append, "k", "A");
        write(&writer, 2, ObjectType::Append, "k", "B");

        assert_eq!(
            PointRead::Fragments(vec![
                UserValue::from(b"B" as &[u8]),
                UserValue::from(b"A" as &[u8])
            ]),
            writer.get(b"k", u64::MAX)
        );
    }

    #[test]
    fn read_write_seal_freezes_max_key() {
        let writer = ReadWriteMemWriter::new();

        write(&writer, 1, ObjectType::Set, "m", "v");
        write(&writer, 2, ObjectType::Set, "z", "v");
        write(&writer, 3, ObjectType::Set, "a", "v");

        writer.seal();
        assert_eq!(Some(UserKey::from(b"z" as &[u8])), writer.max_key());
    }
}
