// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::MemWriterOps;
use crate::merge::BoxedIterator;
use crate::query::PointRead;
use crate::stats::ObjectStat;
use crate::value::{InternalKey, Object, ObjectId, ObjectType, UserKey, UserValue};
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering::AcqRel, Ordering::Acquire};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Append-ordered memwriter for write-only engines
///
/// Records are buffered unsorted; [`MemWriterOps::seal`] sorts them by
/// `(key asc, id desc)` exactly once. Point reads are unsupported.
pub struct WriteOnlyMemWriter {
    /// Insertion-ordered buffer; emptied into `sorted` at seal
    items: Mutex<Vec<Object>>,

    /// The sealed, sorted record array
    sorted: OnceLock<Box<[Object]>>,

    approximate_size: AtomicU64,
    object_stat: Mutex<ObjectStat>,
    max_key: OnceLock<Option<UserKey>>,
    created_at: Instant,
}

impl WriteOnlyMemWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(vec![]),
            sorted: OnceLock::new(),
            approximate_size: AtomicU64::default(),
            object_stat: Mutex::new(ObjectStat::default()),
            max_key: OnceLock::new(),
            created_at: Instant::now(),
        }
    }

    fn sorted_items(&self) -> &[Object] {
        debug_assert!(self.is_sealed(), "write-only memwriter read before seal");
        match self.sorted.get() {
            Some(items) => items,
            None => &[],
        }
    }
}

impl Default for WriteOnlyMemWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemWriterOps for WriteOnlyMemWriter {
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

        let obj = Object {
            key: InternalKey {
                user_key: key,
                id,
                object_type,
            },
            value,
        };

        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.items.lock().expect("lock is poisoned").push(obj);

        Ok(())
    }

    fn get(&self, _key: &[u8], _visible_id: ObjectId) -> PointRead {
        PointRead::Miss
    }

    fn iter(&self, visible_id: ObjectId) -> BoxedIterator<'_> {
        Box::new(
            self.sorted_items()
                .iter()
                .filter(move |obj| obj.key.id <= visible_id)
                .cloned()
                .map(Ok),
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
        #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut items = std::mem::take(&mut *self.items.lock().expect("lock is poisoned"));

        items.sort_unstable();

        let _ = self.max_key.set(items.last().map(|o| o.key.user_key.clone()));
        let _ = self.sorted.set(items.into_boxed_slice());
    }

    fn is_sealed(&self) -> bool {
        self.sorted.get().is_some()
    }

    fn max_key(&self) -> Option<UserKey> {
        self.max_key.get().cloned().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn write_only_sorts_at_seal() {
        let writer = WriteOnlyMemWriter::new();

        for (i, key) in [b"c", b"a", b"b"].iter().enumerate() {
            writer
                .write(
                    i as u64 + 1,
                    ObjectType::Set,
                    UserKey::from(*key as &[u8]),
                    UserValue::from(b"v" as &[u8]),
                )
                .unwrap();
        }

        // Two versions of one key: newest must come first
        writer
            .write(
                4,
                ObjectType::Set,
                UserKey::from(b"a" as &[u8]),
                UserValue::from(b"v2" as &[u8]),
            )
            .unwrap();

        assert!(!writer.is_sealed());
        writer.seal();
        assert!(writer.is_sealed());

        let keys: Vec<(Vec<u8>, u64)> = writer
            .iter(u64::MAX)
            .map(|r| r.map(|o| (o.key.user_key.to_vec(), o.key.id)).unwrap())
            .collect();

        assert_eq!(
            vec![
                (b"a".to_vec(), 4),
                (b"a".to_vec(), 2),
                (b"b".to_vec(), 3),
                (b"c".to_vec(), 1),
            ],
            keys
        );

        assert_eq!(Some(UserKey::from(b"c" as &[u8])), writer.max_key());
        assert_eq!(4, writer.object_count());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn write_only_iter_honors_ceiling() {
        let writer = WriteOnlyMemWriter::new();

        for id in 1..=10u64 {
            writer
                .write(
                    id,
                    ObjectType::Set,
                    UserKey::from(format!("k{id}").as_bytes()),
                    UserValue::from(b"v" as &[u8]),
                )
                .unwrap();
        }
        writer.seal();

        assert_eq!(5, writer.iter(5).count());
        assert_eq!(10, writer.iter(u64::MAX).count());
    }
}
