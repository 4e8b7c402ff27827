// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::{InternalKey, ObjectType};
use crate::Object;
use std::collections::VecDeque;

/// Rewrites a merged record stream for a new segment
///
/// Consumes records in `(key asc, newest first)` order and, per key:
///
/// - folds an Append run ending in a Set into one Set record,
/// - keeps Append runs without a terminal as-is (they may still resolve
///   against segments outside this merge),
/// - keeps the newest Delete as a tombstone, or drops it when the output
///   is known to be the bucket's oldest data,
/// - drops everything older than the first Set or Delete.
pub struct CompactionStream<I: Iterator<Item = crate::Result<Object>>> {
    inner: I,
    lookahead: Option<Object>,
    pending: VecDeque<Object>,

    /// The output segment is the oldest data of the bucket, so shadowed
    /// records and tombstones cannot resurrect anything
    evict_tombstones: bool,
}

impl<I: Iterator<Item = crate::Result<Object>>> CompactionStream<I> {
    pub fn new(inner: I, evict_tombstones: bool) -> Self {
        Self {
            inner,
            lookahead: None,
            pending: VecDeque::new(),
            evict_tombstones,
        }
    }

    fn next_record(&mut self) -> Option<crate::Result<Object>> {
        if let Some(obj) = self.lookahead.take() {
            return Some(Ok(obj));
        }
        self.inner.next()
    }

    /// Reads one full key run and fills `pending` with its output records.
    fn process_run(&mut self) -> crate::Result<bool> {
        let Some(head) = self.next_record() else {
            return Ok(false);
        };
        let head = head?;
        let key = head.key.user_key.clone();

        // Appends seen before the terminal, newest first
        let mut appends: Vec<Object> = vec![];
        let mut terminal: Option<Object> = None;

        let mut record = Some(head);
        loop {
            let Some(obj) = record.take() else {
                break;
            };

            if obj.key.user_key != key {
                self.lookahead = Some(obj);
                break;
            }

            if terminal.is_none() {
                match obj.key.object_type {
                    ObjectType::Append => appends.push(obj),
                    ObjectType::Set | ObjectType::Delete => terminal = Some(obj),
                }
            }
            // Records older than the terminal are shadowed and dropped

            record = match self.inner.next() {
                Some(r) => Some(r?),
                None => None,
            };
        }

        match terminal {
            Some(obj) if obj.key.object_type == ObjectType::Set => {
                let folded_len: usize =
                    obj.value.len() + appends.iter().map(|a| a.value.len()).sum::<usize>();

                if appends.is_empty() {
                    self.pending.push_back(obj);
                } else if folded_len > crate::value::MAX_VALUE_SIZE {
                    // Folding would overflow the value ceiling; keep the
                    // run as-is, readers fold it on access
                    self.pending.extend(appends);
                    self.pending.push_back(obj);
                } else {
                    // Fold the whole run into one Set
                    let mut value = Vec::with_capacity(folded_len);
                    value.extend_from_slice(&obj.value);
                    for append in appends.iter().rev() {
                        value.extend_from_slice(&append.value);
                    }

                    #[allow(clippy::expect_used)]
                    let newest = appends.first().expect("appends are nonempty");

                    self.pending.push_back(Object {
                        key: InternalKey {
                            user_key: key,
                            id: newest.key.id.max(obj.key.id),
                            object_type: ObjectType::Set,
                        },
                        value: value.into(),
                    });
                }
            }
            Some(obj) => {
                // Delete: fragments newer than it survive, the tombstone
                // itself only until the bucket's full-merge horizon
                self.pending.extend(appends);
                if !self.evict_tombstones {
                    self.pending.push_back(obj);
                }
            }
            None => self.pending.extend(appends),
        }

        Ok(true)
    }
}

impl<I: Iterator<Item = crate::Result<Object>>> Iterator for CompactionStream<I> {
    type Item = crate::Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(obj) = self.pending.pop_front() {
                return Some(Ok(obj));
            }

            match self.process_run() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn obj(key: &str, id: u64, t: ObjectType, value: &str) -> crate::Result<Object> {
        Ok(Object::from_components(
            key.as_bytes(),
            value.as_bytes(),
            id,
            t,
        ))
    }

    fn run(
        records: Vec<crate::Result<Object>>,
        evict: bool,
    ) -> Vec<(Vec<u8>, ObjectType, Vec<u8>)> {
        #[allow(clippy::unwrap_used)]
        CompactionStream::new(records.into_iter(), evict)
            .map(|r| r.unwrap())
            .map(|o| {
                (
                    o.key.user_key.to_vec(),
                    o.key.object_type,
                    o.value.to_vec(),
                )
            })
            .collect()
    }

    #[test]
    fn compaction_folds_appends_into_set() {
        let out = run(
            vec![
                obj("k", 3, ObjectType::Append, "C"),
                obj("k", 2, ObjectType::Append, "B"),
                obj("k", 1, ObjectType::Set, "A"),
            ],
            false,
        );

        assert_eq!(
            vec![(b"k".to_vec(), ObjectType::Set, b"ABC".to_vec())],
            out
        );
    }

    #[test]
    fn compaction_drops_shadowed_records() {
        let out = run(
            vec![
                obj("k", 3, ObjectType::Set, "new"),
                obj("k", 2, ObjectType::Set, "mid"),
                obj("k", 1, ObjectType::Append, "old"),
            ],
            false,
        );

        assert_eq!(
            vec![(b"k".to_vec(), ObjectType::Set, b"new".to_vec())],
            out
        );
    }

    #[test]
    fn compaction_keeps_tombstone_on_part_merge() {
        let out = run(
            vec![
                obj("k", 2, ObjectType::Delete, ""),
                obj("k", 1, ObjectType::Set, "old"),
            ],
            false,
        );

        assert_eq!(
            vec![(b"k".to_vec(), ObjectType::Delete, vec![])],
            out
        );
    }

    #[test]
    fn compaction_drops_tombstone_on_full_merge() {
        let out = run(
            vec![
                obj("k", 2, ObjectType::Delete, ""),
                obj("k", 1, ObjectType::Set, "old"),
                obj("l", 3, ObjectType::Set, "live"),
            ],
            true,
        );

        assert_eq!(
            vec![(b"l".to_vec(), ObjectType::Set, b"live".to_vec())],
            out
        );
    }

    #[test]
    fn compaction_preserves_open_append_chain() {
        let out = run(
            vec![
                obj("k", 3, ObjectType::Append, "B"),
                obj("k", 2, ObjectType::Append, "A"),
            ],
            false,
        );

        assert_eq!(
            vec![
                (b"k".to_vec(), ObjectType::Append, b"B".to_vec()),
                (b"k".to_vec(), ObjectType::Append, b"A".to_vec()),
            ],
            out
        );
    }

    #[test]
    fn compaction_appends_survive_their_tombstone() {
        let out = run(
            vec![
                obj("k", 3, ObjectType::Append, "X"),
                obj("k", 2, ObjectType::Delete, ""),
                obj("k", 1, ObjectType::Set, "old"),
            ],
            true,
        );

        assert_eq!(
            vec![(b"k".to_vec(), ObjectType::Append, b"X".to_vec())],
            out
        );
    }
}
