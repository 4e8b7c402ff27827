// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::slice::concat_slices;
use crate::value::{ObjectType, UserKey, UserValue};
use crate::Object;

/// Outcome of a point lookup against one source (memwriter or segment)
///
/// Append runs are folded inside the source; fragments are ordered
/// newest-first so the caller can keep extending the chain across sources.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PointRead {
    /// The source holds no record for the key
    Miss,

    /// Terminated by a Set; the value already includes any fragments
    /// newer than it within the source
    Set(UserValue),

    /// Terminated by a Delete; carries fragments newer than the delete
    Tombstone(Vec<UserValue>),

    /// Only Append fragments; the chain continues in older sources
    Fragments(Vec<UserValue>),
}

impl PointRead {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Set(_) | Self::Tombstone(_))
    }
}

/// Folds one key's records (visited newest to oldest) into a [`PointRead`].
///
/// Stops consuming at the first Set or Delete.
pub fn fold_records<'a, I: Iterator<Item = (ObjectType, &'a UserValue)>>(
    records: I,
) -> PointRead {
    let mut fragments = vec![];

    for (object_type, value) in records {
        match object_type {
            ObjectType::Append => fragments.push(value.clone()),
            ObjectType::Set => {
                if fragments.is_empty() {
                    return PointRead::Set(value.clone());
                }
                fragments.push(value.clone());
                return PointRead::Set(concat_slices(fragments.iter().rev()));
            }
            ObjectType::Delete => return PointRead::Tombstone(fragments),
        }
    }

    if fragments.is_empty() {
        PointRead::Miss
    } else {
        PointRead::Fragments(fragments)
    }
}

/// Combines per-source results, newest source first, into the final value.
///
/// Returns `None` when the key does not exist (absent or tombstoned).
pub struct LookupState {
    fragments: Vec<UserValue>,
}

impl LookupState {
    #[must_use]
    pub fn new() -> Self {
        Self { fragments: vec![] }
    }

    /// Feeds the next (older) source's result. Returns the final value
    /// wrapped in `Some`/`None` when the walk is finished, or `Err(self)`
    /// to continue with the next source.
    #[allow(clippy::result_large_err)]
    pub fn feed(mut self, read: PointRead) -> Result<Option<UserValue>, Self> {
        match read {
            PointRead::Miss => Err(self),
            PointRead::Fragments(fragments) => {
                self.fragments.extend(fragments);
                Err(self)
            }
            PointRead::Set(base) => {
                if self.fragments.is_empty() {
                    return Ok(Some(base));
                }
                let mut parts = vec![base];
                parts.extend(self.fragments.into_iter().rev());
                Ok(Some(concat_slices(parts.iter())))
            }
            PointRead::Tombstone(fragments) => {
                self.fragments.extend(fragments);
                Ok(self.finish_fragments())
            }
        }
    }

    /// Resolves the chain after all sources were consulted.
    #[must_use]
    pub fn finish(self) -> Option<UserValue> {
        self.finish_fragments()
    }

    fn finish_fragments(self) -> Option<UserValue> {
        if self.fragments.is_empty() {
            None
        } else {
            Some(concat_slices(self.fragments.iter().rev()))
        }
    }
}

impl Default for LookupState {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams one logical `(key, value)` pair per live key over a physical
/// record stream sorted by `(key asc, newest first)`.
///
/// Append chains are folded, tombstoned keys are skipped.
pub struct QueryStream<I: Iterator<Item = crate::Result<Object>>> {
    inner: I,
    lookahead: Option<Object>,
}

impl<I: Iterator<Item = crate::Result<Object>>> QueryStream<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            lookahead: None,
        }
    }

    fn next_record(&mut self) -> Option<crate::Result<Object>> {
        if let Some(obj) = self.lookahead.take() {
            return Some(Ok(obj));
        }
        self.inner.next()
    }
}

impl<I: Iterator<Item = crate::Result<Object>>> Iterator for QueryStream<I> {
    type Item = crate::Result<(UserKey, UserValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let head = fail_iter!(self.next_record()?);
            let key = head.key.user_key.clone();

            // `state` is emptied once the chain resolves
            let mut state = Some(LookupState::new());
            let mut result: Option<Option<UserValue>> = None;

            advance(&mut state, &mut result, fold_one(&head));

            // Consume the rest of this key's run
            loop {
                let Some(record) = self.inner.next() else {
                    break;
                };
                let record = fail_iter!(record);

                if record.key.user_key != key {
                    self.lookahead = Some(record);
                    break;
                }

                if result.is_none() {
                    advance(&mut state, &mut result, fold_one(&record));
                }
            }

            match result {
                Some(Some(value)) => return Some(Ok((key, value))),
                Some(None) => {} // tombstoned
                None => {
                    if let Some(value) = state.and_then(LookupState::finish) {
                        return Some(Ok((key, value)));
                    }
                }
            }
        }
    }
}

fn advance(
    state: &mut Option<LookupState>,
    result: &mut Option<Option<UserValue>>,
    read: PointRead,
) {
    if let Some(s) = state.take() {
        match s.feed(read) {
            Ok(value) => *result = Some(value),
            Err(s) => *state = Some(s),
        }
    }
}

fn fold_one(obj: &Object) -> PointRead {
    match obj.key.object_type {
        ObjectType::Set => PointRead::Set(obj.value.clone()),
        ObjectType::Delete => PointRead::Tombstone(vec![]),
        ObjectType::Append => PointRead::Fragments(vec![obj.value.clone()]),
    }
}
