// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::{ObjectType, UserKey, UserValue};
use std::collections::BTreeMap;

/// A group of mutations, applied per bucket under one lock acquisition
///
/// Mutations of one bucket are applied in insertion order; across buckets
/// no ordering is guaranteed.
#[derive(Default)]
pub struct ObjectBatch {
    pub(crate) mutations: BTreeMap<String, Vec<(ObjectType, UserKey, UserValue)>>,
}

impl ObjectBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a set.
    pub fn set<K: Into<UserKey>, V: Into<UserValue>>(&mut self, bucket: &str, key: K, value: V) {
        self.push(bucket, ObjectType::Set, key.into(), value.into());
    }

    /// Queues an append.
    pub fn append<K: Into<UserKey>, V: Into<UserValue>>(&mut self, bucket: &str, key: K, value: V) {
        self.push(bucket, ObjectType::Append, key.into(), value.into());
    }

    /// Queues a delete.
    pub fn delete<K: Into<UserKey>>(&mut self, bucket: &str, key: K) {
        self.push(bucket, ObjectType::Delete, key.into(), UserValue::from(vec![]));
    }

    fn push(&mut self, bucket: &str, object_type: ObjectType, key: UserKey, value: UserValue) {
        self.mutations
            .entry(bucket.into())
            .or_default()
            .push((object_type, key, value));
    }

    /// Returns `true` if no mutations are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Number of queued mutations across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.values().map(Vec::len).sum()
    }
}
