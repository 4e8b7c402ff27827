// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::ObjectId;
use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire, Release},
    },
    Arc,
};

/// Thread-safe, bucket-scoped object id generator
///
/// Ids start at 1; 0 is reserved as "invalid". Every mutation consumes
/// exactly one id, so ids observed by readers are dense per bucket.
#[derive(Clone, Debug)]
pub struct ObjectIdCounter(Arc<AtomicU64>);

impl Default for ObjectIdCounter {
    fn default() -> Self {
        Self::new(crate::value::MIN_OBJECT_ID)
    }
}

impl ObjectIdCounter {
    /// Creates a new counter, setting it to some previous value
    #[must_use]
    pub fn new(next: ObjectId) -> Self {
        Self(Arc::new(AtomicU64::new(next)))
    }

    /// Gets the would-be-next id, without incrementing the counter.
    ///
    /// `get() - 1` is the visibility ceiling of a snapshot taken now.
    #[must_use]
    pub fn get(&self) -> ObjectId {
        self.0.load(Acquire)
    }

    /// Gets the next id.
    #[must_use]
    #[allow(clippy::missing_panics_doc, reason = "we should never run out of u64s")]
    pub fn next(&self) -> ObjectId {
        let id = self.0.fetch_add(1, AcqRel);
        assert!(id < u64::MAX - 1, "Ran out of object ids");
        id
    }

    /// Sets the next id, used when restoring from bucket metadata.
    pub fn set(&self, next: ObjectId) {
        self.0.store(next, Release);
    }

    /// Maximizes the next id.
    pub fn fetch_max(&self, next: ObjectId) {
        self.0.fetch_max(next, AcqRel);
    }
}
