// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, persistent, ordered key-value store organized as an
//! LSM-tree, partitioned into independent named buckets.
//!
//! Each bucket maps binary keys to binary values with three mutations
//! (set, append, delete), point lookups and forward iteration. Recent
//! mutations live in an in-memory writer; sealed writers are flushed into
//! immutable segment file pairs in the background, and a two-tier
//! compactor (size-tiered partial merges plus full-merge promotion) keeps
//! the segment count bounded. Readers work on atomically-swapped,
//! refcounted snapshots and never block writers.
//!
//! # Example usage
//!
//! ```
//! use bucketdb::{DbConfig, Engine, GlobalConfig, Mode, DB};
//! #
//! # let dir = tempfile::tempdir().unwrap();
//!
//! let engine = Engine::start(GlobalConfig::new(Mode::ReadWrite))?;
//! let db = DB::open(&engine, DbConfig::new(), dir.path().join("d1"))?;
//!
//! db.create_bucket("my-bucket")?;
//! db.set("my-bucket", "my_key", "my_value")?;
//!
//! let value = db.get("my-bucket", "my_key")?;
//! assert_eq!(b"my_value", &*value);
//!
//! // Values can be extended in place...
//! db.append("my-bucket", "my_key", "!")?;
//! assert_eq!(b"my_value!", &*db.get("my-bucket", "my_key")?);
//!
//! // ...and iterated in key order
//! for pair in db.new_iterator("my-bucket")? {
//!     let (_key, _value) = pair?;
//! }
//!
//! // Persist in-memory data, then fold the segments into one
//! db.flush(None)?;
//! db.merge(None)?;
//! #
//! # Ok::<(), bucketdb::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod batch;

#[doc(hidden)]
pub mod bucket;

#[doc(hidden)]
pub mod cache;

#[doc(hidden)]
pub mod coding;

#[doc(hidden)]
pub mod compaction;

mod config;
mod db;
mod engine;
mod error;

#[doc(hidden)]
pub mod file;

mod lock;

#[doc(hidden)]
pub mod memtable;

#[doc(hidden)]
pub mod merge;

#[doc(hidden)]
pub mod meta;

#[doc(hidden)]
pub mod notify;

#[doc(hidden)]
pub mod query;

#[doc(hidden)]
pub mod segment;

mod seqno;
mod slice;
mod stats;
mod value;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (UserKey, UserValue);

#[doc(hidden)]
pub use {
    merge::BoxedIterator,
    query::PointRead,
    segment::{SegmentFileId, SegmentReader},
    value::InternalKey,
};

pub use {
    batch::ObjectBatch,
    bucket::{Bucket, BucketIter},
    config::{BucketConfig, DbConfig, GlobalConfig, Mode},
    db::DB,
    engine::Engine,
    error::{Error, Result},
    seqno::ObjectIdCounter,
    slice::Slice,
    stats::{BucketStat, ObjectStat, ReaderStat, TypeObjectStat},
    value::{Object, ObjectId, ObjectType, UserKey, UserValue},
};
