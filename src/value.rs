// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;
use std::cmp::Reverse;

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
#[allow(clippy::module_name_repetitions)]
pub type UserValue = Slice;

/// Object id - a monotonically increasing, bucket-scoped counter
///
/// An object with a higher id shadows an object with the
/// same key and lower id. Stale objects are lazily
/// garbage-collected during compaction.
pub type ObjectId = u64;

/// 0 is reserved and never assigned to a mutation
pub const INVALID_OBJECT_ID: ObjectId = 0;

/// First assignable object id
pub const MIN_OBJECT_ID: ObjectId = 1;

/// Keys are limited to 16 KiB
pub const MAX_KEY_SIZE: usize = 16 * 1_024;

/// Values are limited to 64 KiB
pub const MAX_VALUE_SIZE: usize = 64 * 1_024;

/// Mutation type (value, tombstone or append fragment)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObjectType {
    /// Existing value
    Set,

    /// Deleted value
    Delete,

    /// Fragment that concatenates onto the next older Set (or nothing)
    Append,
}

impl TryFrom<u8> for ObjectType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Set),
            1 => Ok(Self::Delete),
            2 => Ok(Self::Append),
            _ => Err(()),
        }
    }
}

impl From<ObjectType> for u8 {
    fn from(value: ObjectType) -> Self {
        match value {
            ObjectType::Set => 0,
            ObjectType::Delete => 1,
            ObjectType::Append => 2,
        }
    }
}

/// Key of an object as stored internally
#[derive(Clone, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct InternalKey {
    /// User-supplied key bytes
    pub user_key: UserKey,

    /// Bucket-scoped sequence number; 0 for records read back from
    /// segments, whose recency follows the segment fileid instead
    pub id: ObjectId,

    /// Mutation type
    pub object_type: ObjectType,
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}",
            self.user_key,
            self.id,
            match self.object_type {
                ObjectType::Set => "S",
                ObjectType::Delete => "D",
                ObjectType::Append => "A",
            },
        )
    }
}

impl InternalKey {
    /// Builds a new internal key from a user key, object id, and type.
    pub fn new<K: Into<UserKey>>(user_key: K, id: ObjectId, object_type: ObjectType) -> Self {
        let user_key = user_key.into();

        assert!(
            user_key.len() <= MAX_KEY_SIZE,
            "keys can be {MAX_KEY_SIZE} bytes in length"
        );

        Self {
            user_key,
            id,
            object_type,
        }
    }

    /// Returns `true` if this key represents a delete (tombstone).
    pub fn is_tombstone(&self) -> bool {
        self.object_type == ObjectType::Delete
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// User key ascending, bucket-scoped object id descending: a key's
// records form a newest-first run, so point lookups take the first
// record at or below their visibility ceiling and Append folding walks
// the run newer to older. Memwriters, segments and the merge heap all
// assume this ordering.
impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.user_key, Reverse(self.id)).cmp(&(&other.user_key, Reverse(other.id)))
    }
}

/// One mutation record
#[derive(Clone, Eq)]
pub struct Object {
    /// Internal key
    pub key: InternalKey,

    /// User-defined value - an arbitrary byte array
    pub value: UserValue,
}

impl Object {
    /// Creates a new [`Object`].
    ///
    /// # Panics
    ///
    /// Panics if the key is empty or oversized.
    pub fn new<V: Into<UserValue>>(key: InternalKey, value: V) -> Self {
        let value = value.into();

        assert!(!key.user_key.is_empty(), "key may not be empty");
        assert!(
            value.len() <= MAX_VALUE_SIZE,
            "values can be {MAX_VALUE_SIZE} bytes in length"
        );

        Self { key, value }
    }

    /// Creates a new [`Object`] from its parts.
    pub fn from_components<K: Into<UserKey>, V: Into<UserValue>>(
        user_key: K,
        value: V,
        id: ObjectId,
        object_type: ObjectType,
    ) -> Self {
        let key = InternalKey::new(user_key, id, object_type);
        Self::new(key, value)
    }

    /// Creates a new tombstone.
    pub fn new_tombstone<K: Into<UserKey>>(key: K, id: ObjectId) -> Self {
        let key = InternalKey::new(key, id, ObjectType::Delete);
        Self::new(key, vec![])
    }

    /// Returns `true` if this entry represents a delete (tombstone).
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.key.is_tombstone()
    }

    /// Approximate in-memory footprint, used by flush thresholds.
    #[must_use]
    pub fn size(&self) -> usize {
        std::mem::size_of::<ObjectId>()
            + std::mem::size_of::<ObjectType>()
            + self.key.user_key.len()
            + self.value.len()
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl PartialOrd for Object {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.key.cmp(&other.key))
    }
}

impl Ord for Object {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} => {:?}",
            self.key,
            if self.value.len() >= 64 {
                format!("[ ... {} bytes ]", self.value.len())
            } else {
                format!("{:?}", self.value)
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn key_cmp_user_key() {
        let a = InternalKey::new(*b"a", 1, ObjectType::Set);
        let b = InternalKey::new(*b"b", 1, ObjectType::Set);
        assert!(a < b);
    }

    #[test]
    fn key_cmp_id_descending() {
        let a = InternalKey::new(*b"a", 1, ObjectType::Set);
        let b = InternalKey::new(*b"a", 2, ObjectType::Set);
        assert!(a > b);
    }

    #[test]
    fn object_type_roundtrip() {
        for t in [ObjectType::Set, ObjectType::Delete, ObjectType::Append] {
            assert_eq!(Ok(t), ObjectType::try_from(u8::from(t)));
        }
        assert!(ObjectType::try_from(3).is_err());
    }
}
