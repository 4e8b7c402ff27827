// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::ObjectType;

/// Count and byte totals for one object type
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TypeObjectStat {
    /// Number of records
    pub count: u64,

    /// Total key bytes
    pub key_size: u64,

    /// Total value bytes
    pub value_size: u64,
}

impl TypeObjectStat {
    /// Records one object of the given key/value size.
    pub fn add(&mut self, key_size: u64, value_size: u64) {
        self.count += 1;
        self.key_size += key_size;
        self.value_size += value_size;
    }

    /// Adds another stat's totals into this one.
    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.key_size += other.key_size;
        self.value_size += other.value_size;
    }
}

/// Per-type object statistics of a memwriter or segment
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ObjectStat {
    /// Set records
    pub set_stat: TypeObjectStat,

    /// Delete records (tombstones)
    pub delete_stat: TypeObjectStat,

    /// Append fragments
    pub append_stat: TypeObjectStat,
}

impl ObjectStat {
    /// Total record count across all object types.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.set_stat.count + self.delete_stat.count + self.append_stat.count
    }

    /// Returns the per-type stat matching `object_type`.
    pub fn of_type(&mut self, object_type: ObjectType) -> &mut TypeObjectStat {
        match object_type {
            ObjectType::Set => &mut self.set_stat,
            ObjectType::Delete => &mut self.delete_stat,
            ObjectType::Append => &mut self.append_stat,
        }
    }

    /// Records one object of the given type and key/value size.
    pub fn add(&mut self, object_type: ObjectType, key_size: u64, value_size: u64) {
        self.of_type(object_type).add(key_size, value_size);
    }

    /// Adds another stat's totals into this one.
    pub fn merge(&mut self, other: &Self) {
        self.set_stat.merge(&other.set_stat);
        self.delete_stat.merge(&other.delete_stat);
        self.append_stat.merge(&other.append_stat);
    }
}

/// Count and byte totals of a reader class (memwriters or segments)
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReaderStat {
    /// Number of readers
    pub count: u64,

    /// Total bytes held
    pub size: u64,
}

impl ReaderStat {
    /// Records one reader of the given size.
    pub fn add(&mut self, size: u64) {
        self.count += 1;
        self.size += size;
    }
}

/// Aggregated statistics of one bucket
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BucketStat {
    /// Record totals across memory and disk
    pub object_stat: ObjectStat,

    /// In-memory writers (active plus sealed)
    pub memwriter_stat: ReaderStat,

    /// Persisted segments
    pub segment_stat: ReaderStat,
}
