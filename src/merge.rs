// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Object;
use interval_heap::IntervalHeap as Heap;

pub type BoxedIterator<'a> = Box<dyn Iterator<Item = crate::Result<Object>> + 'a>;

/// Heap entry carrying the source rank
///
/// Sources are ranked newest-first (active memwriter, sealed memwriters,
/// then segments by descending fileid), so for equal user keys the newest
/// record surfaces first. Records inside one source are already ordered.
#[derive(Eq)]
struct HeapItem(usize, Object);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 && self.1.key.user_key == other.1.key.user_key
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.1.key.user_key, self.0).cmp(&(&other.1.key.user_key, other.0))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges multiple object streams, newest source first per key
pub struct Merger<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: Heap<HeapItem>,
    initialized: bool,
}

impl<'a> Merger<'a> {
    /// Builds a merger over sources ordered newest to oldest.
    #[must_use]
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        let heap = Heap::with_capacity(iterators.len());

        Self {
            iterators,
            heap,
            initialized: false,
        }
    }

    #[allow(clippy::indexing_slicing)]
    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            if let Some(item) = self.iterators[idx].next() {
                let item = item?;
                self.heap.push(HeapItem(idx, item));
            }
        }
        self.initialized = true;
        Ok(())
    }
}

impl<'a> Iterator for Merger<'a> {
    type Item = crate::Result<Object>;

    #[allow(clippy::indexing_slicing)]
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.initialize());
        }

        let min_item = self.heap.pop_min()?;

        if let Some(next_item) = self.iterators[min_item.0].next() {
            let next_item = fail_iter!(next_item);
            self.heap.push(HeapItem(min_item.0, next_item));
        }

        Some(Ok(min_item.1))
    }
}
