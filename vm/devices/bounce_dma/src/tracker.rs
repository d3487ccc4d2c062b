// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Registry of outstanding mappings.
//!
//! Records live in a [`Slab`] and are linked into a doubly-linked list
//! anchored by a sentinel node, so insertion and removal are O(1) and a sweep
//! can walk every record while removing them. Handles carry a generation
//! stamped at insertion, so a handle outlives neither its record nor a reuse
//! of its key.

use slab::Slab;
use std::fmt;

const SENTINEL: usize = 0;

/// An opaque handle to a tracked mapping.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MappingHandle {
    index: usize,
    generation: u64,
}

impl fmt::Debug for MappingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappingHandle({}:{})", self.index, self.generation)
    }
}

/// The lifecycle state of a tracked record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    /// Mapped and visible to lookups.
    Active,
    /// An unmap is in progress.
    Releasing,
    /// Detached while the memory map was frozen. The key is never reused.
    Abandoned,
}

#[derive(Debug)]
struct Node<T> {
    prev: usize,
    next: usize,
    generation: u64,
    entry: Option<Entry<T>>,
}

#[derive(Debug)]
struct Entry<T> {
    status: RecordStatus,
    value: T,
}

/// A slab of records threaded onto a sentinel-anchored list.
#[derive(Debug)]
pub struct MappingTracker<T> {
    nodes: Slab<Node<T>>,
    next_generation: u64,
    len: usize,
}

impl<T> Default for MappingTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MappingTracker<T> {
    /// Returns an empty tracker.
    pub fn new() -> Self {
        let mut nodes = Slab::new();
        let sentinel = nodes.insert(Node {
            prev: SENTINEL,
            next: SENTINEL,
            generation: 0,
            entry: None,
        });
        debug_assert_eq!(sentinel, SENTINEL);
        Self {
            nodes,
            next_generation: 1,
            len: 0,
        }
    }

    /// The number of linked records, releasing ones included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether no records are linked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `value` at the head of the list.
    pub fn insert(&mut self, value: T) -> MappingHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let head = self.nodes[SENTINEL].next;
        let index = self.nodes.insert(Node {
            prev: SENTINEL,
            next: head,
            generation,
            entry: Some(Entry {
                status: RecordStatus::Active,
                value,
            }),
        });
        self.nodes[head].prev = index;
        self.nodes[SENTINEL].next = index;
        self.len += 1;
        MappingHandle { index, generation }
    }

    fn entry(&self, handle: MappingHandle) -> Option<&Entry<T>> {
        if handle.index == SENTINEL {
            return None;
        }
        let node = self.nodes.get(handle.index)?;
        if node.generation != handle.generation {
            return None;
        }
        node.entry.as_ref()
    }

    fn entry_mut(&mut self, handle: MappingHandle) -> Option<&mut Entry<T>> {
        if handle.index == SENTINEL {
            return None;
        }
        let node = self.nodes.get_mut(handle.index)?;
        if node.generation != handle.generation {
            return None;
        }
        node.entry.as_mut()
    }

    /// Returns the status of the record for `handle`.
    pub fn status(&self, handle: MappingHandle) -> Option<RecordStatus> {
        self.entry(handle).map(|e| e.status)
    }

    /// Returns the active record for `handle`.
    pub fn get(&self, handle: MappingHandle) -> Option<&T> {
        self.entry(handle)
            .filter(|e| e.status == RecordStatus::Active)
            .map(|e| &e.value)
    }

    /// Moves an active record to [`RecordStatus::Releasing`] and returns it.
    /// Fails if the record is unknown or already being released.
    pub fn begin_release(&mut self, handle: MappingHandle) -> Option<&T> {
        let entry = self
            .entry_mut(handle)
            .filter(|e| e.status == RecordStatus::Active)?;
        entry.status = RecordStatus::Releasing;
        Some(&entry.value)
    }

    /// Unlinks a releasing record and frees its key for reuse.
    pub fn finish_release(&mut self, handle: MappingHandle) -> Option<T> {
        self.entry(handle)
            .filter(|e| e.status == RecordStatus::Releasing)?;
        self.unlink(handle.index);
        self.nodes.remove(handle.index).entry.map(|e| e.value)
    }

    /// Unlinks a releasing record but leaves it in the slab. Its key is never
    /// reused and its handle never resolves to an active record again.
    pub fn abandon(&mut self, handle: MappingHandle) -> bool {
        let Some(entry) = self
            .entry_mut(handle)
            .filter(|e| e.status == RecordStatus::Releasing)
        else {
            return false;
        };
        entry.status = RecordStatus::Abandoned;
        self.unlink(handle.index);
        true
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[index].prev = index;
        self.nodes[index].next = index;
        self.len -= 1;
    }

    /// Returns the handle at the head of the list.
    pub fn first(&self) -> Option<MappingHandle> {
        self.handle_at(self.nodes[SENTINEL].next)
    }

    /// Returns the handle following `handle` in the list.
    pub fn next(&self, handle: MappingHandle) -> Option<MappingHandle> {
        self.entry(handle)
            .filter(|e| e.status != RecordStatus::Abandoned)?;
        self.handle_at(self.nodes[handle.index].next)
    }

    fn handle_at(&self, index: usize) -> Option<MappingHandle> {
        (index != SENTINEL).then(|| MappingHandle {
            index,
            generation: self.nodes[index].generation,
        })
    }

    /// Visits every linked record exactly once. The successor of each record
    /// is captured before `f` runs, so `f` may unlink the record it is given.
    pub fn sweep(&mut self, mut f: impl FnMut(&mut Self, MappingHandle)) {
        let mut next = self.first();
        while let Some(handle) = next {
            next = self.next(handle);
            f(self, handle);
        }
    }
}
