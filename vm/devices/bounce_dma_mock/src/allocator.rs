// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A recording page allocator.

use dma_platform::AllocationPolicy;
use dma_platform::MemoryType;
use dma_platform::OutOfPages;
use dma_platform::PAGE_SIZE64;
use dma_platform::PageAllocator;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Range;

/// A recorded allocator call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocatorCall {
    /// A successful allocation.
    Allocate {
        /// The base of the allocation.
        base: u64,
        /// The page count.
        pages: u64,
        /// The requested placement.
        policy: AllocationPolicy,
        /// The requested memory type.
        memory_type: MemoryType,
    },
    /// A free.
    Free {
        /// The base of the freed pages.
        base: u64,
        /// The page count.
        pages: u64,
    },
}

struct AllocatorState {
    /// Free ranges, sorted and coalesced.
    free: Vec<Range<u64>>,
    /// Outstanding allocations by base address.
    allocated: BTreeMap<u64, u64>,
    calls: Vec<AllocatorCall>,
    fail: bool,
}

impl AllocatorState {
    fn insert_free(&mut self, range: Range<u64>) {
        let index = self.free.partition_point(|r| r.start < range.start);
        self.free.insert(index, range);
        let mut merged: Vec<Range<u64>> = Vec::with_capacity(self.free.len());
        for r in self.free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end == r.start => last.end = r.end,
                _ => merged.push(r),
            }
        }
        self.free = merged;
    }
}

/// A page allocator over a fixed set of ranges.
///
/// Allocations are taken from the highest address that satisfies the policy,
/// so an [`AllocationPolicy::Anywhere`] request lands above 4GB when high
/// memory is available.
pub struct MockPageAllocator {
    state: Mutex<AllocatorState>,
}

impl MockPageAllocator {
    /// Creates an allocator owning the page-aligned `ranges`.
    pub fn new(ranges: &[Range<u64>]) -> Self {
        let mut state = AllocatorState {
            free: Vec::new(),
            allocated: BTreeMap::new(),
            calls: Vec::new(),
            fail: false,
        };
        for range in ranges {
            assert!(range.start % PAGE_SIZE64 == 0 && range.end % PAGE_SIZE64 == 0);
            state.insert_free(range.clone());
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Makes every subsequent allocation fail.
    pub fn fail_allocations(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    /// Returns every successful call so far.
    pub fn calls(&self) -> Vec<AllocatorCall> {
        self.state.lock().calls.clone()
    }

    /// The number of successful calls so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// The number of allocated pages not yet freed.
    pub fn outstanding_pages(&self) -> u64 {
        self.state.lock().allocated.values().sum()
    }

    /// Returns whether an allocation starts at `base`.
    pub fn is_allocated(&self, base: u64) -> bool {
        self.state.lock().allocated.contains_key(&base)
    }
}

impl PageAllocator for MockPageAllocator {
    fn allocate_pages(
        &self,
        policy: AllocationPolicy,
        memory_type: MemoryType,
        count: u64,
    ) -> Result<u64, OutOfPages> {
        let mut state = self.state.lock();
        let err = OutOfPages {
            pages: count,
            policy,
        };
        if state.fail || count == 0 {
            return Err(err);
        }
        let len = count * PAGE_SIZE64;
        let limit = match policy {
            AllocationPolicy::Anywhere => u64::MAX,
            AllocationPolicy::MaxAddress(max) => max.saturating_add(1) & !(PAGE_SIZE64 - 1),
        };
        let (index, base) = state
            .free
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, r)| {
                let end = r.end.min(limit);
                let base = end.checked_sub(len)?;
                (base >= r.start).then_some((i, base))
            })
            .ok_or(err)?;

        let range = state.free.remove(index);
        if range.start < base {
            state.free.insert(index, range.start..base);
        }
        if base + len < range.end {
            state.insert_free(base + len..range.end);
        }
        state.allocated.insert(base, count);
        state.calls.push(AllocatorCall::Allocate {
            base,
            pages: count,
            policy,
            memory_type,
        });
        tracing::trace!(base, count, ?policy, ?memory_type, "mock allocate");
        Ok(base)
    }

    fn free_pages(&self, base: u64, count: u64) {
        let mut state = self.state.lock();
        match state.allocated.remove(&base) {
            Some(pages) if pages == count => {}
            other => panic!("freeing {count:#x} pages at {base:#x}, allocated {other:?}"),
        }
        state.insert_free(base..base + count * PAGE_SIZE64);
        state.calls.push(AllocatorCall::Free { base, pages: count });
        tracing::trace!(base, count, "mock free");
    }
}
