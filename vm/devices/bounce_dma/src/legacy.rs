// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounce buffers from the platform page allocator, used when the reserved
//! pool is unavailable.

use dma_platform::AllocationPolicy;
use dma_platform::MemoryType;
use dma_platform::OutOfPages;
use dma_platform::PageAllocator;
use std::sync::Arc;

pub(crate) struct LegacyAllocator {
    allocator: Arc<dyn PageAllocator>,
}

impl LegacyAllocator {
    pub fn new(allocator: Arc<dyn PageAllocator>) -> Self {
        Self { allocator }
    }

    pub fn allocate(
        &self,
        policy: AllocationPolicy,
        memory_type: MemoryType,
        pages: u64,
    ) -> Result<u64, OutOfPages> {
        let base = self.allocator.allocate_pages(policy, memory_type, pages)?;
        debug_assert!(policy.allows(base, pages));
        tracing::debug!(base, pages, ?policy, ?memory_type, "legacy pages allocated");
        Ok(base)
    }

    pub fn free(&self, base: u64, pages: u64) {
        tracing::debug!(base, pages, "legacy pages freed");
        self.allocator.free_pages(base, pages);
    }
}
