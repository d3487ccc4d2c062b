// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits for the platform services consumed by the bounce-buffer DMA layer:
//! physical page allocation and access to guest physical memory.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

/// The 4KB page size used for DMA.
pub const PAGE_SIZE: usize = 4096;
/// [`PAGE_SIZE`] as a u64.
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

/// The first address above the 32-bit DMA boundary.
pub const FOUR_GB: u64 = 0x1_0000_0000;

/// Returns the number of pages needed to hold `len` bytes.
pub fn pages_for_len(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE64)
}

/// Where the platform allocator may place an allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocationPolicy {
    /// Any available address.
    Anywhere,
    /// The last byte of the allocation must be at or below this address.
    MaxAddress(u64),
}

impl AllocationPolicy {
    /// Returns whether an allocation of `pages` at `base` satisfies the
    /// policy.
    pub fn allows(&self, base: u64, pages: u64) -> bool {
        match *self {
            AllocationPolicy::Anywhere => true,
            AllocationPolicy::MaxAddress(max) => pages
                .checked_mul(PAGE_SIZE64)
                .and_then(|len| base.checked_add(len))
                .is_some_and(|end| end.saturating_sub(1) <= max),
        }
    }
}

/// The firmware memory type of an allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryType {
    /// Memory owned by the OS loader.
    LoaderData,
    /// Boot-time data, reclaimed by the OS after exit.
    BootServicesData,
    /// Runtime data, preserved after exit.
    RuntimeServicesData,
    /// Memory that is never available to the OS.
    ReservedMemory,
}

/// The platform allocator is out of pages.
#[derive(Debug, Error)]
#[error("unable to allocate {pages:#x} pages with {policy:?}")]
pub struct OutOfPages {
    /// The number of pages requested.
    pub pages: u64,
    /// The requested placement.
    pub policy: AllocationPolicy,
}

/// The platform's physical page allocator.
pub trait PageAllocator: Send + Sync {
    /// Allocates `count` contiguous, page-aligned pages. The pages are private.
    fn allocate_pages(
        &self,
        policy: AllocationPolicy,
        memory_type: MemoryType,
        count: u64,
    ) -> Result<u64, OutOfPages>;

    /// Frees pages previously returned by [`Self::allocate_pages`].
    fn free_pages(&self, base: u64, count: u64);
}

/// An access to guest physical memory failed.
#[derive(Debug, Error)]
#[error("invalid guest physical access at {gpa:#x} for {len:#x} bytes")]
pub struct GuestMemoryError {
    /// The starting address of the access.
    pub gpa: u64,
    /// The length of the access.
    pub len: u64,
}

/// CPU access to guest physical memory.
pub trait GuestPhysMemory: Send + Sync {
    /// Reads `data.len()` bytes starting at `gpa`.
    fn read_at(&self, gpa: u64, data: &mut [u8]) -> Result<(), GuestMemoryError>;

    /// Writes `data` starting at `gpa`.
    fn write_at(&self, gpa: u64, data: &[u8]) -> Result<(), GuestMemoryError>;

    /// Fills `len` bytes starting at `gpa` with `val`.
    fn fill_at(&self, gpa: u64, val: u8, len: usize) -> Result<(), GuestMemoryError> {
        let chunk = [val; PAGE_SIZE];
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(PAGE_SIZE);
            self.write_at(gpa + offset as u64, &chunk[..n])?;
            offset += n;
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges must not overlap.
    fn copy(&self, dst: u64, src: u64, len: u64) -> Result<(), GuestMemoryError> {
        let mut buf = [0; PAGE_SIZE];
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(PAGE_SIZE64) as usize;
            self.read_at(src + offset, &mut buf[..n])?;
            self.write_at(dst + offset, &buf[..n])?;
            offset += n as u64;
        }
        Ok(())
    }
}
