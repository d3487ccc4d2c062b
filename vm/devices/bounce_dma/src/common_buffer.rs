// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common buffers: DMA buffers mapped in place.
//!
//! Each buffer is preceded by a private header page recording a private
//! stash of the same size. While the buffer is mapped its pages are shared,
//! and the stash holds the contents across each visibility change.

use crate::BELOW_4GB;
use crate::BounceBacking;
use crate::BounceDmaManager;
use crate::DmaError;
use crate::IoMmuOperation;
use crate::ManagerInner;
use crate::ManagerState;
use crate::MappingRecord;
use crate::MemoryMapState;
use bitfield_struct::bitfield;
use dma_platform::AllocationPolicy;
use dma_platform::FOUR_GB;
use dma_platform::MemoryType;
use dma_platform::OutOfPages;
use dma_platform::PAGE_SIZE64;
use page_visibility::HostVisibility;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const COMMON_BUFFER_SIGNATURE: u64 = u64::from_le_bytes(*b"CMNBUFFR");

#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct CommonBufferHeader {
    signature: u64,
    stash_buffer: u64,
    /// The pool bit of the visible region, or zero if it came from the page
    /// allocator.
    reserved_bitmap: u32,
    /// The size of the buffer and of its stash.
    pages: u32,
}

/// Attributes requested for a common buffer.
#[bitfield(u64)]
pub struct BufferAttributes {
    #[bits(7)]
    _reserved0: u8,
    /// Write-combined access.
    pub write_combine: bool,
    #[bits(3)]
    _reserved1: u8,
    /// Cached access.
    pub cached: bool,
    #[bits(3)]
    _reserved2: u8,
    /// The device can address memory above 4GB.
    pub dual_address_cycle: bool,
    #[bits(48)]
    _reserved3: u64,
}

const SUPPORTED_ATTRIBUTES: u64 = BufferAttributes::new()
    .with_write_combine(true)
    .with_cached(true)
    .with_dual_address_cycle(true)
    .into_bits();

impl BounceDmaManager {
    /// Allocates a `pages` page buffer for use with the common buffer
    /// operations.
    ///
    /// Boot services buffers come from the shared pool when possible. All
    /// others are placed below 4GB unless `attributes` allows dual address
    /// cycles.
    pub fn allocate_buffer(
        &self,
        pages: u64,
        memory_type: MemoryType,
        attributes: BufferAttributes,
    ) -> Result<u64, DmaError> {
        match memory_type {
            MemoryType::BootServicesData | MemoryType::RuntimeServicesData => {}
            _ => return Err(DmaError::InvalidMemoryType(memory_type)),
        }
        let bits = attributes.into_bits();
        if bits & !SUPPORTED_ATTRIBUTES != 0 {
            return Err(DmaError::UnsupportedAttributes(bits));
        }
        if pages == 0 {
            return Err(DmaError::ZeroPages);
        }
        let header_pages = u32::try_from(pages).map_err(|_| OutOfPages {
            pages,
            policy: AllocationPolicy::Anywhere,
        })?;
        self.inner.check_live()?;

        let inner = &self.inner;
        let stash = inner
            .legacy
            .allocate(AllocationPolicy::Anywhere, memory_type, pages)?;

        let (header_address, backing) = match inner.allocate_visible(pages, memory_type, attributes)
        {
            Ok(visible) => visible,
            Err(err) => {
                inner.legacy.free(stash, pages);
                return Err(err);
            }
        };

        let header = CommonBufferHeader {
            signature: COMMON_BUFFER_SIGNATURE,
            stash_buffer: stash,
            reserved_bitmap: backing.bitmap(),
            pages: header_pages,
        };
        let written = inner.memory.write_at(header_address, header.as_bytes());

        let mut state = inner.state.lock();
        if state.memory_map == MemoryMapState::Frozen {
            // Teardown ran during the allocation. The pages can no longer be
            // returned.
            tracing::warn!(header_address, pages, "memory map frozen while allocating");
            return Err(DmaError::MemoryMapFrozen);
        }
        if let Err(err) = written {
            inner.free_visible(&mut state, header_address, pages, backing);
            inner.legacy.free(stash, pages);
            return Err(err.into());
        }
        drop(state);

        let host_address = header_address + PAGE_SIZE64;
        tracing::debug!(
            host_address,
            pages,
            stash,
            bitmap = backing.bitmap(),
            ?memory_type,
            "common buffer allocated"
        );
        Ok(host_address)
    }

    /// Frees a buffer returned by [`Self::allocate_buffer`].
    ///
    /// `pages` must match the size the buffer was allocated with.
    pub fn free_buffer(&self, pages: u64, host_address: u64) -> Result<(), DmaError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.memory_map == MemoryMapState::Frozen {
            return Err(DmaError::MemoryMapFrozen);
        }
        let header = inner.read_header(host_address)?;
        if pages != u64::from(header.pages) {
            return Err(DmaError::BufferSizeMismatch {
                address: host_address,
                pages,
                allocated: header.pages.into(),
            });
        }
        let header_address = host_address - PAGE_SIZE64;

        inner
            .memory
            .write_at(header_address, CommonBufferHeader::new_zeroed().as_bytes())?;
        inner.legacy.free(header.stash_buffer, pages);
        let backing = BounceBacking::from_bitmap(header.reserved_bitmap);
        inner.free_visible(&mut state, header_address, pages, backing);
        drop(state);

        tracing::debug!(
            host_address,
            pages,
            bitmap = backing.bitmap(),
            "common buffer freed"
        );
        Ok(())
    }
}

impl ManagerInner {
    /// Allocates the header page and visible pages of a common buffer.
    fn allocate_visible(
        &self,
        pages: u64,
        memory_type: MemoryType,
        attributes: BufferAttributes,
    ) -> Result<(u64, BounceBacking), DmaError> {
        if memory_type == MemoryType::BootServicesData {
            if let Some(pool) = self.state.lock().pool.as_mut() {
                match pool.allocate(pages) {
                    Ok(slot) => {
                        return Ok((
                            slot.data_address - PAGE_SIZE64,
                            BounceBacking::Pool(slot.mask),
                        ));
                    }
                    Err(err) => {
                        tracing::debug!(
                            pages,
                            error = &err as &dyn std::error::Error,
                            "common buffer not pooled"
                        );
                    }
                }
            }
        }

        let policy = if attributes.dual_address_cycle() {
            AllocationPolicy::Anywhere
        } else {
            BELOW_4GB
        };
        let total = pages.checked_add(1).ok_or(OutOfPages { pages, policy })?;
        let base = self.legacy.allocate(policy, memory_type, total)?;
        Ok((base, BounceBacking::Legacy))
    }

    fn free_visible(
        &self,
        state: &mut ManagerState,
        header_address: u64,
        pages: u64,
        backing: BounceBacking,
    ) {
        match backing {
            BounceBacking::Pool(mask) => {
                if let Some(pool) = state.pool.as_mut() {
                    pool.free(mask);
                }
            }
            BounceBacking::Legacy => self.legacy.free(header_address, pages + 1),
        }
    }

    fn read_header(&self, host_address: u64) -> Result<CommonBufferHeader, DmaError> {
        if host_address % PAGE_SIZE64 != 0 {
            return Err(DmaError::UnalignedBuffer(host_address));
        }
        let header_address = host_address
            .checked_sub(PAGE_SIZE64)
            .ok_or(DmaError::NotCommonBuffer(host_address))?;
        let mut header = CommonBufferHeader::new_zeroed();
        self.memory
            .read_at(header_address, header.as_mut_bytes())
            .map_err(|_| DmaError::NotCommonBuffer(host_address))?;
        if header.signature != COMMON_BUFFER_SIGNATURE {
            return Err(DmaError::NotCommonBuffer(host_address));
        }
        Ok(header)
    }

    pub(crate) fn map_common_buffer(
        &self,
        operation: IoMmuOperation,
        host_address: u64,
        len: u64,
        pages: u64,
    ) -> Result<MappingRecord, DmaError> {
        if !operation.is_64bit()
            && host_address
                .checked_add(len)
                .is_none_or(|end| end > FOUR_GB)
        {
            return Err(DmaError::AboveFourGb {
                address: host_address,
                len,
            });
        }

        let header = self.read_header(host_address)?;
        if pages > u64::from(header.pages) {
            return Err(DmaError::BufferSizeMismatch {
                address: host_address,
                pages,
                allocated: header.pages.into(),
            });
        }
        let stash = header.stash_buffer;
        let backing = BounceBacking::from_bitmap(header.reserved_bitmap);
        let region_len = pages * PAGE_SIZE64;

        self.memory.copy(stash, host_address, region_len)?;
        if backing == BounceBacking::Legacy {
            self.set_visibility(host_address, pages, HostVisibility::Shared);
        }

        let record = MappingRecord {
            operation,
            len,
            pages,
            crypted_address: host_address,
            plaintext_address: host_address,
            backing,
            stash_address: Some(stash),
        };
        if let Err(err) = self.memory.copy(host_address, stash, region_len) {
            self.restore_record(&record, MemoryMapState::Live).ok();
            return Err(err.into());
        }
        Ok(record)
    }
}
