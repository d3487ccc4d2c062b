// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounce-buffer DMA for hardware-isolated guests.
//!
//! Devices cannot access private (encrypted) guest memory. This crate stages
//! bus-master transfers through shared bounce buffers, taken from a pool of
//! permanently shared slots when possible and converted on demand otherwise,
//! and copies data between the private and shared views at map and unmap
//! time.
//!
//! Common buffers are the exception: they are used in place, with a private
//! stash preserving their contents while they are shared with the device.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod common_buffer;
mod config;
mod error;
mod legacy;
mod shutdown;
mod tracker;

#[cfg(test)]
mod tests;

pub use common_buffer::BufferAttributes;
pub use config::BounceDmaConfig;
pub use config::ConfigError;
pub use config::RESERVED_POOL_ENV_VAR_NAME;
pub use config::ReservedPoolMode;
pub use error::DmaError;
pub use error::ErrorKind;
pub use shutdown::ExitCallback;
pub use shutdown::ExitNotification;
pub use shutdown::ExitNotifier;
pub use shutdown::ExitPriority;
pub use tracker::MappingHandle;
pub use tracker::RecordStatus;

use anyhow::Context;
use bitfield_struct::bitfield;
use dma_platform::AllocationPolicy;
use dma_platform::FOUR_GB;
use dma_platform::GuestPhysMemory;
use dma_platform::MemoryType;
use dma_platform::PAGE_SIZE64;
use dma_platform::PageAllocator;
use dma_platform::pages_for_len;
use legacy::LegacyAllocator;
use page_visibility::HostVisibility;
use page_visibility::PageRange;
use page_visibility::PageVisibility;
use parking_lot::Mutex;
use reserved_pool_alloc::ReservedPool;
use reserved_pool_alloc::SizeClass;
use reserved_pool_alloc::SlotMask;
use std::sync::Arc;
use tracker::MappingTracker;

/// The allocation policy for buffers that 32-bit devices must reach.
const BELOW_4GB: AllocationPolicy = AllocationPolicy::MaxAddress(FOUR_GB - 1);

/// A bus-master DMA operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum IoMmuOperation {
    /// The device reads system memory. 32-bit addressing.
    BusMasterRead = 0,
    /// The device writes system memory. 32-bit addressing.
    BusMasterWrite = 1,
    /// Simultaneous access by the processor and the device. 32-bit addressing.
    BusMasterCommonBuffer = 2,
    /// The device reads system memory. 64-bit addressing.
    BusMasterRead64 = 3,
    /// The device writes system memory. 64-bit addressing.
    BusMasterWrite64 = 4,
    /// Simultaneous access by the processor and the device. 64-bit addressing.
    BusMasterCommonBuffer64 = 5,
}

impl IoMmuOperation {
    /// Returns whether the device reads memory.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            IoMmuOperation::BusMasterRead | IoMmuOperation::BusMasterRead64
        )
    }

    /// Returns whether the device writes memory.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            IoMmuOperation::BusMasterWrite | IoMmuOperation::BusMasterWrite64
        )
    }

    /// Returns whether this is a common buffer operation.
    pub fn is_common_buffer(&self) -> bool {
        matches!(
            self,
            IoMmuOperation::BusMasterCommonBuffer | IoMmuOperation::BusMasterCommonBuffer64
        )
    }

    /// Returns whether the device can address all of memory.
    pub fn is_64bit(&self) -> bool {
        matches!(
            self,
            IoMmuOperation::BusMasterRead64
                | IoMmuOperation::BusMasterWrite64
                | IoMmuOperation::BusMasterCommonBuffer64
        )
    }

    fn bounce_policy(&self) -> AllocationPolicy {
        if self.is_64bit() {
            AllocationPolicy::Anywhere
        } else {
            BELOW_4GB
        }
    }
}

impl TryFrom<u32> for IoMmuOperation {
    type Error = DmaError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let operation = match value {
            0 => IoMmuOperation::BusMasterRead,
            1 => IoMmuOperation::BusMasterWrite,
            2 => IoMmuOperation::BusMasterCommonBuffer,
            3 => IoMmuOperation::BusMasterRead64,
            4 => IoMmuOperation::BusMasterWrite64,
            5 => IoMmuOperation::BusMasterCommonBuffer64,
            _ => return Err(DmaError::InvalidOperation(value)),
        };
        Ok(operation)
    }
}

/// Device access rights for [`BounceDmaManager::set_attribute`].
#[bitfield(u64)]
pub struct IoMmuAccess {
    /// The device may read the mapping.
    pub read: bool,
    /// The device may write the mapping.
    pub write: bool,
    #[bits(62)]
    _reserved: u64,
}

const SUPPORTED_ACCESS_BITS: u64 = IoMmuAccess::new()
    .with_read(true)
    .with_write(true)
    .into_bits();

/// An opaque identifier of the device requesting access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceHandle(pub u64);

/// Where a bounce region came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BounceBacking {
    /// A permanently shared slot of the reserved pool.
    Pool(SlotMask),
    /// Pages from the platform allocator, shared for the mapping's lifetime.
    Legacy,
}

impl BounceBacking {
    fn from_bitmap(bits: u32) -> Self {
        SlotMask::from_bits(bits).map_or(BounceBacking::Legacy, BounceBacking::Pool)
    }

    fn bitmap(&self) -> u32 {
        match self {
            BounceBacking::Pool(mask) => mask.bits(),
            BounceBacking::Legacy => 0,
        }
    }
}

/// An outstanding mapping.
#[derive(Debug, Clone)]
pub struct MappingRecord {
    /// The mapped operation.
    pub operation: IoMmuOperation,
    /// The length of the transfer in bytes.
    pub len: u64,
    /// The number of pages spanned by the transfer.
    pub pages: u64,
    /// The driver's (private) buffer.
    pub crypted_address: u64,
    /// The address handed to the device.
    pub plaintext_address: u64,
    /// Where the plaintext region came from.
    pub backing: BounceBacking,
    /// The private stash of a common buffer.
    pub stash_address: Option<u64>,
}

/// The result of [`BounceDmaManager::map`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// The address the device should use.
    pub device_address: u64,
    /// The handle to pass to [`BounceDmaManager::unmap`].
    pub handle: MappingHandle,
}

/// The platform services used by [`BounceDmaManager`].
pub struct BounceDmaPlatform {
    /// The processor's view of guest memory.
    pub memory: Arc<dyn GuestPhysMemory>,
    /// The physical page allocator.
    pub allocator: Arc<dyn PageAllocator>,
    /// The page visibility backend.
    pub visibility: Arc<dyn PageVisibility>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum MemoryMapState {
    Live,
    /// Allocator calls are no longer allowed.
    Frozen,
}

struct ManagerState {
    pool: Option<ReservedPool>,
    tracker: MappingTracker<MappingRecord>,
    memory_map: MemoryMapState,
}

struct ManagerInner {
    memory: Arc<dyn GuestPhysMemory>,
    legacy: LegacyAllocator,
    visibility: Arc<dyn PageVisibility>,
    state: Mutex<ManagerState>,
}

/// Maps bus-master DMA through shared bounce buffers.
#[derive(Clone)]
pub struct BounceDmaManager {
    inner: Arc<ManagerInner>,
}

impl BounceDmaManager {
    /// Creates a new manager, reserving the shared pool if `config` and the
    /// platform allow it.
    ///
    /// Failure to allocate the pool is not fatal: every bounce buffer is then
    /// converted on demand.
    pub fn new(platform: BounceDmaPlatform, config: &BounceDmaConfig) -> anyhow::Result<Self> {
        let BounceDmaPlatform {
            memory,
            allocator,
            visibility,
        } = platform;

        let mut inner = ManagerInner {
            memory,
            legacy: LegacyAllocator::new(allocator),
            visibility,
            state: Mutex::new(ManagerState {
                pool: None,
                tracker: MappingTracker::new(),
                memory_map: MemoryMapState::Live,
            }),
        };

        let support = inner.visibility.pool_reservation_support();
        if config.reserved_pool.should_reserve(support) {
            let pool = inner
                .reserve_pool(&config.size_classes)
                .context("failed to reserve the shared pool")?;
            inner.state.get_mut().pool = pool;
        } else {
            tracing::info!(
                mode = ?config.reserved_pool,
                ?support,
                "shared pool not reserved"
            );
        }

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Maps `len` bytes at `host_address` for a bus-master `operation`.
    pub fn map(
        &self,
        operation: IoMmuOperation,
        host_address: u64,
        len: u64,
    ) -> Result<Mapping, DmaError> {
        if host_address == 0 {
            return Err(DmaError::NullAddress);
        }
        if len == 0 {
            return Err(DmaError::ZeroLength);
        }
        self.inner.check_live()?;

        let pages = pages_for_len(len);
        let record = if operation.is_common_buffer() {
            self.inner
                .map_common_buffer(operation, host_address, len, pages)?
        } else {
            self.inner.map_bounce(operation, host_address, len, pages)?
        };

        let device_address = record.plaintext_address;
        let backing = record.backing;
        let mut state = self.inner.state.lock();
        if state.memory_map == MemoryMapState::Frozen {
            // Teardown ran while the region was being prepared. It can no
            // longer be returned to its allocator.
            drop(state);
            if let Err(err) = self.inner.restore_record(&record, MemoryMapState::Frozen) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "ignoring restore failure for a mapping abandoned at teardown"
                );
            }
            tracing::warn!(
                ?operation,
                host_address,
                device_address,
                "memory map frozen while mapping"
            );
            return Err(DmaError::MemoryMapFrozen);
        }
        let handle = state.tracker.insert(record);
        drop(state);
        tracing::debug!(
            ?operation,
            host_address,
            len,
            device_address,
            bitmap = backing.bitmap(),
            ?handle,
            "mapped"
        );
        Ok(Mapping {
            device_address,
            handle,
        })
    }

    /// Like [`Self::map`], with the operation given by its raw value.
    pub fn map_raw(
        &self,
        operation: u32,
        host_address: u64,
        len: u64,
    ) -> Result<Mapping, DmaError> {
        self.map(operation.try_into()?, host_address, len)
    }

    /// Completes the transfer for `handle` and releases its bounce region.
    pub fn unmap(&self, handle: MappingHandle) -> Result<(), DmaError> {
        let (record, memory_map) = {
            let mut state = self.inner.state.lock();
            let memory_map = state.memory_map;
            let record = state
                .tracker
                .begin_release(handle)
                .ok_or(DmaError::UnknownMapping(handle))?
                .clone();
            (record, memory_map)
        };

        let result = self.inner.unmap_record(&record, memory_map);

        // Teardown may have frozen the memory map since the record was taken.
        let mut state = self.inner.state.lock();
        match state.memory_map {
            MemoryMapState::Live => {
                self.inner.release_region(&mut state, &record);
                state.tracker.finish_release(handle);
            }
            MemoryMapState::Frozen => {
                state.tracker.abandon(handle);
            }
        }
        drop(state);
        tracing::debug!(
            operation = ?record.operation,
            crypted = record.crypted_address,
            plaintext = record.plaintext_address,
            pages = record.pages,
            ?handle,
            "unmapped"
        );
        result
    }

    /// Validates the access a device requests to a mapping.
    pub fn set_attribute(
        &self,
        device: DeviceHandle,
        handle: MappingHandle,
        access: IoMmuAccess,
    ) -> Result<(), DmaError> {
        let state = self.inner.state.lock();
        let record = state
            .tracker
            .get(handle)
            .ok_or(DmaError::UnknownMapping(handle))?;

        let bits = access.into_bits();
        if bits & !SUPPORTED_ACCESS_BITS != 0 {
            return Err(DmaError::UnsupportedAccess(bits));
        }
        let operation = record.operation;
        if (operation.is_read() && access.write()) || (operation.is_write() && access.read()) {
            return Err(DmaError::AccessMismatch {
                operation,
                access: bits,
            });
        }
        tracing::trace!(?device, ?handle, access = bits, "access granted");
        Ok(())
    }

    /// Returns the outstanding mapping for `handle`.
    pub fn mapping(&self, handle: MappingHandle) -> Option<MappingRecord> {
        self.inner.state.lock().tracker.get(handle).cloned()
    }

    /// Returns the lifecycle state of the record for `handle`, or `None` once
    /// it has been unmapped.
    pub fn mapping_status(&self, handle: MappingHandle) -> Option<RecordStatus> {
        self.inner.state.lock().tracker.status(handle)
    }

    /// The number of outstanding mappings.
    pub fn outstanding_mappings(&self) -> usize {
        self.inner.state.lock().tracker.len()
    }

    /// The shared pool's allocation bitmap, if there is a pool.
    pub fn pool_bitmap(&self) -> Option<u32> {
        self.inner.state.lock().pool.as_ref().map(|p| p.bitmap())
    }

    /// Returns whether the exit teardown has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().memory_map == MemoryMapState::Frozen
    }
}

impl ManagerInner {
    fn check_live(&self) -> Result<(), DmaError> {
        match self.state.lock().memory_map {
            MemoryMapState::Live => Ok(()),
            MemoryMapState::Frozen => Err(DmaError::MemoryMapFrozen),
        }
    }

    fn reserve_pool(&self, classes: &[SizeClass]) -> anyhow::Result<Option<ReservedPool>> {
        let pages = ReservedPool::required_pages(classes).context("invalid pool layout")?;
        let base = match self
            .legacy
            .allocate(BELOW_4GB, MemoryType::BootServicesData, pages)
        {
            Ok(base) => base,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "no memory for the shared pool, converting every bounce buffer on demand"
                );
                return Ok(None);
            }
        };
        let pool = ReservedPool::new(base, classes)?;
        for slot in pool.slots() {
            self.set_visibility(slot.data_address, slot.data_pages, HostVisibility::Shared);
        }
        tracing::info!(base, pages, "shared pool reserved");
        Ok(Some(pool))
    }

    fn change_visibility(
        &self,
        base: u64,
        pages: u64,
        visibility: HostVisibility,
    ) -> anyhow::Result<()> {
        let range = PageRange::new(base, pages)?;
        match visibility {
            HostVisibility::Shared => self.visibility.set_shared(range)?,
            HostVisibility::Private => self.visibility.set_private(range)?,
        }
        Ok(())
    }

    /// Changes the visibility of a range, halting on failure. The state of the
    /// range is unknown after a failure, so there is nothing to roll back to.
    fn set_visibility(&self, base: u64, pages: u64, visibility: HostVisibility) {
        if let Err(err) = self.change_visibility(base, pages, visibility) {
            tracing::error!(
                base,
                pages,
                ?visibility,
                error = err.as_ref() as &dyn std::error::Error,
                "page visibility change failed"
            );
            panic!("failed to make {pages:#x} pages at {base:#x} {visibility:?}: {err:#}");
        }
    }

    /// Like [`Self::set_visibility`], but only logs failures once the memory
    /// map is frozen.
    fn set_visibility_for(
        &self,
        base: u64,
        pages: u64,
        visibility: HostVisibility,
        memory_map: MemoryMapState,
    ) {
        match memory_map {
            MemoryMapState::Live => self.set_visibility(base, pages, visibility),
            MemoryMapState::Frozen => {
                if let Err(err) = self.change_visibility(base, pages, visibility) {
                    tracing::warn!(
                        base,
                        pages,
                        ?visibility,
                        error = err.as_ref() as &dyn std::error::Error,
                        "ignoring page visibility failure during teardown"
                    );
                }
            }
        }
    }

    fn allocate_bounce(
        &self,
        operation: IoMmuOperation,
        pages: u64,
    ) -> Result<(u64, BounceBacking), DmaError> {
        if let Some(pool) = self.state.lock().pool.as_mut() {
            match pool.allocate(pages) {
                Ok(slot) => {
                    debug_assert!(slot.data_end() <= FOUR_GB);
                    debug_assert!(pool.contains_data(slot.data_address));
                    return Ok((slot.data_address, BounceBacking::Pool(slot.mask)));
                }
                Err(err) => {
                    tracing::warn!(
                        pages,
                        error = &err as &dyn std::error::Error,
                        "shared pool unavailable, falling back to page allocation"
                    );
                }
            }
        }

        let base = self.legacy.allocate(
            operation.bounce_policy(),
            MemoryType::BootServicesData,
            pages,
        )?;
        Ok((base, BounceBacking::Legacy))
    }

    /// Returns the bounce region of `record` to where it came from. Nothing is
    /// released once the memory map is frozen, and common buffers are
    /// released by [`BounceDmaManager::free_buffer`] instead.
    fn release_region(&self, state: &mut ManagerState, record: &MappingRecord) {
        if state.memory_map == MemoryMapState::Frozen || record.stash_address.is_some() {
            return;
        }
        match record.backing {
            BounceBacking::Pool(mask) => {
                if let Some(pool) = state.pool.as_mut() {
                    debug_assert_eq!(
                        pool.slot(mask).map(|slot| slot.data_address),
                        Some(record.plaintext_address)
                    );
                    pool.free(mask);
                }
            }
            BounceBacking::Legacy => self.legacy.free(record.plaintext_address, record.pages),
        }
    }

    fn map_bounce(
        &self,
        operation: IoMmuOperation,
        host_address: u64,
        len: u64,
        pages: u64,
    ) -> Result<MappingRecord, DmaError> {
        let (plaintext_address, backing) = self.allocate_bounce(operation, pages)?;
        if backing == BounceBacking::Legacy {
            self.set_visibility(plaintext_address, pages, HostVisibility::Shared);
        }

        let record = MappingRecord {
            operation,
            len,
            pages,
            crypted_address: host_address,
            plaintext_address,
            backing,
            stash_address: None,
        };

        if operation.is_read() {
            if let Err(err) = self.memory.copy(plaintext_address, host_address, len) {
                self.restore_record(&record, MemoryMapState::Live).ok();
                self.release_region(&mut self.state.lock(), &record);
                return Err(err.into());
            }
        }
        Ok(record)
    }

    /// Moves the plaintext back into private memory. Every step runs even if
    /// a copy fails; the first failure is returned. The bounce region itself
    /// is released separately, under the state lock.
    fn unmap_record(
        &self,
        record: &MappingRecord,
        memory_map: MemoryMapState,
    ) -> Result<(), DmaError> {
        let target = match record.stash_address {
            Some(stash) => Some(stash),
            None => record.operation.is_write().then_some(record.crypted_address),
        };
        let copied = match target {
            Some(target) => self
                .memory
                .copy(target, record.plaintext_address, record.len)
                .map_err(DmaError::from),
            None => Ok(()),
        };
        let restored = self.restore_record(record, memory_map);
        copied.and(restored)
    }

    /// Makes the plaintext region private again and scrubs it, or for a
    /// common buffer, puts the stashed contents back.
    fn restore_record(
        &self,
        record: &MappingRecord,
        memory_map: MemoryMapState,
    ) -> Result<(), DmaError> {
        let region_len = record.pages * PAGE_SIZE64;
        if record.backing == BounceBacking::Legacy {
            self.set_visibility_for(
                record.plaintext_address,
                record.pages,
                HostVisibility::Private,
                memory_map,
            );
        }
        match record.stash_address {
            Some(stash) => self.memory.copy(record.plaintext_address, stash, region_len)?,
            None => self
                .memory
                .fill_at(record.plaintext_address, 0, region_len as usize)?,
        }
        Ok(())
    }
}
