// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module implements a slot allocator over a fixed region of memory that
//! is made host visible once, up front.
//!
//! The region is divided into size classes. Each class holds a fixed number of
//! slots, and each slot is a private header followed by a shared data area.
//! Every slot owns one bit of a single 32-bit bitmap, so allocation and free
//! never require a page visibility change.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use thiserror::Error;

/// The page size used by the pool.
pub const PAGE_SIZE: u64 = 4096;

const BITMAP_BITS: u32 = u32::BITS;

/// A size class of the reserved pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SizeClass {
    /// The bits of the global bitmap owned by this class.
    pub bitmap_mask: u32,
    /// The position of the first bit owned by this class.
    pub shift: u32,
    /// The number of slots in this class.
    pub slots: u32,
    /// The size of the shared data area of each slot, in bytes.
    pub data_size: u64,
    /// The size of the private header preceding each data area, in bytes.
    pub header_size: u64,
}

impl SizeClass {
    /// Returns a new size class.
    pub const fn new(
        bitmap_mask: u32,
        shift: u32,
        slots: u32,
        data_size: u64,
        header_size: u64,
    ) -> Self {
        Self {
            bitmap_mask,
            shift,
            slots,
            data_size,
            header_size,
        }
    }

    /// The size of one slot, header included.
    pub fn slot_size(&self) -> u64 {
        self.header_size + self.data_size
    }

    /// The number of data pages in one slot.
    pub fn data_pages(&self) -> u64 {
        self.data_size / PAGE_SIZE
    }

    /// The size of the region holding every slot of this class.
    pub fn region_size(&self) -> u64 {
        self.slot_size() * self.slots as u64
    }
}

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// The default pool layout: 4 x 4K, 6 x 32K, 2 x 128K, 1 x 1M and 1 x 2M.
pub const DEFAULT_SIZE_CLASSES: [SizeClass; 5] = [
    SizeClass::new(0x000f, 0, 4, 4 * KB, 4 * KB),
    SizeClass::new(0x03f0, 4, 6, 32 * KB, 4 * KB),
    SizeClass::new(0x0c00, 10, 2, 128 * KB, 4 * KB),
    SizeClass::new(0x1000, 12, 1, MB, 4 * KB),
    SizeClass::new(0x2000, 13, 1, 2 * MB, 4 * KB),
];

/// An invalid pool layout.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum LayoutError {
    #[error("pool layout has no size classes")]
    NoClasses,
    #[error("size class {index} has no slots")]
    NoSlots { index: usize },
    #[error("size class {index} does not fit in the 32-bit bitmap")]
    TooManyBits { index: usize },
    #[error("size class {index} mask {mask:#x} does not match its shift and slot count")]
    MaskMismatch { index: usize, mask: u32 },
    #[error("size class {index} shares bitmap bits with an earlier class")]
    Overlap { index: usize },
    #[error("size class {index} sizes are not page multiples")]
    Unaligned { index: usize },
    #[error("size class {index} is not larger than the previous class")]
    NotIncreasing { index: usize },
    #[error("pool base {0:#x} is not page aligned")]
    UnalignedBase(u64),
}

/// The pool cannot satisfy an allocation.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum PoolError {
    #[error("allocation of zero pages is not supported")]
    ZeroPages,
    #[error("no size class holds {pages:#x} pages")]
    TooLarge { pages: u64 },
    #[error("size class {data_size:#x} is exhausted")]
    Exhausted { data_size: u64 },
}

/// The bitmap bits owned by an allocation.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SlotMask(u32);

impl SlotMask {
    /// Wraps raw bitmap bits. Returns `None` for an empty mask.
    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits != 0).then_some(Self(bits))
    }

    /// The raw bitmap bits.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SlotMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotMask({:#x})", self.0)
    }
}

/// A slot of the reserved pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PoolSlot {
    /// The bitmap bit owned by this slot.
    pub mask: SlotMask,
    /// The address of the private header area.
    pub header_address: u64,
    /// The address of the shared data area.
    pub data_address: u64,
    /// The number of pages in the data area.
    pub data_pages: u64,
}

impl PoolSlot {
    /// The first address past the data area.
    pub fn data_end(&self) -> u64 {
        self.data_address + self.data_pages * PAGE_SIZE
    }
}

#[derive(Debug, Clone)]
struct ClassRegion {
    class: SizeClass,
    base: u64,
}

impl ClassRegion {
    fn slot(&self, index: u32) -> PoolSlot {
        let header_address = self.base + index as u64 * self.class.slot_size();
        PoolSlot {
            mask: SlotMask(1 << (index + self.class.shift)),
            header_address,
            data_address: header_address + self.class.header_size,
            data_pages: self.class.data_pages(),
        }
    }
}

/// A bitmap-indexed allocator of pre-shared memory slots.
#[derive(Debug)]
pub struct ReservedPool {
    regions: Vec<ClassRegion>,
    base: u64,
    size_pages: u64,
    bitmap: u32,
}

impl ReservedPool {
    /// Validates `classes` and returns the number of pages needed to back a
    /// pool with that layout.
    pub fn required_pages(classes: &[SizeClass]) -> Result<u64, LayoutError> {
        validate_layout(classes)?;
        Ok(classes.iter().map(|c| c.region_size()).sum::<u64>() / PAGE_SIZE)
    }

    /// Creates a pool over the region starting at `base`, which must be
    /// [`Self::required_pages`] pages long and not used by any other entity.
    pub fn new(base: u64, classes: &[SizeClass]) -> Result<Self, LayoutError> {
        if base % PAGE_SIZE != 0 {
            return Err(LayoutError::UnalignedBase(base));
        }
        let size_pages = Self::required_pages(classes)?;

        let mut next = base;
        let regions = classes
            .iter()
            .map(|&class| {
                let region = ClassRegion { class, base: next };
                next += class.region_size();
                region
            })
            .collect();

        Ok(Self {
            regions,
            base,
            size_pages,
            bitmap: 0,
        })
    }

    /// The base address of the pool region.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The number of pages in the pool region.
    pub fn size_pages(&self) -> u64 {
        self.size_pages
    }

    /// The allocation bitmap.
    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// The number of allocated slots.
    pub fn allocated_count(&self) -> u32 {
        self.bitmap.count_ones()
    }

    /// Allocates a slot with room for `pages` pages.
    ///
    /// Only the smallest class that fits is considered. If it is exhausted,
    /// or no class fits, the caller is expected to fall back to another
    /// allocator.
    pub fn allocate(&mut self, pages: u64) -> Result<PoolSlot, PoolError> {
        if pages == 0 {
            return Err(PoolError::ZeroPages);
        }

        let mut previous_pages = 0;
        let region = self
            .regions
            .iter()
            .find(|region| {
                let capacity = region.class.data_pages();
                let fits = pages > previous_pages && pages <= capacity;
                previous_pages = capacity;
                fits
            })
            .ok_or(PoolError::TooLarge { pages })?;

        let class = &region.class;
        let used = (self.bitmap & class.bitmap_mask) >> class.shift;
        let index = (0..class.slots)
            .find(|i| used & (1 << i) == 0)
            .ok_or(PoolError::Exhausted {
                data_size: class.data_size,
            })?;

        let slot = region.slot(index);
        self.bitmap |= slot.mask.bits();

        tracing::trace!(
            pages,
            data_address = slot.data_address,
            bitmap = self.bitmap,
            "reserved slot allocated"
        );
        Ok(slot)
    }

    /// Returns the slots in `mask` to the pool.
    pub fn free(&mut self, mask: SlotMask) {
        debug_assert_eq!(
            self.bitmap & mask.bits(),
            mask.bits(),
            "freeing unallocated slots"
        );
        self.bitmap &= !mask.bits();
    }

    /// Looks up the slot owning `mask`, which must have a single bit set.
    pub fn slot(&self, mask: SlotMask) -> Option<PoolSlot> {
        if mask.bits().count_ones() != 1 {
            return None;
        }
        let bit = mask.bits().trailing_zeros();
        self.regions.iter().find_map(|region| {
            (region.class.bitmap_mask & mask.bits() != 0)
                .then(|| region.slot(bit - region.class.shift))
        })
    }

    /// Iterates over every slot in the pool, allocated or not.
    pub fn slots(&self) -> impl Iterator<Item = PoolSlot> + '_ {
        self.regions
            .iter()
            .flat_map(|region| (0..region.class.slots).map(|i| region.slot(i)))
    }

    /// Returns whether `address` lies in the data area of some slot.
    pub fn contains_data(&self, address: u64) -> bool {
        self.slots()
            .any(|slot| (slot.data_address..slot.data_end()).contains(&address))
    }
}

fn validate_layout(classes: &[SizeClass]) -> Result<(), LayoutError> {
    if classes.is_empty() {
        return Err(LayoutError::NoClasses);
    }

    let mut used = 0u32;
    let mut previous_size = 0;
    for (index, class) in classes.iter().enumerate() {
        if class.slots == 0 {
            return Err(LayoutError::NoSlots { index });
        }
        if class.shift >= BITMAP_BITS || class.slots > BITMAP_BITS - class.shift {
            return Err(LayoutError::TooManyBits { index });
        }
        let expected = (((1u64 << class.slots) - 1) << class.shift) as u32;
        if class.bitmap_mask != expected {
            return Err(LayoutError::MaskMismatch {
                index,
                mask: class.bitmap_mask,
            });
        }
        if used & class.bitmap_mask != 0 {
            return Err(LayoutError::Overlap { index });
        }
        used |= class.bitmap_mask;

        if class.data_size == 0
            || class.data_size % PAGE_SIZE != 0
            || class.header_size == 0
            || class.header_size % PAGE_SIZE != 0
        {
            return Err(LayoutError::Unaligned { index });
        }
        if class.data_size <= previous_size {
            return Err(LayoutError::NotIncreasing { index });
        }
        previous_size = class.data_size;
    }

    Ok(())
}
