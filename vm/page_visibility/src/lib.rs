// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host visibility transitions for guest physical pages on hardware-isolated
//! VMs.
//!
//! A page is either private (encrypted, accessible only to the guest) or
//! shared (unencrypted, accessible to the host and to bus-master devices).
//! Changing the state of a page is a multi-step protocol whose ordering depends
//! on the isolation technology, so each technology gets its own
//! [`PageVisibility`] backend:
//!
//! * [`SnpVisibility`] for AMD SEV-SNP, which must rescind page validation
//!   before a page is handed to the host and revalidate it afterwards.
//! * [`TdxVisibility`] for Intel TDX, which converts pages with `MapGPA` and
//!   must accept pages again once they return to private.
//!
//! A failed transition leaves the page in an unknown state. Callers are
//! expected to treat any [`VisibilityError`] as fatal.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod snp;
mod tdx;

pub use snp::SnpPageError;
pub use snp::SnpPageOps;
pub use snp::SnpVisibility;
pub use tdx::TdxAcceptError;
pub use tdx::TdxPageOps;
pub use tdx::TdxVisibility;

use std::fmt;
use thiserror::Error;

/// The page size used for visibility transitions.
pub const PAGE_SIZE: u64 = 4096;

/// The isolation technology backing the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsolationType {
    /// No isolation, all memory is host visible.
    None,
    /// Secure nested paging (AMD SEV-SNP) - hardware based isolation.
    Snp,
    /// Trust domain extensions (Intel TDX) - hardware based isolation.
    Tdx,
}

impl IsolationType {
    /// Returns whether the isolation type is hardware-backed.
    pub fn is_hardware_isolated(&self) -> bool {
        matches!(self, Self::Snp | Self::Tdx)
    }
}

/// The host visibility of a page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HostVisibility {
    /// Encrypted, guest-only memory.
    Private,
    /// Unencrypted memory visible to the host and to devices.
    Shared,
}

/// Result of querying whether a pool of pre-shared memory may be reserved.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolReservationSupport {
    /// Reservation is supported.
    Supported,
    /// Reservation is not supported on this platform.
    Unsupported,
    /// The platform could not determine support.
    Unknown,
}

/// A non-empty, page-aligned range of guest physical memory.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PageRange {
    base_pfn: u64,
    page_count: u64,
}

impl PageRange {
    /// Returns the range of `page_count` pages starting at `base`.
    pub fn new(base: u64, page_count: u64) -> Result<Self, RangeError> {
        if base % PAGE_SIZE != 0 {
            return Err(RangeError::Unaligned(base));
        }
        if page_count == 0 {
            return Err(RangeError::Empty(base));
        }
        let base_pfn = base / PAGE_SIZE;
        base_pfn
            .checked_add(page_count)
            .and_then(|end| end.checked_mul(PAGE_SIZE))
            .ok_or(RangeError::Overflow(base, page_count))?;

        Ok(Self {
            base_pfn,
            page_count,
        })
    }

    /// The first address of the range.
    pub fn start(&self) -> u64 {
        self.base_pfn * PAGE_SIZE
    }

    /// The first address past the end of the range.
    pub fn end(&self) -> u64 {
        (self.base_pfn + self.page_count) * PAGE_SIZE
    }

    /// The length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.page_count * PAGE_SIZE
    }

    /// Always false, ranges are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The number of pages in the range.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Iterates over the page frame numbers in the range.
    pub fn pfns(&self) -> std::ops::Range<u64> {
        self.base_pfn..self.base_pfn + self.page_count
    }
}

impl fmt::Debug for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start(), self.end())
    }
}

/// Error constructing a [`PageRange`].
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum RangeError {
    #[error("address {0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("empty page range at {0:#x}")]
    Empty(u64),
    #[error("range at {0:#x} with {1:#x} pages overflows the address space")]
    Overflow(u64, u64),
}

/// The host refused a page state change.
#[derive(Debug, Error)]
#[error("host rejected {visibility:?} transition of {range} with status {status:#x}")]
pub struct HostRejectedError {
    /// The range being converted.
    pub range: PageRange,
    /// The requested visibility.
    pub visibility: HostVisibility,
    /// The status code returned by the host.
    pub status: u64,
}

/// Error changing the visibility of a range.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum VisibilityError {
    #[error("failed to rescind validation of {range}")]
    Unvalidate {
        range: PageRange,
        #[source]
        source: SnpPageError,
    },
    #[error("failed to validate {range}")]
    Validate {
        range: PageRange,
        #[source]
        source: SnpPageError,
    },
    #[error("failed to accept {range}")]
    Accept {
        range: PageRange,
        #[source]
        source: TdxAcceptError,
    },
    #[error("page state change failed")]
    HostRejected(#[source] HostRejectedError),
}

/// Changes the host visibility of guest physical pages.
pub trait PageVisibility: Send + Sync {
    /// The isolation technology implemented by this backend.
    fn isolation(&self) -> IsolationType;

    /// Makes `range` shared with the host, removing its encryption.
    ///
    /// The contents of the range are undefined afterwards.
    fn set_shared(&self, range: PageRange) -> Result<(), VisibilityError>;

    /// Makes `range` private to the guest, restoring its encryption.
    ///
    /// The contents of the range are undefined afterwards.
    fn set_private(&self, range: PageRange) -> Result<(), VisibilityError>;

    /// Reports whether a pool of permanently shared memory may be reserved.
    fn pool_reservation_support(&self) -> PoolReservationSupport {
        if self.isolation().is_hardware_isolated() {
            PoolReservationSupport::Supported
        } else {
            PoolReservationSupport::Unsupported
        }
    }
}

/// Visibility backend for VMs without hardware isolation, where all memory
/// is already host visible.
#[derive(Debug, Default)]
pub struct NoIsolation;

impl PageVisibility for NoIsolation {
    fn isolation(&self) -> IsolationType {
        IsolationType::None
    }

    fn set_shared(&self, _range: PageRange) -> Result<(), VisibilityError> {
        Ok(())
    }

    fn set_private(&self, _range: PageRange) -> Result<(), VisibilityError> {
        Ok(())
    }
}
