// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::IoMmuOperation;
use crate::tracker::MappingHandle;
use dma_platform::GuestMemoryError;
use dma_platform::MemoryType;
use dma_platform::OutOfPages;
use thiserror::Error;

/// The class of a [`DmaError`], as reported to device drivers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A malformed argument or an unknown handle.
    InvalidParameter,
    /// A request that cannot be satisfied in the current configuration.
    Unsupported,
    /// Both the reserved pool and the page allocator are exhausted.
    OutOfResources,
}

/// Error returned by the bounce-buffer DMA entry points.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum DmaError {
    #[error("host address is null")]
    NullAddress,
    #[error("transfer length is zero")]
    ZeroLength,
    #[error("buffer page count is zero")]
    ZeroPages,
    #[error("unknown DMA operation {0}")]
    InvalidOperation(u32),
    #[error("unknown or released mapping {0:?}")]
    UnknownMapping(MappingHandle),
    #[error("access {access:#x} does not match operation {operation:?}")]
    AccessMismatch {
        operation: IoMmuOperation,
        access: u64,
    },
    #[error("unsupported access bits {0:#x}")]
    UnsupportedAccess(u64),
    #[error("buffer {address:#x} with length {len:#x} is not addressable by a 32-bit device")]
    AboveFourGb { address: u64, len: u64 },
    #[error("common buffer address {0:#x} is not page aligned")]
    UnalignedBuffer(u64),
    #[error("{0:#x} was not allocated as a common buffer")]
    NotCommonBuffer(u64),
    #[error(
        "{pages:#x} pages requested for common buffer {address:#x} of {allocated:#x} pages"
    )]
    BufferSizeMismatch {
        address: u64,
        pages: u64,
        allocated: u64,
    },
    #[error("common buffers cannot use memory type {0:?}")]
    InvalidMemoryType(MemoryType),
    #[error("unsupported buffer attributes {0:#x}")]
    UnsupportedAttributes(u64),
    #[error("the memory map is frozen")]
    MemoryMapFrozen,
    #[error("failed to allocate a bounce buffer")]
    OutOfResources(#[source] OutOfPages),
    #[error("guest memory access failed")]
    Memory(#[source] GuestMemoryError),
}

impl DmaError {
    /// Returns the class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DmaError::NullAddress
            | DmaError::ZeroLength
            | DmaError::ZeroPages
            | DmaError::InvalidOperation(_)
            | DmaError::UnknownMapping(_)
            | DmaError::AccessMismatch { .. }
            | DmaError::UnalignedBuffer(_)
            | DmaError::NotCommonBuffer(_)
            | DmaError::BufferSizeMismatch { .. }
            | DmaError::InvalidMemoryType(_)
            | DmaError::Memory(_) => ErrorKind::InvalidParameter,
            DmaError::UnsupportedAccess(_)
            | DmaError::AboveFourGb { .. }
            | DmaError::UnsupportedAttributes(_)
            | DmaError::MemoryMapFrozen => ErrorKind::Unsupported,
            DmaError::OutOfResources(_) => ErrorKind::OutOfResources,
        }
    }
}

impl From<OutOfPages> for DmaError {
    fn from(err: OutOfPages) -> Self {
        DmaError::OutOfResources(err)
    }
}

impl From<GuestMemoryError> for DmaError {
    fn from(err: GuestMemoryError) -> Self {
        DmaError::Memory(err)
    }
}
