// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TDX page visibility transitions.

use crate::HostRejectedError;
use crate::HostVisibility;
use crate::IsolationType;
use crate::PageRange;
use crate::PageVisibility;
use crate::VisibilityError;
use thiserror::Error;

/// Error returned by `TDG.MEM.PAGE.ACCEPT`.
#[derive(Debug, Error)]
#[error("tdx module failed to accept page {gpn:#x} with status {status:#x}")]
pub struct TdxAcceptError {
    /// The first page that could not be accepted.
    pub gpn: u64,
    /// The TDX module status code.
    pub status: u64,
}

/// Architectural operations needed to change page state on a TDX guest.
pub trait TdxPageOps: Send + Sync {
    /// Issues `MapGPA` for `range`, toggling the shared GPA bit.
    fn map_gpa(&self, range: PageRange, visibility: HostVisibility)
        -> Result<(), HostRejectedError>;

    /// Accepts every page in `range` into the trust domain.
    fn accept_pages(&self, range: PageRange) -> Result<(), TdxAcceptError>;
}

/// [`PageVisibility`] backend for TDX guests.
#[derive(Debug)]
pub struct TdxVisibility<T> {
    ops: T,
}

impl<T: TdxPageOps> TdxVisibility<T> {
    /// Returns a new backend issuing page operations through `ops`.
    pub fn new(ops: T) -> Self {
        Self { ops }
    }

    /// The underlying page operations.
    pub fn ops(&self) -> &T {
        &self.ops
    }
}

impl<T: TdxPageOps> PageVisibility for TdxVisibility<T> {
    fn isolation(&self) -> IsolationType {
        IsolationType::Tdx
    }

    fn set_shared(&self, range: PageRange) -> Result<(), VisibilityError> {
        // Nothing to release first, the TDX module drops the private mapping
        // as part of the conversion.
        self.ops
            .map_gpa(range, HostVisibility::Shared)
            .map_err(VisibilityError::HostRejected)?;

        tracing::trace!(%range, "tdx range shared");
        Ok(())
    }

    fn set_private(&self, range: PageRange) -> Result<(), VisibilityError> {
        self.ops
            .map_gpa(range, HostVisibility::Private)
            .map_err(VisibilityError::HostRejected)?;

        self.ops
            .accept_pages(range)
            .map_err(|source| VisibilityError::Accept { range, source })?;

        tracing::trace!(%range, "tdx range private");
        Ok(())
    }
}
