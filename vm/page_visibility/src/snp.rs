// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SEV-SNP page visibility transitions.

use crate::HostRejectedError;
use crate::HostVisibility;
use crate::IsolationType;
use crate::PageRange;
use crate::PageVisibility;
use crate::VisibilityError;
use thiserror::Error;

/// Error returned by `PVALIDATE`.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum SnpPageError {
    #[error("pvalidate failed on page {gpn:#x} with code {code:#x}")]
    Failed { gpn: u64, code: u32 },
    #[error("pvalidate left the validated state of page {gpn:#x} unchanged")]
    Unchanged { gpn: u64 },
}

/// Architectural operations needed to change page state on an SNP guest.
pub trait SnpPageOps: Send + Sync {
    /// Validates (`validate == true`) or rescinds validation of every page in
    /// `range` in the RMP.
    fn pvalidate(&self, range: PageRange, validate: bool) -> Result<(), SnpPageError>;

    /// Asks the hypervisor to move `range` to the given state via the GHCB
    /// page state change protocol.
    fn page_state_change(
        &self,
        range: PageRange,
        visibility: HostVisibility,
    ) -> Result<(), HostRejectedError>;
}

/// [`PageVisibility`] backend for SEV-SNP guests.
#[derive(Debug)]
pub struct SnpVisibility<T> {
    ops: T,
}

impl<T: SnpPageOps> SnpVisibility<T> {
    /// Returns a new backend issuing page operations through `ops`.
    pub fn new(ops: T) -> Self {
        Self { ops }
    }

    /// The underlying page operations.
    pub fn ops(&self) -> &T {
        &self.ops
    }
}

impl<T: SnpPageOps> PageVisibility for SnpVisibility<T> {
    fn isolation(&self) -> IsolationType {
        IsolationType::Snp
    }

    fn set_shared(&self, range: PageRange) -> Result<(), VisibilityError> {
        // Validation must be rescinded before the hypervisor owns the page.
        self.ops
            .pvalidate(range, false)
            .map_err(|source| VisibilityError::Unvalidate { range, source })?;

        self.ops
            .page_state_change(range, HostVisibility::Shared)
            .map_err(VisibilityError::HostRejected)?;

        tracing::trace!(%range, "snp range shared");
        Ok(())
    }

    fn set_private(&self, range: PageRange) -> Result<(), VisibilityError> {
        self.ops
            .page_state_change(range, HostVisibility::Private)
            .map_err(VisibilityError::HostRejected)?;

        self.ops
            .pvalidate(range, true)
            .map_err(|source| VisibilityError::Validate { range, source })?;

        tracing::trace!(%range, "snp range private");
        Ok(())
    }
}
