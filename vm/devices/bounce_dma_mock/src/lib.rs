// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Simulated platform services for testing the bounce-buffer DMA layer.
//!
//! The simulation models the properties that matter for confidential DMA:
//! page contents are lost on every visibility change (the old ciphertext or
//! plaintext is meaningless in the new view), devices can only reach shared
//! pages, and every allocator and visibility call is recorded.
//!
//! Everything in this crate is meant for TESTING PURPOSES ONLY and should only
//! be added as a dev-dependency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod allocator;
mod ram;

pub use allocator::AllocatorCall;
pub use allocator::MockPageAllocator;
pub use ram::DeviceAccessError;
pub use ram::SimulatedRam;

use dma_platform::FOUR_GB;
use page_visibility::HostRejectedError;
use page_visibility::HostVisibility;
use page_visibility::IsolationType;
use page_visibility::PageRange;
use page_visibility::PageVisibility;
use page_visibility::PoolReservationSupport;
use page_visibility::VisibilityError;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// RAM below 4GB. The first megabyte is never handed out by the allocator
/// and is free for tests to use as driver-owned buffers.
pub const LOW_RAM: Range<u64> = 0..0x1000_0000;
/// RAM above 4GB.
pub const HIGH_RAM: Range<u64> = FOUR_GB..FOUR_GB + 0x400_0000;
/// The first address the allocator may hand out.
pub const ALLOCATABLE_START: u64 = 0x10_0000;

/// A recorded visibility transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The new visibility.
    pub visibility: HostVisibility,
    /// The converted range.
    pub range: PageRange,
}

/// A [`PageVisibility`] backend that applies transitions to a
/// [`SimulatedRam`].
///
/// Transitions of pages that are already in the requested state are rejected,
/// like a hypervisor rejecting a redundant page state change.
pub struct MockVisibility {
    ram: Arc<SimulatedRam>,
    isolation: IsolationType,
    support: PoolReservationSupport,
    transitions: Mutex<Vec<Transition>>,
    fail: AtomicBool,
}

impl MockVisibility {
    /// Returns a new backend for `ram`.
    pub fn new(ram: Arc<SimulatedRam>, isolation: IsolationType) -> Self {
        let support = if isolation.is_hardware_isolated() {
            PoolReservationSupport::Supported
        } else {
            PoolReservationSupport::Unsupported
        };
        Self {
            ram,
            isolation,
            support,
            transitions: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Overrides the reported pool reservation support.
    pub fn with_pool_support(mut self, support: PoolReservationSupport) -> Self {
        self.support = support;
        self
    }

    /// Makes every subsequent transition fail.
    pub fn fail_transitions(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Returns every transition applied so far.
    pub fn transitions(&self) -> Vec<Transition> {
        self.transitions.lock().clone()
    }

    fn transition(
        &self,
        range: PageRange,
        visibility: HostVisibility,
    ) -> Result<(), VisibilityError> {
        let reject = |status| {
            VisibilityError::HostRejected(HostRejectedError {
                range,
                visibility,
                status,
            })
        };
        if self.fail.load(Ordering::SeqCst) {
            return Err(reject(0xdead));
        }
        let want_shared = visibility == HostVisibility::Shared;
        if range
            .pfns()
            .any(|pfn| self.ram.is_shared(pfn * dma_platform::PAGE_SIZE64) == want_shared)
        {
            return Err(reject(1));
        }
        if !self.ram.contains(range.start(), range.len()) {
            return Err(reject(2));
        }

        self.ram.set_visibility(range, visibility);
        self.transitions.lock().push(Transition { visibility, range });
        tracing::trace!(%range, ?visibility, "mock transition");
        Ok(())
    }
}

impl PageVisibility for MockVisibility {
    fn isolation(&self) -> IsolationType {
        self.isolation
    }

    fn set_shared(&self, range: PageRange) -> Result<(), VisibilityError> {
        self.transition(range, HostVisibility::Shared)
    }

    fn set_private(&self, range: PageRange) -> Result<(), VisibilityError> {
        self.transition(range, HostVisibility::Private)
    }

    fn pool_reservation_support(&self) -> PoolReservationSupport {
        self.support
    }
}

/// A complete simulated platform.
pub struct MockPlatform {
    /// Guest RAM.
    pub ram: Arc<SimulatedRam>,
    /// The page allocator.
    pub allocator: Arc<MockPageAllocator>,
    /// The visibility backend.
    pub visibility: Arc<MockVisibility>,
}

impl MockPlatform {
    /// Builds a platform with [`LOW_RAM`] and [`HIGH_RAM`] for the given
    /// isolation type.
    pub fn new(isolation: IsolationType) -> Self {
        let ram = Arc::new(SimulatedRam::new(&[LOW_RAM, HIGH_RAM]));
        let allocator = Arc::new(MockPageAllocator::new(&[
            ALLOCATABLE_START..LOW_RAM.end,
            HIGH_RAM,
        ]));
        let visibility = Arc::new(MockVisibility::new(ram.clone(), isolation));
        Self {
            ram,
            allocator,
            visibility,
        }
    }

    /// Replaces the visibility backend, e.g. to change reported support.
    pub fn with_visibility(mut self, f: impl FnOnce(MockVisibility) -> MockVisibility) -> Self {
        self.visibility = Arc::new(f(MockVisibility::new(
            self.ram.clone(),
            self.visibility.isolation,
        )));
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dma_platform::GuestPhysMemory;

    #[test]
    fn test_transition_scrambles_and_gates_device() {
        let platform = MockPlatform::new(IsolationType::Snp);
        let range = PageRange::new(0x20000, 2).unwrap();
        platform.ram.write_at(0x20000, &[1, 2, 3, 4]).unwrap();

        let mut data = [0; 4];
        assert!(platform.ram.device_read(0x20000, &mut data).is_err());

        platform.visibility.set_shared(range).unwrap();
        platform.ram.device_read(0x20000, &mut data).unwrap();
        assert_ne!(data, [1, 2, 3, 4]);

        platform.ram.device_write(0x21000, &[9; 8]).unwrap();
        platform.ram.read_at(0x21000, &mut data).unwrap();
        assert_eq!(data, [9; 4]);

        // Redundant transitions are rejected.
        assert!(platform.visibility.set_shared(range).is_err());
        platform.visibility.set_private(range).unwrap();
        assert!(platform.ram.device_write(0x20000, &[0]).is_err());
        assert_eq!(platform.visibility.transitions().len(), 2);
    }

    #[test]
    fn test_injected_failure() {
        let platform = MockPlatform::new(IsolationType::Tdx);
        platform.visibility.fail_transitions(true);
        let range = PageRange::new(0x20000, 1).unwrap();
        assert!(platform.visibility.set_shared(range).is_err());
        assert!(!platform.ram.is_shared(0x20000));
    }
}
