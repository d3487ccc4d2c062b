// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sparse simulated guest RAM with per-page host visibility.

use dma_platform::GuestMemoryError;
use dma_platform::GuestPhysMemory;
use dma_platform::PAGE_SIZE;
use dma_platform::PAGE_SIZE64;
use page_visibility::HostVisibility;
use page_visibility::PageRange;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::ops::Range;
use thiserror::Error;

/// The byte pattern left in a page after its visibility changes.
const SCRAMBLED: u8 = 0xa5;

/// A device tried to reach memory it cannot see.
#[derive(Debug, Error)]
#[error("device access to private page {gpn:#x}")]
pub struct DeviceAccessError {
    /// The first inaccessible page.
    pub gpn: u64,
}

#[derive(Default)]
struct RamInner {
    pages: HashMap<u64, Box<[u8]>>,
    shared: HashSet<u64>,
}

impl RamInner {
    fn page_mut(&mut self, gpn: u64) -> &mut [u8] {
        self.pages
            .entry(gpn)
            .or_insert_with(|| vec![0; PAGE_SIZE].into_boxed_slice())
    }

    fn read(&self, gpa: u64, data: &mut [u8]) {
        let mut offset = 0;
        while offset < data.len() {
            let addr = gpa + offset as u64;
            let page_offset = (addr % PAGE_SIZE64) as usize;
            let n = (PAGE_SIZE - page_offset).min(data.len() - offset);
            match self.pages.get(&(addr / PAGE_SIZE64)) {
                Some(page) => {
                    data[offset..offset + n].copy_from_slice(&page[page_offset..page_offset + n])
                }
                None => data[offset..offset + n].fill(0),
            }
            offset += n;
        }
    }

    fn write(&mut self, gpa: u64, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            let addr = gpa + offset as u64;
            let page_offset = (addr % PAGE_SIZE64) as usize;
            let n = (PAGE_SIZE - page_offset).min(data.len() - offset);
            self.page_mut(addr / PAGE_SIZE64)[page_offset..page_offset + n]
                .copy_from_slice(&data[offset..offset + n]);
            offset += n;
        }
    }
}

/// Sparse guest RAM covering a set of address ranges.
///
/// The CPU may access any page through [`GuestPhysMemory`]. Devices may only
/// access shared pages, through [`Self::device_read`] and
/// [`Self::device_write`].
pub struct SimulatedRam {
    ranges: Vec<Range<u64>>,
    inner: Mutex<RamInner>,
}

impl SimulatedRam {
    /// Creates zeroed, private RAM covering `ranges`.
    pub fn new(ranges: &[Range<u64>]) -> Self {
        Self {
            ranges: ranges.to_vec(),
            inner: Mutex::new(RamInner::default()),
        }
    }

    /// Returns whether `gpa..gpa + len` is entirely RAM.
    pub fn contains(&self, gpa: u64, len: u64) -> bool {
        let Some(end) = gpa.checked_add(len) else {
            return false;
        };
        self.ranges.iter().any(|r| r.start <= gpa && end <= r.end)
    }

    /// Returns whether the page containing `gpa` is shared.
    pub fn is_shared(&self, gpa: u64) -> bool {
        self.inner.lock().shared.contains(&(gpa / PAGE_SIZE64))
    }

    /// The number of shared pages.
    pub fn shared_page_count(&self) -> usize {
        self.inner.lock().shared.len()
    }

    pub(crate) fn set_visibility(&self, range: PageRange, visibility: HostVisibility) {
        let mut inner = self.inner.lock();
        for gpn in range.pfns() {
            match visibility {
                HostVisibility::Shared => inner.shared.insert(gpn),
                HostVisibility::Private => inner.shared.remove(&gpn),
            };
            inner.page_mut(gpn).fill(SCRAMBLED);
        }
    }

    fn check_access(&self, gpa: u64, len: usize) -> Result<(), GuestMemoryError> {
        if !self.contains(gpa, len as u64) {
            return Err(GuestMemoryError {
                gpa,
                len: len as u64,
            });
        }
        Ok(())
    }

    fn check_device_access(
        &self,
        inner: &RamInner,
        gpa: u64,
        len: usize,
    ) -> Result<(), DeviceAccessError> {
        if len == 0 {
            return Ok(());
        }
        let first = gpa / PAGE_SIZE64;
        let last = (gpa + len as u64 - 1) / PAGE_SIZE64;
        match (first..=last).find(|gpn| !inner.shared.contains(gpn)) {
            Some(gpn) => Err(DeviceAccessError { gpn }),
            None => Ok(()),
        }
    }

    /// Reads memory as a bus-master device would.
    pub fn device_read(&self, gpa: u64, data: &mut [u8]) -> Result<(), DeviceAccessError> {
        let inner = self.inner.lock();
        self.check_device_access(&inner, gpa, data.len())?;
        inner.read(gpa, data);
        Ok(())
    }

    /// Writes memory as a bus-master device would.
    pub fn device_write(&self, gpa: u64, data: &[u8]) -> Result<(), DeviceAccessError> {
        let mut inner = self.inner.lock();
        self.check_device_access(&inner, gpa, data.len())?;
        inner.write(gpa, data);
        Ok(())
    }
}

impl GuestPhysMemory for SimulatedRam {
    fn read_at(&self, gpa: u64, data: &mut [u8]) -> Result<(), GuestMemoryError> {
        self.check_access(gpa, data.len())?;
        self.inner.lock().read(gpa, data);
        Ok(())
    }

    fn write_at(&self, gpa: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        self.check_access(gpa, data.len())?;
        self.inner.lock().write(gpa, data);
        Ok(())
    }
}
