// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::BounceBacking;
use crate::BounceDmaConfig;
use crate::BounceDmaManager;
use crate::BounceDmaPlatform;
use crate::BufferAttributes;
use crate::DeviceHandle;
use crate::ErrorKind;
use crate::ExitNotification;
use crate::ExitNotifier;
use crate::ExitPriority;
use crate::IoMmuAccess;
use crate::IoMmuOperation;
use crate::RecordStatus;
use crate::ReservedPoolMode;
use bounce_dma_mock::ALLOCATABLE_START;
use bounce_dma_mock::AllocatorCall;
use bounce_dma_mock::MockPageAllocator;
use bounce_dma_mock::MockPlatform;
use bounce_dma_mock::MockVisibility;
use dma_platform::AllocationPolicy;
use dma_platform::FOUR_GB;
use dma_platform::GuestPhysMemory;
use dma_platform::MemoryType;
use dma_platform::OutOfPages;
use dma_platform::PAGE_SIZE64;
use dma_platform::PageAllocator;
use page_visibility::HostVisibility;
use page_visibility::IsolationType;
use page_visibility::PageRange;
use page_visibility::PageVisibility;
use page_visibility::PoolReservationSupport;
use page_visibility::VisibilityError;
use reserved_pool_alloc::DEFAULT_SIZE_CLASSES;
use reserved_pool_alloc::ReservedPool;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

fn pool_pages() -> u64 {
    ReservedPool::required_pages(&DEFAULT_SIZE_CLASSES).unwrap()
}

fn manager_with(platform: &MockPlatform, config: &BounceDmaConfig) -> BounceDmaManager {
    init_tracing();
    BounceDmaManager::new(
        BounceDmaPlatform {
            memory: platform.ram.clone(),
            allocator: platform.allocator.clone(),
            visibility: platform.visibility.clone(),
        },
        config,
    )
    .unwrap()
}

fn new_manager(isolation: IsolationType) -> (MockPlatform, BounceDmaManager) {
    let platform = MockPlatform::new(isolation);
    let manager = manager_with(&platform, &BounceDmaConfig::default());
    (platform, manager)
}

fn no_pool_manager(isolation: IsolationType) -> (MockPlatform, BounceDmaManager) {
    let platform = MockPlatform::new(isolation);
    let config = BounceDmaConfig {
        reserved_pool: ReservedPoolMode::Disabled,
        ..Default::default()
    };
    let manager = manager_with(&platform, &config);
    (platform, manager)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7) ^ seed).collect()
}

#[test]
fn test_pool_reserved_and_shared() {
    let (platform, manager) = new_manager(IsolationType::Snp);
    assert_eq!(manager.pool_bitmap(), Some(0));
    assert_eq!(platform.allocator.outstanding_pages(), pool_pages());

    // Only the data areas are shared; every header page stays private.
    let data_pages: u64 = DEFAULT_SIZE_CLASSES
        .iter()
        .map(|c| c.data_pages() * c.slots as u64)
        .sum();
    assert_eq!(platform.ram.shared_page_count() as u64, data_pages);
    match platform.allocator.calls().first() {
        Some(&AllocatorCall::Allocate { base, pages, .. }) => {
            assert!(base + pages * PAGE_SIZE64 <= FOUR_GB);
        }
        call => panic!("unexpected call {call:?}"),
    }
}

#[test]
fn test_no_pool_without_isolation() {
    let (platform, manager) = new_manager(IsolationType::None);
    assert_eq!(manager.pool_bitmap(), None);
    assert_eq!(platform.allocator.call_count(), 0);

    let platform = MockPlatform::new(IsolationType::Tdx)
        .with_visibility(|v| v.with_pool_support(PoolReservationSupport::Unknown));
    let manager = manager_with(&platform, &BounceDmaConfig::default());
    assert_eq!(manager.pool_bitmap(), None);

    let config = BounceDmaConfig {
        reserved_pool: ReservedPoolMode::Enabled,
        ..Default::default()
    };
    let manager = manager_with(&platform, &config);
    assert_eq!(manager.pool_bitmap(), Some(0));
}

#[test]
fn test_pool_reservation_failure_is_not_fatal() {
    let platform = MockPlatform::new(IsolationType::Snp);
    platform.allocator.fail_allocations(true);
    let manager = manager_with(&platform, &BounceDmaConfig::default());
    assert_eq!(manager.pool_bitmap(), None);

    platform.allocator.fail_allocations(false);
    let mapping = manager
        .map(IoMmuOperation::BusMasterRead, 0x1000, 16)
        .unwrap();
    assert_eq!(
        manager.mapping(mapping.handle).unwrap().backing,
        BounceBacking::Legacy
    );
}

#[test]
fn test_invalid_layout() {
    init_tracing();
    let platform = MockPlatform::new(IsolationType::Snp);
    let result = BounceDmaManager::new(
        BounceDmaPlatform {
            memory: platform.ram.clone(),
            allocator: platform.allocator.clone(),
            visibility: platform.visibility.clone(),
        },
        &BounceDmaConfig {
            reserved_pool: ReservedPoolMode::Enabled,
            size_classes: Vec::new(),
        },
    );
    assert!(result.is_err());
}

#[test]
fn test_read_round_trip() {
    let (platform, manager) = new_manager(IsolationType::Snp);
    let payload = pattern(5000, 0x3c);
    platform.ram.write_at(0x1000, &payload).unwrap();

    let mapping = manager
        .map(IoMmuOperation::BusMasterRead, 0x1000, payload.len() as u64)
        .unwrap();
    assert_ne!(mapping.device_address, 0x1000);
    assert_eq!(manager.pool_bitmap(), Some(0x10));

    let mut seen = vec![0; payload.len()];
    platform
        .ram
        .device_read(mapping.device_address, &mut seen)
        .unwrap();
    assert_eq!(seen, payload);

    manager.unmap(mapping.handle).unwrap();
    assert_eq!(manager.pool_bitmap(), Some(0));
    assert_eq!(manager.outstanding_mappings(), 0);

    // The bounce region is scrubbed.
    platform
        .ram
        .device_read(mapping.device_address, &mut seen)
        .unwrap();
    assert!(seen.iter().all(|&b| b == 0));
}

#[test]
fn test_write_round_trip_legacy() {
    let (platform, manager) = no_pool_manager(IsolationType::Tdx);
    let payload = pattern(3 * 4096 + 17, 0x5a);

    let mapping = manager
        .map(IoMmuOperation::BusMasterWrite, 0x2000, payload.len() as u64)
        .unwrap();
    assert!(mapping.device_address >= ALLOCATABLE_START);
    assert!(mapping.device_address + 4 * PAGE_SIZE64 <= FOUR_GB);
    platform
        .ram
        .device_write(mapping.device_address, &payload)
        .unwrap();

    manager.unmap(mapping.handle).unwrap();
    let mut seen = vec![0; payload.len()];
    platform.ram.read_at(0x2000, &mut seen).unwrap();
    assert_eq!(seen, payload);

    // The bounce pages were converted back before being freed.
    let transitions = platform.visibility.transitions();
    assert_eq!(transitions.len(), 2);
    assert_eq!(transitions[0].visibility, HostVisibility::Shared);
    assert_eq!(transitions[1].visibility, HostVisibility::Private);
    assert_eq!(transitions[0].range, transitions[1].range);
    assert!(!platform.allocator.is_allocated(mapping.device_address));
    assert!(
        platform
            .ram
            .device_read(mapping.device_address, &mut [0])
            .is_err()
    );
}

#[test]
fn test_bounce_placement() {
    let (_platform, manager) = no_pool_manager(IsolationType::Snp);
    let low = manager
        .map(IoMmuOperation::BusMasterRead, 0x1000, 4096)
        .unwrap();
    assert!(low.device_address < FOUR_GB);

    let high = manager
        .map(IoMmuOperation::BusMasterRead64, 0x1000, 4096)
        .unwrap();
    assert!(high.device_address >= FOUR_GB);

    manager.unmap(low.handle).unwrap();
    manager.unmap(high.handle).unwrap();
}

#[test]
fn test_write64_scenario() {
    let (platform, manager) = new_manager(IsolationType::Snp);

    // Leave exactly one free 32K slot.
    let mut others = Vec::new();
    for i in 0..5 {
        let mapping = manager
            .map(IoMmuOperation::BusMasterWrite64, 0x10000 + i * 0x2000, 8192)
            .unwrap();
        others.push(mapping);
    }
    assert_eq!(manager.pool_bitmap(), Some(0x1f0));

    let mapping = manager
        .map(IoMmuOperation::BusMasterWrite64, 0x1000, 8192)
        .unwrap();
    assert_eq!(manager.pool_bitmap(), Some(0x3f0));
    let slot_size = DEFAULT_SIZE_CLASSES[1].slot_size();
    assert_eq!(
        mapping.device_address,
        others[0].device_address + 5 * slot_size
    );

    platform
        .ram
        .device_write(mapping.device_address, &[0xaa; 8192])
        .unwrap();
    manager.unmap(mapping.handle).unwrap();

    let mut seen = vec![0; 8192];
    platform.ram.read_at(0x1000, &mut seen).unwrap();
    assert!(seen.iter().all(|&b| b == 0xaa));
    assert_eq!(manager.pool_bitmap(), Some(0x1f0));

    // Pool slots never change visibility after initialization.
    let transitions = platform.visibility.transitions().len();
    for mapping in others {
        manager.unmap(mapping.handle).unwrap();
    }
    assert_eq!(platform.visibility.transitions().len(), transitions);
    assert_eq!(manager.pool_bitmap(), Some(0));
}

#[test]
fn test_unmap_twice() {
    let (_platform, manager) = new_manager(IsolationType::Snp);
    let before = manager.pool_bitmap().unwrap().count_ones();
    let mapping = manager
        .map(IoMmuOperation::BusMasterWrite, 0x1000, 100)
        .unwrap();
    manager.unmap(mapping.handle).unwrap();
    assert_eq!(manager.mapping_status(mapping.handle), None);
    let err = manager.unmap(mapping.handle).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(manager.pool_bitmap().unwrap().count_ones(), before);

    // A handle whose slot was reused is still rejected.
    let next = manager
        .map(IoMmuOperation::BusMasterWrite, 0x1000, 100)
        .unwrap();
    assert_ne!(next.handle, mapping.handle);
    assert!(manager.unmap(mapping.handle).is_err());
    manager.unmap(next.handle).unwrap();
}

#[test]
fn test_exhaustion_fallback() {
    let (platform, manager) = new_manager(IsolationType::Snp);
    let payload = pattern(4096, 0x11);
    platform.ram.write_at(0x1000, &payload).unwrap();

    let pooled: Vec<_> = (0..4)
        .map(|_| {
            manager
                .map(IoMmuOperation::BusMasterRead, 0x1000, 4096)
                .unwrap()
        })
        .collect();
    assert_eq!(manager.pool_bitmap(), Some(0xf));

    let calls = platform.allocator.call_count();
    let fallback = manager
        .map(IoMmuOperation::BusMasterRead, 0x1000, 4096)
        .unwrap();
    let record = manager.mapping(fallback.handle).unwrap();
    assert_eq!(record.backing, BounceBacking::Legacy);
    assert_eq!(platform.allocator.call_count(), calls + 1);
    // The next class up is never used for a single page.
    assert_eq!(manager.pool_bitmap(), Some(0xf));

    let mut seen = vec![0; 4096];
    platform
        .ram
        .device_read(fallback.device_address, &mut seen)
        .unwrap();
    assert_eq!(seen, payload);

    manager.unmap(fallback.handle).unwrap();
    for mapping in pooled {
        manager.unmap(mapping.handle).unwrap();
    }
    assert_eq!(platform.allocator.outstanding_pages(), pool_pages());
    assert_eq!(manager.pool_bitmap(), Some(0));
}

#[test]
fn test_large_transfer_bypasses_pool() {
    let (_platform, manager) = new_manager(IsolationType::Tdx);
    let mapping = manager
        .map(IoMmuOperation::BusMasterRead64, 0x1000, 3 << 20)
        .unwrap();
    assert_eq!(
        manager.mapping(mapping.handle).unwrap().backing,
        BounceBacking::Legacy
    );
    assert_eq!(manager.pool_bitmap(), Some(0));
    manager.unmap(mapping.handle).unwrap();
}

#[test]
fn test_invalid_arguments() {
    let (_platform, manager) = new_manager(IsolationType::Snp);
    let err = manager
        .map(IoMmuOperation::BusMasterRead, 0, 16)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = manager
        .map(IoMmuOperation::BusMasterRead, 0x1000, 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = manager.map_raw(6, 0x1000, 16).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let mapping = manager.map_raw(4, 0x1000, 16).unwrap();
    assert_eq!(
        manager.mapping(mapping.handle).unwrap().operation,
        IoMmuOperation::BusMasterWrite64
    );
    assert_eq!(manager.outstanding_mappings(), 1);
}

#[test]
fn test_failed_copy_releases_bounce() {
    let (platform, manager) = no_pool_manager(IsolationType::Snp);
    let err = manager
        .map(IoMmuOperation::BusMasterRead, FOUR_GB - 0x1000, 0x2000)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(platform.allocator.outstanding_pages(), 0);
    assert_eq!(platform.ram.shared_page_count(), 0);
    assert_eq!(manager.outstanding_mappings(), 0);
}

#[test]
fn test_set_attribute() {
    let (_platform, manager) = new_manager(IsolationType::Snp);
    let device = DeviceHandle(1);
    let read = manager
        .map(IoMmuOperation::BusMasterRead, 0x1000, 16)
        .unwrap();
    let write = manager
        .map(IoMmuOperation::BusMasterWrite, 0x2000, 16)
        .unwrap();

    let r = IoMmuAccess::new().with_read(true);
    let w = IoMmuAccess::new().with_write(true);
    manager.set_attribute(device, read.handle, r).unwrap();
    manager.set_attribute(device, write.handle, w).unwrap();
    manager
        .set_attribute(device, read.handle, IoMmuAccess::new())
        .unwrap();

    let err = manager.set_attribute(device, read.handle, w).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = manager.set_attribute(device, write.handle, r).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = manager
        .set_attribute(device, read.handle, IoMmuAccess::from_bits(0x4))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    manager.unmap(read.handle).unwrap();
    let err = manager.set_attribute(device, read.handle, r).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

fn read_stash(platform: &MockPlatform, host_address: u64) -> u64 {
    let mut header = [0; 16];
    platform
        .ram
        .read_at(host_address - PAGE_SIZE64, &mut header)
        .unwrap();
    assert_eq!(&header[..8], b"CMNBUFFR");
    u64::from_le_bytes(header[8..].try_into().unwrap())
}

#[test]
fn test_common_buffer_pooled() {
    let (platform, manager) = new_manager(IsolationType::Snp);
    let host = manager
        .allocate_buffer(2, MemoryType::BootServicesData, BufferAttributes::new())
        .unwrap();
    assert_eq!(manager.pool_bitmap(), Some(0x10));
    let stash = read_stash(&platform, host);

    let contents = pattern(8192, 0x77);
    platform.ram.write_at(host, &contents).unwrap();
    let mapping = manager
        .map(IoMmuOperation::BusMasterCommonBuffer, host, 8192)
        .unwrap();
    assert_eq!(mapping.device_address, host);
    let record = manager.mapping(mapping.handle).unwrap();
    assert_eq!(record.plaintext_address, record.crypted_address);

    let mut seen = vec![0; 8192];
    platform.ram.device_read(host, &mut seen).unwrap();
    assert_eq!(seen, contents);

    let update = pattern(8192, 0x99);
    platform.ram.device_write(host, &update).unwrap();
    manager.unmap(mapping.handle).unwrap();

    platform.ram.read_at(host, &mut seen).unwrap();
    assert_eq!(seen, update);
    platform.ram.read_at(stash, &mut seen).unwrap();
    assert_eq!(seen, update);

    manager.free_buffer(2, host).unwrap();
    assert_eq!(manager.pool_bitmap(), Some(0));
    assert_eq!(platform.allocator.outstanding_pages(), pool_pages());

    let err = manager.free_buffer(2, host).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[test]
fn test_common_buffer_legacy() {
    let (platform, manager) = new_manager(IsolationType::Tdx);
    let host = manager
        .allocate_buffer(3, MemoryType::RuntimeServicesData, BufferAttributes::new())
        .unwrap();
    assert_eq!(manager.pool_bitmap(), Some(0));
    assert!(host + 3 * PAGE_SIZE64 <= FOUR_GB);
    assert!(platform.allocator.is_allocated(host - PAGE_SIZE64));

    let contents = pattern(3 * 4096, 0x42);
    platform.ram.write_at(host, &contents).unwrap();
    let mut seen = vec![0; contents.len()];
    assert!(platform.ram.device_read(host, &mut seen).is_err());

    let mapping = manager
        .map(IoMmuOperation::BusMasterCommonBuffer, host, contents.len() as u64)
        .unwrap();
    assert_eq!(mapping.device_address, host);
    platform.ram.device_read(host, &mut seen).unwrap();
    assert_eq!(seen, contents);
    // The header page is never shared.
    assert!(!platform.ram.is_shared(host - PAGE_SIZE64));

    let update = pattern(contents.len(), 0x24);
    platform.ram.device_write(host, &update).unwrap();
    manager.unmap(mapping.handle).unwrap();

    assert!(platform.ram.device_read(host, &mut seen).is_err());
    platform.ram.read_at(host, &mut seen).unwrap();
    assert_eq!(seen, update);

    manager.free_buffer(3, host).unwrap();
    assert_eq!(platform.allocator.outstanding_pages(), pool_pages());
}

#[test]
fn test_common_buffer_above_4gb() {
    let (_platform, manager) = new_manager(IsolationType::Snp);
    let host = manager
        .allocate_buffer(
            1,
            MemoryType::RuntimeServicesData,
            BufferAttributes::new().with_dual_address_cycle(true),
        )
        .unwrap();
    assert!(host >= FOUR_GB);

    let err = manager
        .map(IoMmuOperation::BusMasterCommonBuffer, host, 4096)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let mapping = manager
        .map(IoMmuOperation::BusMasterCommonBuffer64, host, 4096)
        .unwrap();
    manager.unmap(mapping.handle).unwrap();
    manager.free_buffer(1, host).unwrap();
}

#[test]
fn test_common_buffer_size_checked() {
    let (platform, manager) = new_manager(IsolationType::Snp);
    let neighbor = platform
        .allocator
        .allocate_pages(AllocationPolicy::Anywhere, MemoryType::LoaderData, 1)
        .unwrap();
    platform.ram.write_at(neighbor, &[0x11; 4]).unwrap();
    let host = manager
        .allocate_buffer(1, MemoryType::RuntimeServicesData, BufferAttributes::new())
        .unwrap();
    assert_eq!(read_stash(&platform, host) + PAGE_SIZE64, neighbor);
    let outstanding = platform.allocator.outstanding_pages();
    let shared = platform.ram.shared_page_count();

    // The stash only mirrors one page, so a longer mapping must not touch
    // the allocation after it.
    let err = manager
        .map(IoMmuOperation::BusMasterCommonBuffer64, host, 8192)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let mut seen = [0; 4];
    platform.ram.read_at(neighbor, &mut seen).unwrap();
    assert_eq!(seen, [0x11; 4]);
    assert_eq!(platform.ram.shared_page_count(), shared);
    assert_eq!(manager.outstanding_mappings(), 0);

    let mapping = manager
        .map(IoMmuOperation::BusMasterCommonBuffer64, host, 4096)
        .unwrap();
    manager.unmap(mapping.handle).unwrap();

    let err = manager.free_buffer(2, host).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(platform.allocator.outstanding_pages(), outstanding);
    manager.free_buffer(1, host).unwrap();
    platform.allocator.free_pages(neighbor, 1);
    assert_eq!(platform.allocator.outstanding_pages(), pool_pages());
}

#[test]
fn test_common_buffer_validation() {
    let (platform, manager) = new_manager(IsolationType::Snp);
    let err = manager
        .allocate_buffer(1, MemoryType::LoaderData, BufferAttributes::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = manager
        .allocate_buffer(1, MemoryType::BootServicesData, BufferAttributes::from_bits(1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    let err = manager
        .allocate_buffer(0, MemoryType::BootServicesData, BufferAttributes::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let err = manager
        .map(IoMmuOperation::BusMasterCommonBuffer, 0x2000, 4096)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = manager
        .map(IoMmuOperation::BusMasterCommonBuffer64, 0x2010, 16)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = manager.free_buffer(1, 0x2000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    assert_eq!(platform.allocator.outstanding_pages(), pool_pages());
}

#[test]
fn test_shutdown_sweep() {
    let (platform, manager) = new_manager(IsolationType::Snp);
    let notifier = ExitNotifier::new();
    manager.register_exit_notifications(&notifier);

    // Another exit consumer, registered later at the same priority, still
    // sees live DMA.
    let saw_live = Arc::new(AtomicBool::new(false));
    {
        let manager = manager.clone();
        let saw_live = saw_live.clone();
        notifier.register(
            ExitPriority::Callback,
            Box::new(move |_: &dyn ExitNotification| {
                saw_live.store(!manager.is_shut_down(), Ordering::SeqCst);
            }),
        );
    }

    let mut handles = Vec::new();
    for i in 0..5 {
        let mapping = manager
            .map(IoMmuOperation::BusMasterWrite, 0x1000 + i * 0x1000, 4096)
            .unwrap();
        handles.push(mapping.handle);
    }
    let buffer = manager
        .allocate_buffer(1, MemoryType::RuntimeServicesData, BufferAttributes::new())
        .unwrap();
    let common = manager
        .map(IoMmuOperation::BusMasterCommonBuffer, buffer, 4096)
        .unwrap();
    handles.push(common.handle);
    let device_data = pattern(4096, 0x6e);
    platform.ram.device_write(buffer, &device_data).unwrap();
    assert_eq!(manager.outstanding_mappings(), 6);

    let calls = platform.allocator.call_count();
    notifier.signal_exit();

    assert!(saw_live.load(Ordering::SeqCst));
    assert!(manager.is_shut_down());
    assert_eq!(manager.outstanding_mappings(), 0);
    assert_eq!(manager.pool_bitmap(), None);
    assert_eq!(platform.allocator.call_count(), calls);
    assert_eq!(platform.ram.shared_page_count(), 0);

    // The common buffer keeps what the device wrote.
    let mut seen = vec![0; device_data.len()];
    platform.ram.read_at(buffer, &mut seen).unwrap();
    assert_eq!(seen, device_data);

    for handle in handles {
        assert_eq!(manager.mapping_status(handle), Some(RecordStatus::Abandoned));
        let err = manager.unmap(handle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }
    let err = manager
        .map(IoMmuOperation::BusMasterRead, 0x1000, 16)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    let err = manager.free_buffer(1, buffer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // Teardown runs once.
    manager.shut_down();
    assert_eq!(platform.allocator.call_count(), calls);
}

#[test]
fn test_shutdown_ignores_visibility_failures() {
    let (platform, manager) = no_pool_manager(IsolationType::Tdx);
    for _ in 0..3 {
        manager
            .map(IoMmuOperation::BusMasterRead64, 0x1000, 4096)
            .unwrap();
    }
    platform.visibility.fail_transitions(true);
    manager.shut_down();
    assert_eq!(manager.outstanding_mappings(), 0);
    assert_eq!(platform.ram.shared_page_count(), 3);
}

#[test]
#[should_panic(expected = "failed to make")]
fn test_visibility_failure_is_fatal() {
    let (platform, manager) = no_pool_manager(IsolationType::Snp);
    platform.visibility.fail_transitions(true);
    let _ = manager.map(IoMmuOperation::BusMasterRead, 0x1000, 16);
}

/// Runs the manager's exit teardown from inside a platform call, once armed.
#[derive(Default)]
struct ExitTrigger {
    manager: OnceLock<BounceDmaManager>,
    armed: AtomicBool,
}

impl ExitTrigger {
    fn fire(&self) {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.get() {
            manager.shut_down();
        }
    }
}

struct ExitingAllocator {
    allocator: Arc<MockPageAllocator>,
    trigger: Arc<ExitTrigger>,
}

impl PageAllocator for ExitingAllocator {
    fn allocate_pages(
        &self,
        policy: AllocationPolicy,
        memory_type: MemoryType,
        count: u64,
    ) -> Result<u64, OutOfPages> {
        let base = self.allocator.allocate_pages(policy, memory_type, count);
        self.trigger.fire();
        base
    }

    fn free_pages(&self, base: u64, count: u64) {
        self.allocator.free_pages(base, count);
    }
}

struct ExitingVisibility {
    visibility: Arc<MockVisibility>,
    trigger: Arc<ExitTrigger>,
}

impl PageVisibility for ExitingVisibility {
    fn isolation(&self) -> IsolationType {
        self.visibility.isolation()
    }

    fn set_shared(&self, range: PageRange) -> Result<(), VisibilityError> {
        self.visibility.set_shared(range)
    }

    fn set_private(&self, range: PageRange) -> Result<(), VisibilityError> {
        self.trigger.fire();
        self.visibility.set_private(range)
    }
}

fn exiting_manager(platform: &MockPlatform) -> (Arc<ExitTrigger>, BounceDmaManager) {
    init_tracing();
    let trigger = Arc::new(ExitTrigger::default());
    let manager = BounceDmaManager::new(
        BounceDmaPlatform {
            memory: platform.ram.clone(),
            allocator: Arc::new(ExitingAllocator {
                allocator: platform.allocator.clone(),
                trigger: trigger.clone(),
            }),
            visibility: Arc::new(ExitingVisibility {
                visibility: platform.visibility.clone(),
                trigger: trigger.clone(),
            }),
        },
        &BounceDmaConfig {
            reserved_pool: ReservedPoolMode::Disabled,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(trigger.manager.set(manager.clone()).is_ok());
    (trigger, manager)
}

#[test]
fn test_shutdown_during_map() {
    let platform = MockPlatform::new(IsolationType::Snp);
    let (trigger, manager) = exiting_manager(&platform);
    let original = pattern(4096, 0x1d);
    platform.ram.write_at(0x1000, &original).unwrap();

    trigger.armed.store(true, Ordering::SeqCst);
    let calls = platform.allocator.call_count() + 1;
    let err = manager
        .map(IoMmuOperation::BusMasterWrite, 0x1000, 4096)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(manager.is_shut_down());
    assert_eq!(manager.outstanding_mappings(), 0);
    assert_eq!(platform.allocator.call_count(), calls);
    assert_eq!(platform.ram.shared_page_count(), 0);

    // Nothing is copied back from a transfer that never started.
    let mut seen = vec![0; original.len()];
    platform.ram.read_at(0x1000, &mut seen).unwrap();
    assert_eq!(seen, original);
}

#[test]
fn test_shutdown_during_unmap() {
    let platform = MockPlatform::new(IsolationType::Tdx);
    let (trigger, manager) = exiting_manager(&platform);
    let mapping = manager
        .map(IoMmuOperation::BusMasterWrite, 0x3000, 4096)
        .unwrap();
    let payload = pattern(4096, 0x48);
    platform
        .ram
        .device_write(mapping.device_address, &payload)
        .unwrap();

    trigger.armed.store(true, Ordering::SeqCst);
    let calls = platform.allocator.call_count();
    manager.unmap(mapping.handle).unwrap();

    assert!(manager.is_shut_down());
    assert_eq!(platform.allocator.call_count(), calls);
    assert!(platform.allocator.is_allocated(mapping.device_address));
    assert_eq!(
        manager.mapping_status(mapping.handle),
        Some(RecordStatus::Abandoned)
    );
    assert_eq!(manager.outstanding_mappings(), 0);
    assert_eq!(platform.ram.shared_page_count(), 0);

    let mut seen = vec![0; payload.len()];
    platform.ram.read_at(0x3000, &mut seen).unwrap();
    assert_eq!(seen, payload);
}
