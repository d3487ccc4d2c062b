// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Teardown at platform exit.
//!
//! Outstanding mappings must be torn down after every device has been
//! quiesced but before the memory map is handed over. Teardown is therefore
//! registered in two stages: a [`ExitPriority::Notify`] callback that queues
//! the real work as an [`ExitPriority::Callback`] callback, behind every
//! consumer already registered at that priority.

use crate::BounceDmaManager;
use crate::ManagerInner;
use crate::MemoryMapState;
use page_visibility::HostVisibility;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// The priority of an exit callback. Higher priorities run first.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitPriority {
    /// Runs before all [`ExitPriority::Callback`] callbacks.
    Notify,
    /// Runs after every [`ExitPriority::Notify`] callback.
    Callback,
}

impl ExitPriority {
    const ALL: [ExitPriority; 2] = [ExitPriority::Notify, ExitPriority::Callback];

    fn index(&self) -> usize {
        match self {
            ExitPriority::Notify => 0,
            ExitPriority::Callback => 1,
        }
    }
}

/// A callback run at platform exit. It may register further callbacks.
pub type ExitCallback = Box<dyn FnOnce(&dyn ExitNotification) + Send>;

/// The platform's exit notification service.
pub trait ExitNotification {
    /// Registers `callback` to run at exit. Callbacks registered while exit
    /// callbacks are running run after every callback already queued at the
    /// same priority.
    fn register(&self, priority: ExitPriority, callback: ExitCallback);
}

/// A queue-based [`ExitNotification`] implementation.
#[derive(Default)]
pub struct ExitNotifier {
    queues: Mutex<[VecDeque<ExitCallback>; 2]>,
}

impl ExitNotifier {
    /// Returns a notifier with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of callbacks waiting to run.
    pub fn pending(&self) -> usize {
        self.queues.lock().iter().map(|q| q.len()).sum()
    }

    /// Runs every registered callback in priority order, including callbacks
    /// registered along the way.
    pub fn signal_exit(&self) {
        loop {
            let next = {
                let mut queues = self.queues.lock();
                ExitPriority::ALL
                    .iter()
                    .find_map(|priority| queues[priority.index()].pop_front())
            };
            let Some(callback) = next else {
                break;
            };
            callback(self);
        }
    }
}

impl ExitNotification for ExitNotifier {
    fn register(&self, priority: ExitPriority, callback: ExitCallback) {
        self.queues.lock()[priority.index()].push_back(callback);
    }
}

impl BounceDmaManager {
    /// Arranges for outstanding mappings to be torn down at platform exit.
    pub fn register_exit_notifications(&self, notifier: &dyn ExitNotification) {
        let inner = self.inner.clone();
        notifier.register(
            ExitPriority::Notify,
            Box::new(move |notifier: &dyn ExitNotification| {
                tracing::debug!("queueing DMA teardown");
                notifier.register(
                    ExitPriority::Callback,
                    Box::new(move |_: &dyn ExitNotification| inner.shut_down()),
                );
            }),
        );
    }

    /// Freezes the memory map and tears down every outstanding mapping.
    ///
    /// Bounce regions are not returned to their allocators, and the shared
    /// pool is made private and abandoned. Failures are logged and ignored.
    pub fn shut_down(&self) {
        self.inner.shut_down();
    }
}

impl ManagerInner {
    fn shut_down(&self) {
        let mut state = self.state.lock();
        if state.memory_map == MemoryMapState::Frozen {
            return;
        }
        state.memory_map = MemoryMapState::Frozen;

        let mut swept = 0;
        let mut failed = 0;
        state.tracker.sweep(|tracker, handle| {
            let Some(record) = tracker.begin_release(handle).cloned() else {
                return;
            };
            if let Err(err) = self.unmap_record(&record, MemoryMapState::Frozen) {
                tracing::warn!(
                    ?handle,
                    error = &err as &dyn std::error::Error,
                    "ignoring unmap failure during teardown"
                );
                failed += 1;
            }
            tracker.abandon(handle);
            swept += 1;
        });
        if !state.tracker.is_empty() {
            // Unmaps that began before the freeze finish on their own.
            tracing::debug!(
                in_flight = state.tracker.len(),
                "unmaps still in progress at teardown"
            );
        }

        if let Some(pool) = state.pool.take() {
            for slot in pool.slots() {
                self.set_visibility_for(
                    slot.data_address,
                    slot.data_pages,
                    HostVisibility::Private,
                    MemoryMapState::Frozen,
                );
            }
            tracing::info!(
                base = pool.base(),
                pages = pool.size_pages(),
                "shared pool made private and abandoned"
            );
        }

        tracing::info!(swept, failed, "DMA teardown complete");
    }
}
