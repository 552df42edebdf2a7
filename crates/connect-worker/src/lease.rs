// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease table: current lease per in-flight request, plus its extension timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::AbortHandle;

#[derive(Debug)]
struct LeaseEntry {
    lease_id: String,
    extender: Option<AbortHandle>,
    generation: u64,
}

/// `request_id -> lease_id` mapping, mutated only by the active handler.
///
/// Each entry owns the abort handle of the item's lease-extension ticker so
/// removing the entry also stops the ticker.
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    inner: Arc<Mutex<HashMap<String, LeaseEntry>>>,
    generations: Arc<AtomicU64>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LeaseEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the lease for a newly dispatched request.
    ///
    /// A redelivered request replaces the earlier entry. The returned
    /// generation identifies this entry for [`LeaseTable::remove_generation`].
    pub fn insert(&self, request_id: &str, lease_id: &str, extender: Option<AbortHandle>) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let previous = self.lock().insert(
            request_id.to_string(),
            LeaseEntry {
                lease_id: lease_id.to_string(),
                extender,
                generation,
            },
        );
        if let Some(LeaseEntry {
            extender: Some(handle),
            ..
        }) = previous
        {
            handle.abort();
        }
        generation
    }

    /// Current lease id for a request, if it still holds one.
    pub fn lease_id(&self, request_id: &str) -> Option<String> {
        self.lock().get(request_id).map(|e| e.lease_id.clone())
    }

    /// Replace the lease id after a successful extension. Returns `false`
    /// if the request is no longer tracked.
    pub fn update(&self, request_id: &str, lease_id: &str) -> bool {
        match self.lock().get_mut(request_id) {
            Some(entry) => {
                entry.lease_id = lease_id.to_string();
                true
            }
            None => false,
        }
    }

    /// Drop the entry and stop its extension ticker.
    pub fn remove(&self, request_id: &str) -> bool {
        let removed = self.lock().remove(request_id);
        match removed {
            Some(entry) => {
                if let Some(handle) = entry.extender {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Like [`LeaseTable::remove`], but only if the entry is still the one
    /// inserted with `generation`.
    pub fn remove_generation(&self, request_id: &str, generation: u64) -> bool {
        let removed = {
            let mut entries = self.lock();
            match entries.get(request_id) {
                Some(entry) if entry.generation == generation => entries.remove(request_id),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                if let Some(handle) = entry.extender {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry and stop all extension tickers.
    pub fn clear(&self) {
        let entries: Vec<LeaseEntry> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            if let Some(handle) = entry.extender {
                handle.abort();
            }
        }
    }
}
