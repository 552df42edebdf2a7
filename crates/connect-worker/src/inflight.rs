// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Counter of work items currently executing.

use std::sync::Arc;

use tokio::sync::watch;

/// Blocking add/done/wait counter shared by the active handler and shutdown.
#[derive(Debug, Clone)]
pub struct InflightCounter {
    count: Arc<watch::Sender<usize>>,
}

impl InflightCounter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    pub fn add(&self) {
        self.count.send_modify(|n| *n += 1);
    }

    pub fn done(&self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once no work item is in flight.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InflightCounter {
    fn default() -> Self {
        Self::new()
    }
}
