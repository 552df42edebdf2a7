// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle hooks exposed to embedding code.

use std::time::Duration;

use crate::state::StateTransition;
use crate::types::{ReplyStatus, WorkItem};

/// Observer of connection lifecycle and work-item events.
///
/// Every method has a no-op default, so implementors only override what they
/// need. Hooks are called synchronously from worker tasks and must not block.
pub trait ConnectionEvents: Send + Sync {
    /// A connection finished setup and is serving work.
    fn on_connected(&self, _connection_id: &str) {}

    /// A connection attempt failed; the next one starts after `delay`.
    fn on_reconnecting(&self, _attempt: u32, _delay: Duration) {}

    /// The gateway asked this connection to drain.
    fn on_draining(&self) {}

    /// The connection state machine moved.
    ///
    /// Runs while the state machine is locked; calling back into the
    /// connection's state accessors from here deadlocks.
    fn on_state_change(&self, _transition: &StateTransition) {}

    /// A work item was accepted for execution.
    fn on_request_received(&self, _item: &WorkItem) {}

    /// A work item finished and its reply was handed to the socket or buffer.
    fn on_request_completed(&self, _request_id: &str, _status: ReplyStatus, _duration: Duration) {}

    fn on_socket_open(&self, _url: &str) {}

    fn on_socket_close(&self, _reason: Option<&str>) {}

    fn on_socket_error(&self, _error: &str) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl ConnectionEvents for NoopEvents {}
