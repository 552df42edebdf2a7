// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reply buffer.
//!
//! The socket is not durable: a reply can be lost if the socket drops between
//! send and acknowledgement. Every reply sent on the socket is tracked as
//! *pending* until the gateway acks it; replies that could not be sent, or
//! whose ack deadline passed, are *buffered*. [`ReplyBuffer::flush`] delivers
//! both sets over HTTP.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use connect_protocol::proto::SdkResponse;
use tokio::task::AbortHandle;
use tracing::{debug, instrument, warn};

use crate::api::ApiClient;
use crate::backoff::Backoff;
use crate::error::{ConnectError, Result};

/// Rounds of HTTP delivery attempted by a single flush.
pub const MAX_FLUSH_ATTEMPTS: u32 = 5;

struct PendingReply {
    reply: SdkResponse,
    expiry: AbortHandle,
}

#[derive(Default)]
struct BufferState {
    buffered: HashMap<String, SdkResponse>,
    pending: HashMap<String, PendingReply>,
}

/// Replies not yet acknowledged by the gateway.
#[derive(Clone)]
pub struct ReplyBuffer {
    state: Arc<Mutex<BufferState>>,
    flush_lock: Arc<tokio::sync::Mutex<()>>,
    api: ApiClient,
    backoff: Backoff,
}

impl ReplyBuffer {
    pub fn new(api: ApiClient) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState::default())),
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
            api,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(5)),
        }
    }

    /// Delay schedule between flush rounds.
    pub fn with_flush_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a reply that could not be delivered on the socket.
    pub fn append(&self, reply: SdkResponse) {
        debug!(request_id = %reply.request_id, "Buffering reply");
        let mut state = self.lock();
        if let Some(previous) = state.pending.remove(&reply.request_id) {
            previous.expiry.abort();
        }
        state.buffered.insert(reply.request_id.clone(), reply);
    }

    /// Track a reply sent on the socket until it is acked.
    ///
    /// If no ack arrives within `deadline` the reply moves to the buffered set.
    /// Must be called from within a tokio runtime.
    pub fn add_pending(&self, reply: SdkResponse, deadline: Duration) {
        let request_id = reply.request_id.clone();
        let shared = self.state.clone();
        let expiry_id = request_id.clone();

        // Hold the lock across the spawn so the expiry task cannot run before
        // the entry exists.
        let mut state = self.lock();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = state.pending.remove(&expiry_id) {
                debug!(request_id = %expiry_id, "Reply ack deadline passed, buffering");
                state.buffered.insert(expiry_id, entry.reply);
            }
        })
        .abort_handle();

        state.buffered.remove(&request_id);
        let previous = state
            .pending
            .insert(request_id, PendingReply { reply, expiry });
        if let Some(previous) = previous {
            previous.expiry.abort();
        }
    }

    /// The gateway acked a reply; stop tracking it.
    pub fn acknowledge_pending(&self, request_id: &str) -> bool {
        let mut state = self.lock();
        let pending = state.pending.remove(request_id);
        let buffered = state.buffered.remove(request_id);
        if let Some(entry) = &pending {
            entry.expiry.abort();
        }
        pending.is_some() || buffered.is_some()
    }

    pub fn buffered_len(&self) -> usize {
        self.lock().buffered.len()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.buffered.is_empty() && state.pending.is_empty()
    }

    fn snapshot(&self) -> Vec<SdkResponse> {
        let state = self.lock();
        state
            .buffered
            .values()
            .cloned()
            .chain(state.pending.values().map(|p| p.reply.clone()))
            .collect()
    }

    fn remove(&self, request_id: &str) {
        let mut state = self.lock();
        state.buffered.remove(request_id);
        if let Some(entry) = state.pending.remove(request_id) {
            entry.expiry.abort();
        }
    }

    /// Deliver every unacknowledged reply over HTTP with `credential`.
    ///
    /// An authentication failure aborts immediately so the caller can retry
    /// with another credential. Other failures are retried for
    /// [`MAX_FLUSH_ATTEMPTS`] rounds.
    #[instrument(skip(self, credential))]
    pub async fn flush(&self, credential: &str) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let mut attempt = 0;
        loop {
            let batch = self.snapshot();
            if batch.is_empty() {
                return Ok(());
            }
            debug!(count = batch.len(), attempt, "Flushing replies");

            for reply in batch {
                match self.api.flush(credential, &reply).await {
                    Ok(()) => self.remove(&reply.request_id),
                    Err(e) if e.is_auth() => return Err(e),
                    Err(e) => {
                        warn!(request_id = %reply.request_id, error = %e, "Failed to flush reply");
                    }
                }
            }

            let remaining = self.buffered_len() + self.pending_len();
            if remaining == 0 {
                return Ok(());
            }

            attempt += 1;
            if attempt >= MAX_FLUSH_ATTEMPTS {
                return Err(ConnectError::FlushIncomplete(remaining));
            }
            tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
        }
    }
}

impl fmt::Debug for ReplyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyBuffer")
            .field("buffered", &self.buffered_len())
            .field("pending", &self.pending_len())
            .field("api", &self.api.base_url())
            .finish()
    }
}
