// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steady-state message handling: work dispatch, acks, leases, heartbeats.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use connect_protocol::proto::{
    GatewayExecutorRequestData, SdkResponse, WorkerReplyAckData, WorkerRequestExtendLeaseAckData,
    WorkerRequestExtendLeaseData,
};
use connect_protocol::{Envelope, GatewayMessageType};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::buffer::ReplyBuffer;
use crate::events::{ConnectionEvents, NoopEvents};
use crate::executor::{HandlerRegistry, RequestHandler};
use crate::handler::setup::DEFAULT_EXTEND_LEASE_INTERVAL;
use crate::inflight::InflightCounter;
use crate::lease::LeaseTable;
use crate::socket::{EnvelopeSink, HeartbeatHandle};
use crate::types::{ExecutionReply, WorkItem};

/// Callback invoked when the gateway asks the connection to drain.
pub type DrainCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handles envelopes of an active connection.
///
/// Cloning is cheap; clones share the lease table, in-flight counter and
/// reply buffer.
#[derive(Clone)]
pub struct ActiveHandler {
    sink: Arc<dyn EnvelopeSink>,
    registry: HandlerRegistry,
    leases: LeaseTable,
    inflight: InflightCounter,
    buffer: ReplyBuffer,
    heartbeat: HeartbeatHandle,
    events: Arc<dyn ConnectionEvents>,
    on_drain: DrainCallback,
    extend_lease_interval: Duration,
    reply_ack_timeout: Duration,
    shutdown: CancellationToken,
}

impl ActiveHandler {
    pub fn new(
        sink: Arc<dyn EnvelopeSink>,
        registry: HandlerRegistry,
        leases: LeaseTable,
        inflight: InflightCounter,
        buffer: ReplyBuffer,
    ) -> Self {
        Self {
            sink,
            registry,
            leases,
            inflight,
            buffer,
            heartbeat: HeartbeatHandle::default(),
            events: Arc::new(NoopEvents),
            on_drain: Arc::new(|| async {}.boxed()),
            extend_lease_interval: DEFAULT_EXTEND_LEASE_INTERVAL,
            reply_ack_timeout: Duration::from_secs(5),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatHandle) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn ConnectionEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_drain_callback(mut self, on_drain: DrainCallback) -> Self {
        self.on_drain = on_drain;
        self
    }

    pub fn with_extend_lease_interval(mut self, interval: Duration) -> Self {
        self.extend_lease_interval = interval;
        self
    }

    pub fn with_reply_ack_timeout(mut self, timeout: Duration) -> Self {
        self.reply_ack_timeout = timeout;
        self
    }

    /// Once this token is cancelled new work items are dropped unacknowledged.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Handle one envelope received on an active connection.
    pub async fn handle(&self, envelope: Envelope) {
        match envelope.kind {
            GatewayMessageType::GatewayExecutorRequest => self.dispatch(&envelope),
            GatewayMessageType::GatewayHeartbeat => self.heartbeat.reset(),
            GatewayMessageType::WorkerReplyAck => {
                match envelope.decode::<WorkerReplyAckData>() {
                    Ok(ack) => {
                        if !self.buffer.acknowledge_pending(&ack.request_id) {
                            debug!(request_id = %ack.request_id, "Reply ack for untracked request");
                        }
                    }
                    Err(e) => warn!(error = %e, "Invalid reply ack payload"),
                }
            }
            GatewayMessageType::WorkerRequestExtendLeaseAck => self.extend_lease_ack(&envelope),
            GatewayMessageType::GatewayClosing => {
                debug!("Gateway requested drain");
                (self.on_drain)().await;
            }
            other => {
                debug!(kind = other.as_str_name(), "Ignoring message on active connection");
            }
        }
    }

    fn send<M: prost::Message>(&self, kind: GatewayMessageType, msg: &M) -> crate::Result<()> {
        self.sink.send_envelope(Envelope::new(kind, msg)?)
    }

    fn dispatch(&self, envelope: &Envelope) {
        let request = match envelope.decode::<GatewayExecutorRequestData>() {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Invalid executor request payload");
                return;
            }
        };
        let item = WorkItem::from(request);

        if self.shutdown.is_cancelled() {
            debug!(request_id = %item.request_id, "Shutting down, not accepting work");
            return;
        }

        let Some(handler) = self.registry.get(&item.app_name) else {
            debug!(
                request_id = %item.request_id,
                app_name = %item.app_name,
                "No handler registered for app, dropping request"
            );
            return;
        };

        if let Err(e) = self.send(GatewayMessageType::WorkerRequestAck, &item.ack()) {
            warn!(request_id = %item.request_id, error = %e, "Failed to ack request");
        }
        self.events.on_request_received(&item);

        self.inflight.add();
        let extender = self.spawn_lease_extender(&item);
        let lease = self
            .leases
            .insert(&item.request_id, &item.lease_id, Some(extender));

        let this = self.clone();
        tokio::spawn(async move { this.execute(item, handler, lease).await });
    }

    /// Periodically extend the item's lease while it is in the lease table.
    fn spawn_lease_extender(&self, item: &WorkItem) -> AbortHandle {
        let request_id = item.request_id.clone();
        let template = item.extend_lease(String::new());
        let leases = self.leases.clone();
        let sink = self.sink.clone();
        let interval = self.extend_lease_interval;

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(lease_id) = leases.lease_id(&request_id) else {
                    break;
                };
                let msg = WorkerRequestExtendLeaseData {
                    lease_id,
                    ..template.clone()
                };
                let sent = Envelope::new(GatewayMessageType::WorkerRequestExtendLease, &msg)
                    .map_err(crate::ConnectError::from)
                    .and_then(|envelope| sink.send_envelope(envelope));
                if let Err(e) = sent {
                    debug!(request_id = %request_id, error = %e, "Failed to extend lease");
                }
            }
        })
        .abort_handle()
    }

    async fn execute(self, item: WorkItem, handler: Arc<dyn RequestHandler>, lease: u64) {
        let _guard = WorkGuard {
            request_id: item.request_id.clone(),
            lease,
            leases: self.leases.clone(),
            inflight: self.inflight.clone(),
        };
        let started = Instant::now();

        let outcome = AssertUnwindSafe(handler.handle(item.clone()))
            .catch_unwind()
            .await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(request_id = %item.request_id, error = %e, "Execution handler failed");
                ExecutionReply::error(error_body(&format!("{:#}", e)))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(request_id = %item.request_id, panic = %message, "Execution handler panicked");
                ExecutionReply::error(error_body(&message))
            }
        };

        let status = reply.status;
        self.send_reply(item.response(reply));
        self.events
            .on_request_completed(&item.request_id, status, started.elapsed());
    }

    /// Send a reply, tracking it until acked. Unsendable replies are buffered.
    fn send_reply(&self, response: SdkResponse) {
        let envelope = match Envelope::new(GatewayMessageType::WorkerReply, &response) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(request_id = %response.request_id, error = %e, "Reply cannot be framed, buffering");
                self.buffer.append(response);
                return;
            }
        };

        // Track before sending so an immediate ack finds the entry.
        self.buffer
            .add_pending(response.clone(), self.reply_ack_timeout);
        if let Err(e) = self.sink.send_envelope(envelope) {
            debug!(request_id = %response.request_id, error = %e, "Reply not sent, buffering");
            self.buffer.append(response);
        }
    }

    fn extend_lease_ack(&self, envelope: &Envelope) {
        let ack = match envelope.decode::<WorkerRequestExtendLeaseAckData>() {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "Invalid extend lease ack payload");
                return;
            }
        };

        match ack.new_lease_id.filter(|id| !id.is_empty()) {
            Some(lease_id) => {
                if !self.leases.update(&ack.request_id, &lease_id) {
                    debug!(request_id = %ack.request_id, "Lease extended for finished request");
                }
            }
            None => {
                warn!(request_id = %ack.request_id, "Lease not extended, request may be redelivered");
                self.leases.remove(&ack.request_id);
            }
        }
    }
}

impl fmt::Debug for ActiveHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveHandler")
            .field("handlers", &self.registry.len())
            .field("leases", &self.leases.len())
            .field("inflight", &self.inflight.count())
            .field("extend_lease_interval", &self.extend_lease_interval)
            .finish()
    }
}

/// Per-item cleanup, run however execution ends.
struct WorkGuard {
    request_id: String,
    lease: u64,
    leases: LeaseTable,
    inflight: InflightCounter,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        // Lease first: once the counter reaches zero the table must be clean.
        self.leases.remove_generation(&self.request_id, self.lease);
        self.inflight.done();
    }
}

fn error_body(message: &str) -> Vec<u8> {
    serde_json::json!({
        "name": "Error",
        "message": message,
    })
    .to_string()
    .into_bytes()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "execution handler panicked".to_string()
    }
}
