// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Socket manager: owns one gateway socket and every task attached to it.
//!
//! A [`SocketManager`] is created by a successful [`SocketManager::connect`]
//! and tears down its reader, writer and heartbeat tasks on every exit path:
//! explicit close, forced close, or drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use connect_protocol::{Envelope, PROTOCOL_IDENTIFIER};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::error::{ConnectError, Result};

/// Consecutive unanswered heartbeats after which the connection is considered lost.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// How long a graceful close waits for queued frames to reach the socket.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Outgoing side of the protocol, as seen by the message handlers.
pub trait EnvelopeSink: Send + Sync {
    /// Queue an envelope for sending. Fails if there is no open socket.
    fn send_envelope(&self, envelope: Envelope) -> Result<()>;
}

/// Something observed on the inbound side of a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A decoded envelope of a known kind
    Message(Envelope),
    /// The socket closed, with the peer's reason if any
    Closed(Option<String>),
    /// The socket failed
    Error(String),
}

/// Cloneable handle for sending frames on an open socket.
#[derive(Debug, Clone)]
pub struct SocketSender {
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl SocketSender {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Send an already-encoded envelope.
    pub fn send(&self, bytes: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(ConnectError::SocketNotOpen);
        }
        self.tx
            .send(Message::Binary(bytes))
            .map_err(|_| ConnectError::SocketNotOpen)
    }

    /// Encode and send an envelope.
    pub fn send_message(&self, envelope: &Envelope) -> Result<()> {
        self.send(envelope.encode())
    }

    #[cfg(test)]
    pub(crate) fn from_channel(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    fn send_close(&self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Default::default(),
        };
        let _ = self.tx.send(Message::Close(Some(frame)));
    }
}

impl EnvelopeSink for SocketSender {
    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.send_message(&envelope)
    }
}

/// Missed-heartbeat counter shared with the active handler.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatHandle {
    pending: Arc<AtomicU32>,
}

impl HeartbeatHandle {
    /// The gateway answered; clear the counter.
    pub fn reset(&self) {
        self.pending.store(0, Ordering::SeqCst);
    }

    /// Heartbeats sent since the last reset.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_sent(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }
}

/// Owner of one physical gateway socket.
pub struct SocketManager {
    url: String,
    sender: SocketSender,
    heartbeat: HeartbeatHandle,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    closed: bool,
}

impl SocketManager {
    /// Open a socket to `url`, negotiating the connect subprotocol.
    ///
    /// Resolves once the socket is open; fails on timeout or if the
    /// handshake is refused. Inbound traffic is delivered on the returned
    /// receiver.
    pub async fn connect(
        url: &str,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SocketEvent>)> {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PROTOCOL_IDENTIFIER),
        );

        let (stream, _response) = match tokio::time::timeout(timeout, connect_async(request)).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ConnectError::ConnectTimeout(timeout.as_millis() as u64)),
        };
        debug!(url = %url, "Gateway socket open");

        let (mut write, mut read) = stream.split();
        let open = Arc::new(AtomicBool::new(true));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer_open = open.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!(error = %e, "Socket write failed");
                    break;
                }
                if is_close {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
            let _ = write.close().await;
        });

        let reader_open = open.clone();
        let reader = tokio::spawn(async move {
            let closed_with = loop {
                match read.next().await {
                    Some(Ok(Message::Binary(data))) => match Envelope::decode_from_bytes(&data) {
                        Ok(envelope) => {
                            let _ = event_tx.send(SocketEvent::Message(envelope));
                        }
                        Err(e) if e.is_unknown_kind() => {
                            debug!(error = %e, "Skipping message of unknown kind");
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping undecodable socket frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break SocketEvent::Closed(
                            frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SocketEvent::Error(e.to_string()),
                    None => break SocketEvent::Closed(None),
                }
            };
            reader_open.store(false, Ordering::SeqCst);
            let _ = event_tx.send(closed_with);
        });

        let manager = Self {
            url: url.to_string(),
            sender: SocketSender { tx: out_tx, open },
            heartbeat: HeartbeatHandle::default(),
            reader,
            writer,
            heartbeat_task: None,
            closed: false,
        };

        Ok((manager, event_rx))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn sender(&self) -> SocketSender {
        self.sender.clone()
    }

    pub fn heartbeat_handle(&self) -> HeartbeatHandle {
        self.heartbeat.clone()
    }

    pub fn is_open(&self) -> bool {
        !self.closed && self.sender.is_open()
    }

    pub fn send(&self, bytes: Bytes) -> Result<()> {
        self.sender.send(bytes)
    }

    pub fn send_message(&self, envelope: &Envelope) -> Result<()> {
        self.sender.send_message(envelope)
    }

    /// Send a heartbeat every `interval`.
    ///
    /// Each tick first checks how many heartbeats went unanswered; once
    /// [`MAX_MISSED_HEARTBEATS`] have, `on_missed` runs exactly once and the
    /// ticker stops.
    pub fn start_heartbeat<F>(&mut self, interval: Duration, on_missed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop_heartbeat();
        self.heartbeat.reset();
        self.heartbeat_task = Some(spawn_heartbeat(
            self.sender.clone(),
            self.heartbeat.clone(),
            interval,
            on_missed,
        ));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }

    /// Ask the gateway to stop routing work here, then close normally.
    pub async fn graceful_close(&mut self) {
        if self.closed {
            return;
        }
        if self.sender.is_open() {
            let _ = self.sender.send_message(&Envelope::pause());
        }
        self.close().await;
    }

    /// Close with a normal close frame. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop_heartbeat();

        self.sender.send_close();
        self.sender.open.store(false, Ordering::SeqCst);
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut self.writer)
            .await
            .is_err()
        {
            debug!(url = %self.url, "Socket writer did not finish in time");
        }
        self.reader.abort();
        self.writer.abort();
    }

    /// Mark the socket closed without sending a close frame.
    ///
    /// Used once the socket is already known to be broken.
    pub fn force_close(&mut self) {
        self.closed = true;
        self.sender.open.store(false, Ordering::SeqCst);
        self.stop_heartbeat();
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.force_close();
    }
}

impl std::fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketManager")
            .field("url", &self.url)
            .field("open", &self.is_open())
            .field("heartbeat_pending", &self.heartbeat.pending())
            .finish()
    }
}

fn spawn_heartbeat<F>(
    sender: SocketSender,
    heartbeat: HeartbeatHandle,
    interval: Duration,
    on_missed: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if heartbeat.pending() >= MAX_MISSED_HEARTBEATS {
                warn!(
                    missed = MAX_MISSED_HEARTBEATS,
                    "Gateway stopped answering heartbeats"
                );
                on_missed();
                break;
            }
            if sender.send_message(&Envelope::heartbeat()).is_err() {
                break;
            }
            heartbeat.mark_sent();
        }
    })
}
