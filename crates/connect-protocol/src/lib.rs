// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connect Protocol - Protobuf envelopes for the worker/gateway socket
//!
//! This crate provides the wire vocabulary shared by connect workers and
//! the gateway they attach to.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    connect-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelope: kind + nested payload bytes                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: binary WebSocket frames (owned by the worker)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Messages
//!
//! Every frame is a [`proto::ConnectMessage`] whose `kind` selects how the
//! payload is interpreted:
//! - Setup: `GATEWAY_HELLO`, `WORKER_CONNECT`, `GATEWAY_CONNECTION_READY`
//! - Work: `GATEWAY_EXECUTOR_REQUEST`, `WORKER_REQUEST_ACK`, `WORKER_REPLY`, `WORKER_REPLY_ACK`
//! - Leases: `WORKER_REQUEST_EXTEND_LEASE`, `WORKER_REQUEST_EXTEND_LEASE_ACK`
//! - Liveness and lifecycle: heartbeats, `WORKER_PAUSE`, `GATEWAY_CLOSING`
//!
//! The HTTP start and flush endpoints reuse the same codec
//! ([`proto::StartRequest`], [`proto::StartResponse`], [`proto::SdkResponse`]).
//!
//! # Usage
//!
//! ```ignore
//! use connect_protocol::{Envelope, proto};
//!
//! let ack = proto::WorkerReplyAckData { request_id: "req-1".into() };
//! let envelope = Envelope::new(proto::GatewayMessageType::WorkerReplyAck, &ack)?;
//! let bytes = envelope.encode();
//!
//! let decoded = Envelope::decode_from_bytes(&bytes)?;
//! let ack: proto::WorkerReplyAckData = decoded.decode()?;
//! ```

pub mod envelope;
pub mod proto;

/// Protocol identifier negotiated when opening the gateway socket.
pub const PROTOCOL_IDENTIFIER: &str = "v0.connect.inngest.com";

// Re-export main types
pub use envelope::{Envelope, EnvelopeError, MAX_ENVELOPE_SIZE};
pub use proto::{GatewayMessageType, SdkResponseStatus};
