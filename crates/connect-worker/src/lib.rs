// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connect Worker - outbound worker connections to a durable-execution gateway.
//!
//! Instead of exposing an HTTP endpoint, a worker dials out to the gateway,
//! completes a short handshake and then receives work items over a persistent
//! WebSocket. This crate implements the worker side of that protocol on top
//! of the `connect-protocol` envelope codec.
//!
//! # Features
//!
//! - **Reconnects**: exponential backoff, excluded gateway groups and a
//!   one-time switch to the fallback signing key after an auth failure
//! - **Drain handover**: when the gateway drains a connection, a replacement
//!   is established before the old socket is closed
//! - **Leases**: in-flight work items are kept alive with periodic lease
//!   extensions until their handler finishes
//! - **Reply durability**: replies that are never acknowledged on the socket
//!   are delivered through the HTTP flush endpoint
//! - **Graceful shutdown**: on `close()` or a configured signal, new work is
//!   refused, in-flight work finishes and outstanding replies are flushed
//!
//! # Quick Start
//!
//! ```ignore
//! use connect_worker::{AppRegistration, ConnectConfig, ExecutionReply, WorkItem, WorkerConnection, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> connect_worker::Result<()> {
//!     let app = AppRegistration::new(
//!         "shop",
//!         serde_json::json!([{ "id": "checkout", "name": "Checkout" }]),
//!         handler_fn(|item: WorkItem| async move {
//!             // Run the function and return the body the gateway expects.
//!             Ok(ExecutionReply::done(item.payload))
//!         }),
//!     );
//!
//!     let config = ConnectConfig::from_env(vec![app])?;
//!     let worker = WorkerConnection::connect(config).await?;
//!
//!     // SIGINT/SIGTERM trigger a graceful close by default.
//!     worker.closed().await;
//!     Ok(())
//! }
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! CONNECTING --ready--> ACTIVE --drain--> (ACTIVE, replacement connecting) --ready--> ACTIVE
//!      |                  |
//!      +--failure--> RECONNECTING <--lost--+
//!
//! any --close()--> CLOSING --> CLOSED
//! ```
//!
//! Observe transitions with [`WorkerConnection::subscribe_state`] or a
//! [`ConnectionEvents`] implementation passed to
//! [`WorkerConnection::start_with_events`].

pub mod api;
pub mod backoff;
pub mod buffer;
mod config;
mod connection;
pub mod credentials;
mod error;
mod events;
mod executor;
pub mod handler;
pub mod inflight;
pub mod lease;
mod signals;
pub mod socket;
pub mod state;
mod types;

/// Version reported to the gateway in connect requests and replies.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Language reported to the gateway.
pub const SDK_LANGUAGE: &str = "rust";

// Main types
pub use config::{ConnectConfig, DEFAULT_API_BASE_URL, DEV_API_BASE_URL};
pub use connection::WorkerConnection;
pub use error::{ConnectError, Result};
pub use events::{ConnectionEvents, NoopEvents};
pub use executor::{FnHandler, HandlerRegistry, RequestHandler, handler_fn};
pub use signals::ShutdownSignal;
pub use state::{ConnectionState, StateEvent, StateTransition};
pub use types::{AppRegistration, ExecutionReply, ReplyStatus, WorkItem};

pub use backoff::Backoff;

// Re-export the wire layer for advanced usage
pub use connect_protocol as protocol;
