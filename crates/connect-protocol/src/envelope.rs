// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Envelope format for gateway socket frames.
//!
//! Each binary socket frame carries exactly one [`ConnectMessage`]:
//! - field 1: message kind ([`GatewayMessageType`])
//! - field 2: kind-specific protobuf payload
//!
//! Only the handler for a given kind decodes the nested payload.

use bytes::Bytes;
use prost::Message;
use thiserror::Error;

use crate::proto::{ConnectMessage, GatewayMessageType};

/// Maximum encoded envelope size (16 MB)
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during envelope encoding/decoding
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope too large: {0} bytes (max: {MAX_ENVELOPE_SIZE})")]
    TooLarge(usize),

    #[error("unknown message kind: {0}")]
    UnknownKind(i32),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl EnvelopeError {
    /// Whether the frame was well-formed but carried a kind this worker does not know.
    ///
    /// Such frames are skipped rather than treated as a broken connection.
    pub fn is_unknown_kind(&self) -> bool {
        matches!(self, EnvelopeError::UnknownKind(_))
    }
}

/// A decoded socket frame: a kind plus its still-encoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: GatewayMessageType,
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope with the given kind and payload message
    pub fn new<M: Message>(kind: GatewayMessageType, msg: &M) -> Result<Self, EnvelopeError> {
        let payload = msg.encode_to_vec();
        if payload.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge(payload.len()));
        }
        Ok(Self {
            kind,
            payload: Bytes::from(payload),
        })
    }

    /// Create an envelope without a payload (heartbeats, pause)
    pub fn empty(kind: GatewayMessageType) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    /// Worker heartbeat frame
    pub fn heartbeat() -> Self {
        Self::empty(GatewayMessageType::WorkerHeartbeat)
    }

    /// Frame asking the gateway to stop routing work to this connection
    pub fn pause() -> Self {
        Self::empty(GatewayMessageType::WorkerPause)
    }

    /// Decode the payload as a protobuf message
    pub fn decode<M: Message + Default>(&self) -> Result<M, EnvelopeError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Encode the envelope to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let msg = ConnectMessage {
            kind: self.kind.into(),
            payload: self.payload.to_vec(),
        };
        Bytes::from(msg.encode_to_vec())
    }

    /// Decode an envelope from a binary frame
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge(bytes.len()));
        }

        let msg = ConnectMessage::decode(bytes)?;
        let kind = GatewayMessageType::try_from(msg.kind)
            .map_err(|_| EnvelopeError::UnknownKind(msg.kind))?;

        Ok(Self {
            kind,
            payload: Bytes::from(msg.payload),
        })
    }
}
