// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol message handling.
//!
//! A connection goes through two phases that share one wire vocabulary:
//! [`setup`] drives the hello/connect/ready handshake and [`active`] serves
//! work once the connection is ready.

pub mod active;
pub mod setup;

pub use active::ActiveHandler;
pub use setup::{ConnectionIntervals, SetupHandler, SetupStep, parse_duration};
