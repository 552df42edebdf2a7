// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection state machine.
//!
//! A pure transition table over [`ConnectionState`] and [`StateEvent`] with a
//! bounded transition history and synchronous listener fan-out. Invalid
//! transitions are no-ops: messages can legitimately arrive out of order
//! while connections race each other.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Maximum number of transitions kept in the history log.
pub const MAX_HISTORY: usize = 50;

/// Lifecycle state of a worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Handshake and setup in progress
    Connecting,
    /// Serving work
    Active,
    /// Gateway asked us to move; the old socket still serves while a
    /// replacement is established. Reported externally as [`ConnectionState::Active`].
    DrainingReconnecting,
    /// Waiting to retry after a failure
    Reconnecting,
    /// Graceful shutdown in progress
    Closing,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// The state as seen by embedding code. Draining is never exposed.
    pub fn external(self) -> ConnectionState {
        match self {
            ConnectionState::DrainingReconnecting => ConnectionState::Active,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Active => "ACTIVE",
            ConnectionState::DrainingReconnecting => "DRAINING_RECONNECTING",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateEvent {
    ConnectionReady,
    SetupFailed,
    AuthFailed,
    ConnectionLost,
    ConnectionError,
    DrainRequested,
    ShutdownRequested,
    RetryConnect,
    NewConnectionReady,
    ShutdownComplete,
}

impl StateEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateEvent::ConnectionReady => "CONNECTION_READY",
            StateEvent::SetupFailed => "SETUP_FAILED",
            StateEvent::AuthFailed => "AUTH_FAILED",
            StateEvent::ConnectionLost => "CONNECTION_LOST",
            StateEvent::ConnectionError => "CONNECTION_ERROR",
            StateEvent::DrainRequested => "DRAIN_REQUESTED",
            StateEvent::ShutdownRequested => "SHUTDOWN_REQUESTED",
            StateEvent::RetryConnect => "RETRY_CONNECT",
            StateEvent::NewConnectionReady => "NEW_CONNECTION_READY",
            StateEvent::ShutdownComplete => "SHUTDOWN_COMPLETE",
        }
    }
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful transition, as delivered to listeners and kept in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub event: StateEvent,
    pub timestamp: DateTime<Utc>,
}

type Listener = Box<dyn Fn(&StateTransition) + Send + Sync>;

/// Look up the target state for `(from, event)`.
fn next_state(from: ConnectionState, event: StateEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use StateEvent::*;

    match (from, event) {
        (Connecting, ConnectionReady) => Some(Active),
        (Connecting, SetupFailed | AuthFailed | ConnectionLost | ConnectionError) => {
            Some(Reconnecting)
        }
        (Connecting, ShutdownRequested) => Some(Closing),

        (Active, DrainRequested) => Some(DrainingReconnecting),
        (Active, ConnectionLost | ConnectionError) => Some(Reconnecting),
        (Active, ShutdownRequested) => Some(Closing),

        (Reconnecting, RetryConnect) => Some(Connecting),
        (Reconnecting, NewConnectionReady) => Some(Active),
        (Reconnecting, ShutdownRequested) => Some(Closing),

        (DrainingReconnecting, NewConnectionReady) => Some(Active),
        (DrainingReconnecting, ConnectionLost | ConnectionError) => Some(Reconnecting),
        (DrainingReconnecting, ShutdownRequested) => Some(Closing),

        // Late errors must not interrupt an ongoing shutdown.
        (Closing, ConnectionLost | ConnectionError | ShutdownRequested) => Some(Closing),
        (Closing, ShutdownComplete) => Some(Closed),

        _ => None,
    }
}

/// Connection state plus transition history and listeners.
pub struct ConnectionStateMachine {
    state: ConnectionState,
    history: VecDeque<StateTransition>,
    listeners: Vec<Listener>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            history: VecDeque::with_capacity(MAX_HISTORY),
            listeners: Vec::new(),
        }
    }

    /// Internal state, including [`ConnectionState::DrainingReconnecting`].
    pub fn internal_state(&self) -> ConnectionState {
        self.state
    }

    /// State as exposed to embedding code.
    pub fn state(&self) -> ConnectionState {
        self.state.external()
    }

    /// Apply an event.
    ///
    /// Returns `false` and leaves the state untouched when the table has no
    /// row for the current state and event.
    pub fn transition(&mut self, event: StateEvent) -> bool {
        let from = self.state;
        let Some(to) = next_state(from, event) else {
            debug!(state = %from, event = %event, "Ignoring invalid state transition");
            return false;
        };

        self.state = to;
        let transition = StateTransition {
            from,
            to,
            event,
            timestamp: Utc::now(),
        };

        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&transition))).is_err() {
                warn!(from = %from, to = %to, "State listener panicked");
            }
        }

        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(transition);

        true
    }

    /// Register a listener called synchronously after every successful transition.
    pub fn on_transition<F>(&mut self, listener: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Drop all listeners.
    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    /// Transitions in order, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Active | ConnectionState::DrainingReconnecting
        )
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state == ConnectionState::Reconnecting
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnectionState::Closing
    }

    pub fn is_terminal(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_draining(&self) -> bool {
        self.state == ConnectionState::DrainingReconnecting
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state)
            .field("history_len", &self.history.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
