// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Setup handshake: hello, worker-connect, connection-ready.

use std::time::Duration;

use connect_protocol::proto::{
    AppConfiguration, AuthData, GatewayConnectionReadyData, StartResponse, SystemAttributes,
    WorkerConnectRequestData,
};
use connect_protocol::{Envelope, GatewayMessageType};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::error::{ConnectError, Result};
use crate::socket::{EnvelopeSink, SocketEvent};

/// Heartbeat interval used when the gateway sends none or an unparsable one.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10_000);

/// Lease extension interval used when the gateway sends none or an unparsable one.
pub const DEFAULT_EXTEND_LEASE_INTERVAL: Duration = Duration::from_millis(5_000);

/// Worker capabilities advertised on connect.
const CAPABILITIES: &[u8] = br#"{"trust_probe":"v1","connect":"v1"}"#;

/// Intervals negotiated by the connection-ready message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionIntervals {
    pub heartbeat: Duration,
    pub extend_lease: Duration,
}

impl ConnectionIntervals {
    pub fn from_ready(data: &GatewayConnectionReadyData) -> Self {
        Self {
            heartbeat: interval_or(&data.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL),
            extend_lease: interval_or(&data.extend_lease_interval, DEFAULT_EXTEND_LEASE_INTERVAL),
        }
    }
}

impl Default for ConnectionIntervals {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT_INTERVAL,
            extend_lease: DEFAULT_EXTEND_LEASE_INTERVAL,
        }
    }
}

fn interval_or(value: &str, fallback: Duration) -> Duration {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => d,
        _ => fallback,
    }
}

/// Parse a duration string such as `"15s"`, `"1m30s"`, `"1.5s"` or `"250ms"`.
///
/// Units: `ns`, `us` (`µs`), `ms`, `s`, `m`, `h`. A bare `"0"` is zero.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = s;
    let mut total_nanos = 0f64;

    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let value: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            _ => return None,
        };
        total_nanos += value * scale;
        rest = &rest[unit_end..];
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(total_nanos.round() as u64))
}

/// Identity and environment of this worker process, fixed for its lifetime.
#[derive(Debug, Clone)]
pub(crate) struct WorkerIdentity {
    pub instance_id: String,
    pub apps: Vec<AppConfiguration>,
    pub environment: Option<String>,
    pub started_at_ms: i64,
    pub system: SystemAttributes,
    pub max_worker_concurrency: Option<u64>,
}

impl WorkerIdentity {
    /// Worker-connect payload for one connection attempt.
    pub(crate) fn connect_data(&self, start: &StartResponse) -> WorkerConnectRequestData {
        WorkerConnectRequestData {
            connection_id: start.connection_id.clone(),
            instance_id: self.instance_id.clone(),
            auth_data: Some(AuthData {
                session_token: start.session_token.clone(),
                sync_token: start.sync_token.clone(),
            }),
            capabilities: CAPABILITIES.to_vec(),
            apps: self.apps.clone(),
            environment: self.environment.clone(),
            framework: "connect".to_string(),
            platform: None,
            sdk_version: crate::SDK_VERSION.to_string(),
            sdk_language: crate::SDK_LANGUAGE.to_string(),
            started_at_ms: self.started_at_ms,
            system_attributes: Some(self.system.clone()),
            max_worker_concurrency: self
                .max_worker_concurrency
                .map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
        }
    }
}

/// Host attributes reported to the gateway.
pub(crate) fn system_attributes() -> SystemAttributes {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();

    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    SystemAttributes {
        cpu_cores: i32::try_from(cpu_cores).unwrap_or(i32::MAX),
        mem_bytes: i64::try_from(sys.total_memory()).unwrap_or(i64::MAX),
        os: sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
    }
}

/// Result of feeding one envelope to the [`SetupHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    /// Keep reading
    Continue,
    /// Handshake finished
    Ready(ConnectionIntervals),
}

/// Drives the setup handshake of a single connection.
///
/// The first envelope must be a hello; any other kind fails the attempt.
/// After the hello the worker-connect payload is sent, and the handshake
/// completes with connection-ready. Anything else in between is ignored.
#[derive(Debug)]
pub struct SetupHandler {
    connect_data: WorkerConnectRequestData,
    hello_received: bool,
    ready: bool,
}

impl SetupHandler {
    pub fn new(connect_data: WorkerConnectRequestData) -> Self {
        Self {
            connect_data,
            hello_received: false,
            ready: false,
        }
    }

    pub fn handle(&mut self, envelope: &Envelope, sink: &dyn EnvelopeSink) -> Result<SetupStep> {
        if !self.hello_received {
            if envelope.kind != GatewayMessageType::GatewayHello {
                return Err(ConnectError::UnexpectedSetupMessage(envelope.kind));
            }
            self.hello_received = true;
            debug!("Received gateway hello, sending worker connect");
            sink.send_envelope(Envelope::new(
                GatewayMessageType::WorkerConnect,
                &self.connect_data,
            )?)?;
            return Ok(SetupStep::Continue);
        }

        if self.ready {
            debug!(kind = envelope.kind.as_str_name(), "Ignoring message after setup");
            return Ok(SetupStep::Continue);
        }

        match envelope.kind {
            GatewayMessageType::GatewayConnectionReady => {
                let data: GatewayConnectionReadyData = envelope.decode()?;
                self.ready = true;
                let intervals = ConnectionIntervals::from_ready(&data);
                debug!(
                    heartbeat_ms = intervals.heartbeat.as_millis() as u64,
                    extend_lease_ms = intervals.extend_lease.as_millis() as u64,
                    "Gateway connection ready"
                );
                Ok(SetupStep::Ready(intervals))
            }
            other => {
                debug!(kind = other.as_str_name(), "Ignoring message during setup");
                Ok(SetupStep::Continue)
            }
        }
    }

    /// Read socket events until the handshake completes or fails.
    #[instrument(skip_all, fields(connection_id = %self.connect_data.connection_id))]
    pub async fn run(
        mut self,
        sink: &dyn EnvelopeSink,
        events: &mut mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Result<ConnectionIntervals> {
        loop {
            match events.recv().await {
                Some(SocketEvent::Message(envelope)) => {
                    if let SetupStep::Ready(intervals) = self.handle(&envelope, sink)? {
                        return Ok(intervals);
                    }
                }
                Some(SocketEvent::Closed(reason)) => {
                    return Err(ConnectError::ConnectionLost(reason.unwrap_or_else(|| {
                        "socket closed during setup".to_string()
                    })));
                }
                Some(SocketEvent::Error(e)) => return Err(ConnectError::ConnectionLost(e)),
                None => {
                    return Err(ConnectError::ConnectionLost(
                        "socket closed during setup".to_string(),
                    ));
                }
            }
        }
    }
}
