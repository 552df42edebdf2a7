// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages exchanged between a worker and the connect gateway.
//!
//! Field numbers and enum values are part of the wire contract with the
//! gateway and must not be renumbered.

/// Kind tag carried by every [`ConnectMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum GatewayMessageType {
    GatewayHello = 0,
    WorkerConnect = 1,
    GatewayConnectionReady = 2,
    GatewayExecutorRequest = 3,
    WorkerReady = 4,
    WorkerRequestAck = 5,
    WorkerRequestExtendLease = 6,
    WorkerRequestExtendLeaseAck = 7,
    WorkerReply = 8,
    WorkerReplyAck = 9,
    WorkerPause = 10,
    WorkerHeartbeat = 11,
    GatewayHeartbeat = 12,
    GatewayClosing = 13,
}

impl GatewayMessageType {
    /// String value of the enum field names used in the ProtoBuf definition.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Self::GatewayHello => "GATEWAY_HELLO",
            Self::WorkerConnect => "WORKER_CONNECT",
            Self::GatewayConnectionReady => "GATEWAY_CONNECTION_READY",
            Self::GatewayExecutorRequest => "GATEWAY_EXECUTOR_REQUEST",
            Self::WorkerReady => "WORKER_READY",
            Self::WorkerRequestAck => "WORKER_REQUEST_ACK",
            Self::WorkerRequestExtendLease => "WORKER_REQUEST_EXTEND_LEASE",
            Self::WorkerRequestExtendLeaseAck => "WORKER_REQUEST_EXTEND_LEASE_ACK",
            Self::WorkerReply => "WORKER_REPLY",
            Self::WorkerReplyAck => "WORKER_REPLY_ACK",
            Self::WorkerPause => "WORKER_PAUSE",
            Self::WorkerHeartbeat => "WORKER_HEARTBEAT",
            Self::GatewayHeartbeat => "GATEWAY_HEARTBEAT",
            Self::GatewayClosing => "GATEWAY_CLOSING",
        }
    }
}

/// Outer message of every socket frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectMessage {
    #[prost(enumeration = "GatewayMessageType", tag = "1")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

/// Tokens obtained from the HTTP start request and echoed on the socket.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthData {
    #[prost(string, tag = "1")]
    pub session_token: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub sync_token: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemAttributes {
    #[prost(int32, tag = "1")]
    pub cpu_cores: i32,
    #[prost(int64, tag = "2")]
    pub mem_bytes: i64,
    #[prost(string, tag = "3")]
    pub os: ::prost::alloc::string::String,
}

/// One registered application and its JSON-encoded function manifest.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppConfiguration {
    #[prost(string, tag = "1")]
    pub app_name: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "2")]
    pub app_version: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bytes = "vec", tag = "3")]
    pub functions: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerConnectRequestData {
    #[prost(string, tag = "1")]
    pub connection_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub instance_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub auth_data: ::core::option::Option<AuthData>,
    #[prost(bytes = "vec", tag = "4")]
    pub capabilities: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, repeated, tag = "5")]
    pub apps: ::prost::alloc::vec::Vec<AppConfiguration>,
    #[prost(string, optional, tag = "6")]
    pub environment: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, tag = "7")]
    pub framework: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "8")]
    pub platform: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, tag = "9")]
    pub sdk_version: ::prost::alloc::string::String,
    #[prost(string, tag = "10")]
    pub sdk_language: ::prost::alloc::string::String,
    #[prost(int64, tag = "11")]
    pub started_at_ms: i64,
    #[prost(message, optional, tag = "12")]
    pub system_attributes: ::core::option::Option<SystemAttributes>,
    #[prost(int64, optional, tag = "13")]
    pub max_worker_concurrency: ::core::option::Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GatewayConnectionReadyData {
    /// Go-style duration string, e.g. `"10s"`.
    #[prost(string, tag = "1")]
    pub heartbeat_interval: ::prost::alloc::string::String,
    /// Go-style duration string, e.g. `"5s"`.
    #[prost(string, tag = "2")]
    pub extend_lease_interval: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GatewayExecutorRequestData {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub account_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub env_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub app_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub app_name: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub function_slug: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "7")]
    pub function_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "8")]
    pub step_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bytes = "vec", tag = "9")]
    pub request_payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "10")]
    pub system_trace_ctx: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "11")]
    pub user_trace_ctx: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "12")]
    pub run_id: ::prost::alloc::string::String,
    #[prost(string, tag = "13")]
    pub lease_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerRequestAckData {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub account_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub env_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub app_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub function_slug: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "6")]
    pub step_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bytes = "vec", tag = "7")]
    pub system_trace_ctx: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub user_trace_ctx: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "9")]
    pub run_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerRequestExtendLeaseData {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub account_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub env_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub app_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub function_slug: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "6")]
    pub step_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bytes = "vec", tag = "7")]
    pub system_trace_ctx: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub user_trace_ctx: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "9")]
    pub run_id: ::prost::alloc::string::String,
    #[prost(string, tag = "10")]
    pub lease_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerRequestExtendLeaseAckData {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub account_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub env_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub app_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub function_slug: ::prost::alloc::string::String,
    /// Absent or empty when the gateway refused to extend the lease.
    #[prost(string, optional, tag = "6")]
    pub new_lease_id: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SdkResponseStatus {
    NotCompleted = 0,
    Done = 1,
    Error = 2,
}

impl SdkResponseStatus {
    /// String value of the enum field names used in the ProtoBuf definition.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Self::NotCompleted => "NOT_COMPLETED",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

/// Reply to a [`GatewayExecutorRequestData`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SdkResponse {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub account_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub env_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub app_id: ::prost::alloc::string::String,
    #[prost(enumeration = "SdkResponseStatus", tag = "5")]
    pub status: i32,
    #[prost(bytes = "vec", tag = "6")]
    pub body: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "7")]
    pub no_retry: bool,
    #[prost(string, optional, tag = "8")]
    pub retry_after: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, tag = "9")]
    pub sdk_version: ::prost::alloc::string::String,
    #[prost(uint32, tag = "10")]
    pub request_version: u32,
    #[prost(bytes = "vec", tag = "11")]
    pub system_trace_ctx: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "12")]
    pub user_trace_ctx: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "13")]
    pub run_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerReplyAckData {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
}

/// Body of `POST /v0/connect/start`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRequest {
    #[prost(string, repeated, tag = "1")]
    pub exclude_gateways: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartResponse {
    #[prost(string, tag = "1")]
    pub connection_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub gateway_endpoint: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub gateway_group: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub session_token: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub sync_token: ::prost::alloc::string::String,
}

/// Response of `POST /v0/connect/flush`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlushResponse {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
}
