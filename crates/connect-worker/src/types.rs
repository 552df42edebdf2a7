// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level types for the worker.

use std::fmt;
use std::sync::Arc;

use connect_protocol::proto;

use crate::executor::RequestHandler;

/// Outcome status reported to the gateway for a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// The function run finished
    Done,
    /// A step finished but the run has more work to do
    NotCompleted,
    /// Execution failed
    Error,
}

impl From<proto::SdkResponseStatus> for ReplyStatus {
    fn from(status: proto::SdkResponseStatus) -> Self {
        match status {
            proto::SdkResponseStatus::Done => ReplyStatus::Done,
            proto::SdkResponseStatus::NotCompleted => ReplyStatus::NotCompleted,
            proto::SdkResponseStatus::Error => ReplyStatus::Error,
        }
    }
}

impl From<i32> for ReplyStatus {
    fn from(value: i32) -> Self {
        proto::SdkResponseStatus::try_from(value)
            .map(ReplyStatus::from)
            .unwrap_or(ReplyStatus::Error)
    }
}

impl From<ReplyStatus> for proto::SdkResponseStatus {
    fn from(status: ReplyStatus) -> Self {
        match status {
            ReplyStatus::Done => proto::SdkResponseStatus::Done,
            ReplyStatus::NotCompleted => proto::SdkResponseStatus::NotCompleted,
            ReplyStatus::Error => proto::SdkResponseStatus::Error,
        }
    }
}

/// A unit of work dispatched by the gateway.
///
/// Identity is `request_id`; the item is never mutated after it is received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub request_id: String,
    pub account_id: String,
    pub env_id: String,
    pub app_id: String,
    pub app_name: String,
    pub function_slug: String,
    pub function_id: Option<String>,
    pub step_id: Option<String>,
    pub lease_id: String,
    pub run_id: String,
    /// Opaque request body handed to the execution handler
    pub payload: Vec<u8>,
    pub system_trace_ctx: Vec<u8>,
    pub user_trace_ctx: Vec<u8>,
}

impl From<proto::GatewayExecutorRequestData> for WorkItem {
    fn from(req: proto::GatewayExecutorRequestData) -> Self {
        Self {
            request_id: req.request_id,
            account_id: req.account_id,
            env_id: req.env_id,
            app_id: req.app_id,
            app_name: req.app_name,
            function_slug: req.function_slug,
            function_id: req.function_id,
            step_id: req.step_id,
            lease_id: req.lease_id,
            run_id: req.run_id,
            payload: req.request_payload,
            system_trace_ctx: req.system_trace_ctx,
            user_trace_ctx: req.user_trace_ctx,
        }
    }
}

impl WorkItem {
    pub(crate) fn ack(&self) -> proto::WorkerRequestAckData {
        proto::WorkerRequestAckData {
            request_id: self.request_id.clone(),
            account_id: self.account_id.clone(),
            env_id: self.env_id.clone(),
            app_id: self.app_id.clone(),
            function_slug: self.function_slug.clone(),
            step_id: self.step_id.clone(),
            system_trace_ctx: self.system_trace_ctx.clone(),
            user_trace_ctx: self.user_trace_ctx.clone(),
            run_id: self.run_id.clone(),
        }
    }

    pub(crate) fn extend_lease(&self, lease_id: String) -> proto::WorkerRequestExtendLeaseData {
        proto::WorkerRequestExtendLeaseData {
            request_id: self.request_id.clone(),
            account_id: self.account_id.clone(),
            env_id: self.env_id.clone(),
            app_id: self.app_id.clone(),
            function_slug: self.function_slug.clone(),
            step_id: self.step_id.clone(),
            system_trace_ctx: self.system_trace_ctx.clone(),
            user_trace_ctx: self.user_trace_ctx.clone(),
            run_id: self.run_id.clone(),
            lease_id,
        }
    }

    pub(crate) fn response(&self, reply: ExecutionReply) -> proto::SdkResponse {
        proto::SdkResponse {
            request_id: self.request_id.clone(),
            account_id: self.account_id.clone(),
            env_id: self.env_id.clone(),
            app_id: self.app_id.clone(),
            status: proto::SdkResponseStatus::from(reply.status).into(),
            body: reply.body,
            no_retry: reply.no_retry,
            retry_after: reply.retry_after,
            sdk_version: crate::SDK_VERSION.to_string(),
            request_version: reply.request_version,
            system_trace_ctx: self.system_trace_ctx.clone(),
            user_trace_ctx: self.user_trace_ctx.clone(),
            run_id: self.run_id.clone(),
        }
    }
}

/// What an execution handler produced for a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReply {
    pub status: ReplyStatus,
    pub body: Vec<u8>,
    /// Tell the gateway not to retry this step
    pub no_retry: bool,
    /// Retry hint, e.g. an HTTP date or a number of seconds
    pub retry_after: Option<String>,
    /// Execution protocol version the handler spoke
    pub request_version: u32,
}

impl ExecutionReply {
    /// A reply with the given status and body and no retry hints.
    pub fn new(status: ReplyStatus, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            no_retry: false,
            retry_after: None,
            request_version: 0,
        }
    }

    pub fn done(body: impl Into<Vec<u8>>) -> Self {
        Self::new(ReplyStatus::Done, body)
    }

    pub fn not_completed(body: impl Into<Vec<u8>>) -> Self {
        Self::new(ReplyStatus::NotCompleted, body)
    }

    pub fn error(body: impl Into<Vec<u8>>) -> Self {
        Self::new(ReplyStatus::Error, body)
    }

    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    pub fn with_retry_after(mut self, retry_after: impl Into<String>) -> Self {
        self.retry_after = Some(retry_after.into());
        self
    }

    pub fn with_request_version(mut self, version: u32) -> Self {
        self.request_version = version;
        self
    }
}

/// An application served by this worker.
#[derive(Clone)]
pub struct AppRegistration {
    /// Client identity; work items are routed by this name
    pub app_name: String,
    pub app_version: Option<String>,
    /// Function manifest sent to the gateway on connect
    pub functions: serde_json::Value,
    /// Executes work items for this application
    pub handler: Arc<dyn RequestHandler>,
}

impl AppRegistration {
    pub fn new(
        app_name: impl Into<String>,
        functions: serde_json::Value,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: None,
            functions,
            handler,
        }
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    pub(crate) fn to_proto(&self) -> proto::AppConfiguration {
        proto::AppConfiguration {
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            functions: serde_json::to_vec(&self.functions).unwrap_or_default(),
        }
    }
}

impl fmt::Debug for AppRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppRegistration")
            .field("app_name", &self.app_name)
            .field("app_version", &self.app_version)
            .field("functions", &self.functions)
            .field("handler", &"...")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> proto::GatewayExecutorRequestData {
        proto::GatewayExecutorRequestData {
            request_id: "req-1".to_string(),
            account_id: "acct".to_string(),
            env_id: "env".to_string(),
            app_id: "app".to_string(),
            app_name: "shop".to_string(),
            function_slug: "shop-checkout".to_string(),
            function_id: None,
            step_id: Some("step-1".to_string()),
            request_payload: b"{}".to_vec(),
            system_trace_ctx: vec![9],
            user_trace_ctx: vec![],
            run_id: "run-1".to_string(),
            lease_id: "lease-1".to_string(),
        }
    }

    #[test]
    fn test_work_item_from_proto() {
        let item = WorkItem::from(request());
        assert_eq!(item.request_id, "req-1");
        assert_eq!(item.app_name, "shop");
        assert_eq!(item.lease_id, "lease-1");
        assert_eq!(item.payload, b"{}".to_vec());
    }

    #[test]
    fn test_response_carries_request_identity() {
        let item = WorkItem::from(request());
        let response = item.response(
            ExecutionReply::error(b"boom".to_vec())
                .with_no_retry(true)
                .with_retry_after("30"),
        );

        assert_eq!(response.request_id, "req-1");
        assert_eq!(response.run_id, "run-1");
        assert_eq!(response.status(), proto::SdkResponseStatus::Error);
        assert!(response.no_retry);
        assert_eq!(response.retry_after.as_deref(), Some("30"));
        assert_eq!(response.system_trace_ctx, vec![9]);
    }

    #[test]
    fn test_ack_and_extend_lease_payloads() {
        let item = WorkItem::from(request());

        let ack = item.ack();
        assert_eq!(ack.request_id, "req-1");
        assert_eq!(ack.step_id.as_deref(), Some("step-1"));

        let extend = item.extend_lease("lease-2".to_string());
        assert_eq!(extend.lease_id, "lease-2");
        assert_eq!(extend.function_slug, "shop-checkout");
    }

    #[test]
    fn test_reply_status_conversions() {
        assert_eq!(ReplyStatus::from(1), ReplyStatus::Done);
        assert_eq!(ReplyStatus::from(0), ReplyStatus::NotCompleted);
        assert_eq!(ReplyStatus::from(2), ReplyStatus::Error);
        assert_eq!(ReplyStatus::from(77), ReplyStatus::Error);
        assert_eq!(
            proto::SdkResponseStatus::from(ReplyStatus::Done),
            proto::SdkResponseStatus::Done
        );
    }
}
