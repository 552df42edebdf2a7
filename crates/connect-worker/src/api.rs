// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for the connect start and flush endpoints.

use std::time::Duration;

use connect_protocol::proto::{FlushResponse, SdkResponse, StartRequest, StartResponse};
use prost::Message;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use crate::error::{ConnectError, Result};

const START_PATH: &str = "/v0/connect/start";
const FLUSH_PATH: &str = "/v0/connect/flush";

/// Header selecting the target environment (branch environments).
pub const ENV_HEADER: &str = "X-Inngest-Env";

const PROTOBUF_CONTENT_TYPE: &str = "application/protobuf";

/// Thin client over the gateway's HTTP API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    environment: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, environment: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, base_url, environment))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        environment: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            environment,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, credential: &str, body: Vec<u8>) -> Result<bytes::Bytes> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(credential)
            .header(reqwest::header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(body);
        if let Some(env) = &self.environment {
            request = request.header(ENV_HEADER, env);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.bytes().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectError::Auth(format!(
                "{} rejected credential with {}: {}",
                path, status, body
            )),
            StatusCode::TOO_MANY_REQUESTS => ConnectError::ConnectionLimit(body),
            _ => ConnectError::Handshake {
                status: status.as_u16(),
                body,
            },
        })
    }

    /// Start a connection: obtain a connection id, tokens and a gateway endpoint.
    #[instrument(skip(self, credential), fields(excluded = exclude_gateways.len()))]
    pub async fn start(
        &self,
        credential: &str,
        exclude_gateways: Vec<String>,
    ) -> Result<StartResponse> {
        let body = StartRequest { exclude_gateways }.encode_to_vec();
        let bytes = self.post(START_PATH, credential, body).await?;
        let response = StartResponse::decode(bytes)?;

        if response.gateway_endpoint.is_empty() {
            return Err(ConnectError::Handshake {
                status: 200,
                body: "start response is missing a gateway endpoint".to_string(),
            });
        }

        debug!(
            connection_id = %response.connection_id,
            gateway_group = %response.gateway_group,
            "Connection started"
        );
        Ok(response)
    }

    /// Deliver a reply over HTTP instead of the socket.
    #[instrument(skip(self, credential, reply), fields(request_id = %reply.request_id))]
    pub async fn flush(&self, credential: &str, reply: &SdkResponse) -> Result<()> {
        let bytes = self
            .post(FLUSH_PATH, credential, reply.encode_to_vec())
            .await?;
        if !bytes.is_empty() {
            let ack = FlushResponse::decode(bytes)?;
            debug!(acked = %ack.request_id, "Reply flushed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn start_response() -> StartResponse {
        StartResponse {
            connection_id: "conn-1".to_string(),
            gateway_endpoint: "ws://gateway.local/connect".to_string(),
            gateway_group: "group-a".to_string(),
            session_token: "session".to_string(),
            sync_token: "sync".to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v0/connect/start"))
            .and(header("Authorization", "Bearer signkey-test"))
            .and(header("X-Inngest-Env", "branch-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(start_response().encode_to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), Some("branch-1".to_string())).unwrap();
        let response = api.start("signkey-test", vec![]).await.unwrap();
        assert_eq!(response, start_response());
    }

    #[tokio::test]
    async fn test_start_sends_excluded_gateways() {
        let server = MockServer::start().await;
        let expected = StartRequest {
            exclude_gateways: vec!["group-a".to_string()],
        }
        .encode_to_vec();
        Mock::given(method("POST"))
            .and(path("/v0/connect/start"))
            .and(wiremock::matchers::body_bytes(expected))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(start_response().encode_to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), None).unwrap();
        api.start("key", vec!["group-a".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_status_classification() {
        for (status, check) in [
            (401, ConnectError::is_auth as fn(&ConnectError) -> bool),
            (403, ConnectError::is_auth),
            (429, ConnectError::is_connection_limit),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let api = ApiClient::new(server.uri(), None).unwrap();
            let err = api.start("key", vec![]).await.unwrap_err();
            assert!(check(&err), "status {} misclassified: {}", status, err);
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let api = ApiClient::new(server.uri(), None).unwrap();
        match api.start("key", vec![]).await.unwrap_err() {
            ConnectError::Handshake { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_flush_posts_protobuf_reply() {
        let server = MockServer::start().await;
        let reply = SdkResponse {
            request_id: "req-1".to_string(),
            body: b"result".to_vec(),
            ..Default::default()
        };
        Mock::given(method("POST"))
            .and(path("/v0/connect/flush"))
            .and(header("Content-Type", "application/protobuf"))
            .and(wiremock::matchers::body_bytes(reply.encode_to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(
                FlushResponse {
                    request_id: "req-1".to_string(),
                }
                .encode_to_vec(),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(format!("{}/", server.uri()), None).unwrap();
        api.flush("key", &reply).await.unwrap();
    }
}
