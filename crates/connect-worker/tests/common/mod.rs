// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for connect-worker integration tests.
//!
//! Provides an in-process gateway (WebSocket side) and a wiremock-backed
//! start/flush API so a real [`WorkerConnection`] can be driven end to end.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use connect_protocol::proto::{
    GatewayConnectionReadyData, GatewayExecutorRequestData, SdkResponse, StartRequest,
    StartResponse, WorkerConnectRequestData, WorkerReplyAckData,
};
use connect_protocol::{Envelope, GatewayMessageType};
use connect_worker::{AppRegistration, ConnectConfig, ExecutionReply, WorkItem, handler_fn};
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const START_PATH: &str = "/v0/connect/start";
pub const FLUSH_PATH: &str = "/v0/connect/flush";
pub const GATEWAY_GROUP: &str = "group-1";
pub const APP_NAME: &str = "shop";

/// How long test helpers wait for something to happen before failing.
pub const WAIT: Duration = Duration::from_secs(5);

/// How the mock gateway treats sockets accepted from now on.
#[derive(Default)]
struct Behaviour {
    /// Sockets left that upgrade but never start the handshake
    silent: AtomicUsize,
    /// Sent right after connection-ready, in the same write
    burst: Mutex<Vec<Envelope>>,
    heartbeat_interval: Mutex<Option<String>>,
    ignore_heartbeats: AtomicBool,
}

/// In-process gateway accepting worker sockets.
pub struct MockGateway {
    pub addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<GatewayConnection>,
    behaviour: Arc<Behaviour>,
}

impl MockGateway {
    /// Bind to an ephemeral port and start accepting sockets.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock gateway");
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();
        let behaviour = Arc::new(Behaviour::default());

        let shared = behaviour.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone(), tx.clone()));
            }
        });

        Self {
            addr,
            connections,
            behaviour,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// The next `count` sockets upgrade but never start the handshake.
    pub fn stay_silent_for(&self, count: usize) {
        self.behaviour.silent.store(count, Ordering::SeqCst);
    }

    /// The next socket receives `envelopes` in the same write as
    /// connection-ready.
    pub fn burst_after_ready(&self, envelopes: Vec<Envelope>) {
        *self.behaviour.burst.lock().unwrap() = envelopes;
    }

    /// Heartbeat interval announced in connection-ready, e.g. `"50ms"`.
    pub fn announce_heartbeat_interval(&self, interval: &str) {
        *self.behaviour.heartbeat_interval.lock().unwrap() = Some(interval.to_string());
    }

    /// Stop answering worker heartbeats.
    pub fn ignore_heartbeats(&self, ignore: bool) {
        self.behaviour
            .ignore_heartbeats
            .store(ignore, Ordering::SeqCst);
    }

    /// Wait for the next worker to finish the handshake.
    pub async fn next_connection(&mut self) -> GatewayConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("Timed out waiting for a worker connection")
            .expect("Mock gateway stopped")
    }
}

/// Gateway side of one established worker socket.
pub struct GatewayConnection {
    /// What the worker announced in its connect message
    pub connect: WorkerConnectRequestData,
    incoming: mpsc::UnboundedReceiver<Envelope>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl GatewayConnection {
    pub fn send(&self, envelope: Envelope) {
        let _ = self.outgoing.send(Message::Binary(envelope.encode()));
    }

    pub fn send_request(&self, request: &GatewayExecutorRequestData) {
        self.send(request_envelope(request));
    }

    pub fn ack_reply(&self, request_id: &str) {
        let ack = WorkerReplyAckData {
            request_id: request_id.to_string(),
        };
        self.send(Envelope::new(GatewayMessageType::WorkerReplyAck, &ack).unwrap());
    }

    pub fn drain(&self) {
        self.send(Envelope::empty(GatewayMessageType::GatewayClosing));
    }

    /// Close the socket from the gateway side.
    pub fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }

    /// Wait for the next envelope of `kind`, skipping everything else.
    pub async fn expect(&mut self, kind: GatewayMessageType) -> Envelope {
        self.try_expect(kind, WAIT)
            .await
            .unwrap_or_else(|| panic!("Timed out waiting for {}", kind.as_str_name()))
    }

    pub async fn try_expect(
        &mut self,
        kind: GatewayMessageType,
        within: Duration,
    ) -> Option<Envelope> {
        tokio::time::timeout(within, async {
            while let Some(envelope) = self.incoming.recv().await {
                if envelope.kind == kind {
                    return Some(envelope);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// The next envelope of any kind, if one arrives in time.
    pub async fn next_envelope(&mut self, within: Duration) -> Option<Envelope> {
        tokio::time::timeout(within, self.incoming.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for a reply and decode it.
    pub async fn expect_reply(&mut self) -> SdkResponse {
        self.expect(GatewayMessageType::WorkerReply)
            .await
            .decode()
            .expect("Failed to decode worker reply")
    }
}

fn echo_subprotocol(req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    if let Some(protocol) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        resp.headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    Ok(resp)
}

async fn serve(
    stream: TcpStream,
    behaviour: Arc<Behaviour>,
    established: mpsc::UnboundedSender<GatewayConnection>,
) {
    let Ok(mut ws) = accept_hdr_async(stream, echo_subprotocol).await else {
        return;
    };

    let silent = behaviour
        .silent
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if silent {
        while let Some(Ok(_)) = ws.next().await {}
        return;
    }

    let hello = Envelope::empty(GatewayMessageType::GatewayHello);
    if ws.send(Message::Binary(hello.encode())).await.is_err() {
        return;
    }

    let connect = loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                let Ok(envelope) = Envelope::decode_from_bytes(&data) else {
                    continue;
                };
                if envelope.kind == GatewayMessageType::WorkerConnect {
                    break envelope
                        .decode::<WorkerConnectRequestData>()
                        .expect("Failed to decode worker connect");
                }
            }
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    let heartbeat_interval = behaviour
        .heartbeat_interval
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| "10s".to_string());
    let ready = GatewayConnectionReadyData {
        heartbeat_interval,
        extend_lease_interval: "5s".to_string(),
    };
    let ready = Envelope::new(GatewayMessageType::GatewayConnectionReady, &ready).unwrap();
    if ws.feed(Message::Binary(ready.encode())).await.is_err() {
        return;
    }
    let burst = std::mem::take(&mut *behaviour.burst.lock().unwrap());
    for envelope in burst {
        if ws.feed(Message::Binary(envelope.encode())).await.is_err() {
            return;
        }
    }
    if ws.flush().await.is_err() {
        return;
    }

    let (mut sink, mut source) = ws.split();
    let (in_tx, incoming) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let _ = established.send(GatewayConnection {
        connect,
        incoming,
        outgoing: out_tx.clone(),
    });

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || is_close {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = source.next().await {
        let Message::Binary(data) = msg else {
            continue;
        };
        let Ok(envelope) = Envelope::decode_from_bytes(&data) else {
            continue;
        };
        if envelope.kind == GatewayMessageType::WorkerHeartbeat
            && !behaviour.ignore_heartbeats.load(Ordering::SeqCst)
        {
            let pong = Envelope::empty(GatewayMessageType::GatewayHeartbeat);
            let _ = out_tx.send(Message::Binary(pong.encode()));
        }
        let _ = in_tx.send(envelope);
    }
}

/// Mount a start endpoint handing out `gateway_url` with a fresh connection
/// id per call, plus an accepting flush endpoint.
pub async fn mount_api(server: &MockServer, gateway_url: &str) {
    let counter = Arc::new(AtomicUsize::new(0));
    let endpoint = gateway_url.to_string();
    Mock::given(method("POST"))
        .and(path(START_PATH))
        .respond_with(move |_: &wiremock::Request| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            ResponseTemplate::new(200).set_body_bytes(start_response(&endpoint, n))
        })
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(FLUSH_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

pub fn start_response(gateway_url: &str, n: usize) -> Vec<u8> {
    StartResponse {
        connection_id: format!("conn-{}", n),
        gateway_endpoint: gateway_url.to_string(),
        gateway_group: GATEWAY_GROUP.to_string(),
        session_token: "session-token".to_string(),
        sync_token: "sync-token".to_string(),
    }
    .encode_to_vec()
}

/// Start requests received by the mock API, decoded.
pub async fn start_requests(server: &MockServer) -> Vec<StartRequest> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == START_PATH)
        .map(|r| StartRequest::decode(r.body.as_slice()).expect("Failed to decode start request"))
        .collect()
}

/// Replies delivered through the flush endpoint, decoded.
pub async fn flushed_replies(server: &MockServer) -> Vec<SdkResponse> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == FLUSH_PATH)
        .map(|r| SdkResponse::decode(r.body.as_slice()).expect("Failed to decode flushed reply"))
        .collect()
}

/// An app whose handler echoes the request payload.
pub fn echo_app() -> AppRegistration {
    AppRegistration::new(
        APP_NAME,
        serde_json::json!([{ "id": "checkout", "name": "Checkout" }]),
        handler_fn(|item: WorkItem| async move { Ok(ExecutionReply::done(item.payload)) }),
    )
}

/// Worker config pointed at the mock API with fast retries and no signal handling.
pub fn test_config(api: &MockServer, app: AppRegistration) -> ConnectConfig {
    ConnectConfig::new("signkey-test-primary", vec![app])
        .with_api_base_url(api.uri())
        .with_instance_id("worker-test")
        .with_shutdown_signals(Vec::new())
        .with_setup_timeout_ms(1_000)
        .with_socket_timeout_ms(1_000)
        .with_reconnect_backoff(Duration::from_millis(20), Duration::from_millis(100))
}

pub fn executor_request(request_id: &str, payload: &[u8]) -> GatewayExecutorRequestData {
    GatewayExecutorRequestData {
        request_id: request_id.to_string(),
        account_id: "acct-1".to_string(),
        env_id: "env-1".to_string(),
        app_id: "app-1".to_string(),
        app_name: APP_NAME.to_string(),
        function_slug: "shop-checkout".to_string(),
        function_id: None,
        step_id: Some("step".to_string()),
        request_payload: payload.to_vec(),
        system_trace_ctx: Vec::new(),
        user_trace_ctx: Vec::new(),
        run_id: format!("run-{}", request_id),
        lease_id: format!("lease-{}", request_id),
    }
}

pub fn request_envelope(request: &GatewayExecutorRequestData) -> Envelope {
    Envelope::new(GatewayMessageType::GatewayExecutorRequest, request).unwrap()
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
