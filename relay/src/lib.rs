//! Backhaul Relay
//!
//! Public HTTP front for private servers that can only dial out. Each
//! private server keeps one WebSocket tunnel open; requests carrying its
//! identifier header are forwarded down that tunnel and answered with the
//! correlated response.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod pending;
pub mod proxy;
pub mod registry;
pub mod session;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use backhaul_shared::protocol::MAX_MESSAGE_SIZE;
use futures_util::{future, SinkExt, StreamExt};

use config::BrokerConfig;
use dispatch::Dispatcher;
use error::TransportError;
use metrics::Metrics;
use registry::Registry;
use session::{Frame, FrameSink, FrameStream};

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub dispatcher: Dispatcher,
    pub metrics: Metrics,
    pub config: Arc<BrokerConfig>,
}

impl AppState {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Registry::new();
        let metrics = Metrics::new();
        Self {
            dispatcher: Dispatcher::new(registry.clone(), metrics.clone()),
            registry,
            metrics,
            config: Arc::new(config),
        }
    }
}

/// Build the relay router: tunnel endpoint, health, metrics, and the
/// catch-all proxy.
pub fn app(state: AppState) -> Router {
    let tunnel_path = state.config.tunnel.path.clone();
    Router::new()
        .route(&tunnel_path, get(ws_handler))
        .route("/_backhaul/health", get(|| async { "OK" }))
        .route("/_backhaul/metrics", get(metrics_handler))
        .fallback(proxy::proxy_handler)
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.to_prometheus().await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();

    let inbound: FrameStream =
        Box::pin(stream.map(|msg| msg.map(Frame::from).map_err(TransportError::from)));
    let outbound: FrameSink = Box::pin(
        sink.with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame)))),
    );

    session::serve_connection(
        inbound,
        outbound,
        state.registry.clone(),
        state.metrics.clone(),
        state.config.session_options(),
    )
    .await;
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}
