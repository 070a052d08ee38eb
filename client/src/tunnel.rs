//! Tunnel connection to the relay.
//!
//! Requests arriving on the tunnel are served concurrently; every outbound
//! frame goes through a single writer task so responses never interleave.

use anyhow::{Context, Result};
use backhaul_shared::protocol::{self, Announcement, TunnelMessage};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::proxy;

/// How long a closing connection waits for queued frames to go out
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Where to connect and what to expose
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay WebSocket URL
    pub relay: String,
    /// Identifier announced to the relay
    pub identifier: String,
    /// Base URL of the local HTTP service
    pub target: String,
}

/// Run one tunnel connection until the relay closes it
pub async fn run(config: &AgentConfig, client: reqwest::Client) -> Result<()> {
    info!("Connecting to relay: {}", config.relay);

    let (ws_stream, _) = connect_async(config.relay.as_str())
        .await
        .context("Failed to connect to relay server")?;
    let (mut write, mut read) = ws_stream.split();

    let announcement = serde_json::to_string(&Announcement::new(config.identifier.clone()))?;
    write.send(Message::Text(announcement)).await?;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  Backhaul Tunnel Active                                      ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Identifier: {:<47} ║", config.identifier);
    println!("║  Local:      {:<47} ║", config.target);
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let (tx, rx) = mpsc::channel::<Message>(256);
    let writer = spawn_writer(write, rx);

    let result = loop {
        match read.next().await {
            Some(Ok(Message::Binary(data))) => handle_frame(&data, config, &client, &tx),
            Some(Ok(Message::Text(text))) => handle_frame(text.as_bytes(), config, &client, &tx),
            Some(Ok(Message::Ping(data))) => {
                let _ = tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("Connection closed by relay");
                break Ok(());
            }
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                break Err(e.into());
            }
            _ => {}
        }
    };

    finish_writer(tx, writer).await;
    result
}

/// Single task that owns the write half; frames go out in queue order
fn spawn_writer<S>(mut sink: S, mut rx: mpsc::Receiver<Message>) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display + Send,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!("Failed to write to relay: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Let the writer flush what is queued (including responses still being
/// produced) before the connection is released.
async fn finish_writer(tx: mpsc::Sender<Message>, mut writer: JoinHandle<()>) {
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        warn!("Writer did not drain within {:?}, dropping queued frames", WRITER_DRAIN);
        writer.abort();
    }
}

fn handle_frame(
    data: &[u8],
    config: &AgentConfig,
    client: &reqwest::Client,
    tx: &mpsc::Sender<Message>,
) {
    let request = match protocol::decode(data) {
        Ok(TunnelMessage::Request(request)) => request,
        Ok(TunnelMessage::Response(resp)) => {
            warn!(request_id = %resp.request_id, "Relay sent a response record, ignoring");
            return;
        }
        Err(e) => {
            warn!("Undecodable frame from relay: {}", e);
            return;
        }
    };

    let client = client.clone();
    let target = config.target.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        info!(request_id = %request.request_id, "Proxying {} {} to {}", request.method, request.path, target);
        let response = proxy::forward(&client, &target, request).await;
        debug!(request_id = %response.request_id, status = response.status_code, "Local service answered");

        match protocol::encode(&TunnelMessage::Response(response)) {
            Ok(bytes) => {
                let _ = tx.send(Message::Binary(bytes)).await;
            }
            Err(e) => error!("Failed to encode response: {}", e),
        }
    });
}
