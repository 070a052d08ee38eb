//! Tunnel sessions for Backhaul Relay
//!
//! A session owns one physical tunnel connection. It serializes writes
//! (request frames and liveness probes), demultiplexes inbound responses
//! into its pending-request table, and tears itself down exactly once.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backhaul_shared::protocol::{self, Announcement, TunnelMessage, TunneledRequest};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{FailureReason, SessionError, TransportError};
use crate::metrics::Metrics;
use crate::pending::PendingRequests;
use crate::registry::Registry;

/// How long teardown waits to flush a close frame to the peer
const CLOSE_GRACE: Duration = Duration::from_secs(2);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Transport-neutral frame carried by a tunnel connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// Timing knobs for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Interval between liveness probes
    pub probe_interval: Duration,
    /// How long a new connection may take to announce itself
    pub handshake_timeout: Duration,
    /// Close the session when nothing has been received for this long
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
        }
    }
}

/// Represents one live tunnel connection
pub struct TunnelSession {
    identifier: String,
    session_id: u64,
    /// `None` once the connection has been released
    writer: tokio::sync::Mutex<Option<FrameSink>>,
    pending: Arc<PendingRequests>,
    state: Mutex<SessionState>,
    last_seen: Mutex<Instant>,
    shutdown: Notify,
    registry: Registry,
    metrics: Metrics,
    options: SessionOptions,
    created_at: Instant,
}

impl TunnelSession {
    pub fn new(
        identifier: String,
        writer: FrameSink,
        registry: Registry,
        metrics: Metrics,
        options: SessionOptions,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            identifier,
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: PendingRequests::new(),
            state: Mutex::new(SessionState::Active),
            last_seen: Mutex::new(now),
            shutdown: Notify::new(),
            registry,
            metrics,
            options,
            created_at: now,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    pub fn state(&self) -> SessionState {
        *self.state_guard()
    }

    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Active
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn state_guard(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Push a request record to the private server.
    ///
    /// A transport failure closes the session.
    pub async fn send(&self, request: &TunneledRequest) -> Result<(), SessionError> {
        let data = protocol::encode(&TunnelMessage::Request(request.clone()))
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        match self.send_frame(Frame::Binary(data)).await {
            Err(SessionError::Transport(e)) => {
                warn!(
                    identifier = %self.identifier,
                    session_id = self.session_id,
                    error = %e,
                    "write to tunnel failed"
                );
                self.close(FailureReason::ConnectionClosed).await;
                Err(SessionError::Transport(e))
            }
            other => other,
        }
    }

    /// One write at a time; refused once teardown has begun
    async fn send_frame(&self, frame: Frame) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(SessionError::SessionClosed)?;
        if let Err(e) = sink.send(frame).await {
            // A sink that failed once is not written to again
            writer.take();
            return Err(SessionError::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Tear the session down. Only the first caller does any work.
    pub async fn close(&self, reason: FailureReason) -> bool {
        {
            let mut state = self.state_guard();
            if *state != SessionState::Active {
                return false;
            }
            *state = SessionState::Closing;
        }

        let failed = self.pending.fail_all(reason);
        info!(
            identifier = %self.identifier,
            session_id = self.session_id,
            %reason,
            failed_requests = failed,
            "closing tunnel session"
        );

        self.registry.unregister_if_current(&self.identifier, self);
        self.shutdown.notify_one();

        match tokio::time::timeout(CLOSE_GRACE, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(mut sink) = writer.take() {
                    let _ = tokio::time::timeout(CLOSE_GRACE, async {
                        let _ = sink.send(Frame::Close).await;
                        let _ = sink.close().await;
                    })
                    .await;
                }
            }
            Err(_) => warn!(
                identifier = %self.identifier,
                session_id = self.session_id,
                "writer busy during teardown, connection released on drop"
            ),
        }

        *self.state_guard() = SessionState::Closed;
        true
    }

    /// Drive the inbound loop and liveness probe until the connection ends.
    pub async fn run(self: Arc<Self>, mut inbound: FrameStream) {
        let interval = self.options.probe_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                frame = inbound.next() => match frame {
                    Some(Ok(frame)) => {
                        self.touch();
                        if !self.handle_frame(frame).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(identifier = %self.identifier, session_id = self.session_id, error = %e, "tunnel read error");
                        break;
                    }
                    None => {
                        debug!(identifier = %self.identifier, session_id = self.session_id, "tunnel stream ended");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.probe().await {
                        break;
                    }
                }
            }
        }

        self.close(FailureReason::ConnectionClosed).await;
    }

    /// Returns false when the session should close
    async fn handle_frame(&self, frame: Frame) -> bool {
        let data = match frame {
            Frame::Text(text) => text.into_bytes(),
            Frame::Binary(data) => data,
            Frame::Ping(payload) => return self.send_control(Frame::Pong(payload)).await,
            Frame::Pong(_) => return true,
            Frame::Close => {
                debug!(identifier = %self.identifier, session_id = self.session_id, "peer closed tunnel");
                return false;
            }
        };

        match protocol::decode(&data) {
            Ok(TunnelMessage::Response(response)) => {
                let request_id = response.request_id.clone();
                if !self.pending.resolve(response) {
                    info!(
                        identifier = %self.identifier,
                        %request_id,
                        "response for unknown or expired request dropped"
                    );
                }
                true
            }
            Ok(TunnelMessage::Request(request)) => {
                warn!(
                    identifier = %self.identifier,
                    request_id = %request.request_id,
                    "private server sent a request record, ignoring"
                );
                true
            }
            Err(e) => {
                warn!(identifier = %self.identifier, session_id = self.session_id, error = %e, "closing session on undecodable frame");
                self.metrics.malformed_frame();
                false
            }
        }
    }

    /// Liveness tick: idle check, deadline sweep, ping
    async fn probe(&self) -> bool {
        let now = Instant::now();
        if let Some(idle) = self.options.idle_timeout {
            let silent_for = now.saturating_duration_since(self.last_seen());
            if silent_for >= idle {
                warn!(
                    identifier = %self.identifier,
                    session_id = self.session_id,
                    ?silent_for,
                    "tunnel idle, closing"
                );
                return false;
            }
        }

        let expired = self.pending.expire_overdue(now);
        if expired > 0 {
            debug!(identifier = %self.identifier, expired, "swept overdue requests");
        }

        self.send_control(Frame::Ping(Vec::new())).await
    }

    /// Write a Ping or Pong from the run loop. The write is bounded by the
    /// probe interval and gives way to `close()`; false means the session
    /// should close.
    async fn send_control(&self, frame: Frame) -> bool {
        let bound = self.options.probe_interval;
        tokio::select! {
            _ = self.shutdown.notified() => false,
            result = tokio::time::timeout(bound, self.send_frame(frame)) => match result {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(identifier = %self.identifier, session_id = self.session_id, error = %e, "control frame write failed");
                    false
                }
                Err(_) => {
                    warn!(identifier = %self.identifier, session_id = self.session_id, ?bound, "peer stopped reading, control frame write stalled");
                    false
                }
            },
        }
    }
}

/// Wait for the identifier announcement that opens every tunnel
pub async fn handshake(
    inbound: &mut FrameStream,
    timeout: Duration,
) -> Result<Announcement, SessionError> {
    let wait = async {
        loop {
            match inbound.next().await {
                Some(Ok(Frame::Text(text))) => break decode_announcement(text.as_bytes()),
                Some(Ok(Frame::Binary(data))) => break decode_announcement(&data),
                Some(Ok(Frame::Ping(_))) | Some(Ok(Frame::Pong(_))) => continue,
                Some(Ok(Frame::Close)) | None => {
                    break Err(SessionError::Handshake("connection closed".into()))
                }
                Some(Err(e)) => break Err(SessionError::Transport(e.to_string())),
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| SessionError::Handshake(format!("no announcement within {:?}", timeout)))?
}

fn decode_announcement(data: &[u8]) -> Result<Announcement, SessionError> {
    protocol::decode_announcement(data).map_err(|e| SessionError::Handshake(e.to_string()))
}

/// Full lifecycle of one accepted tunnel connection
pub async fn serve_connection(
    mut inbound: FrameStream,
    mut outbound: FrameSink,
    registry: Registry,
    metrics: Metrics,
    options: SessionOptions,
) {
    let announcement = match handshake(&mut inbound, options.handshake_timeout).await {
        Ok(announcement) => announcement,
        Err(e) => {
            warn!(error = %e, "tunnel handshake failed");
            let _ = tokio::time::timeout(CLOSE_GRACE, outbound.close()).await;
            return;
        }
    };

    let session = TunnelSession::new(
        announcement.private_server_id,
        outbound,
        registry.clone(),
        metrics.clone(),
        options,
    );

    if let Some(previous) = registry.register(Arc::clone(&session)) {
        metrics.session_superseded();
        previous.close(FailureReason::Superseded).await;
    }

    metrics.session_opened();
    Arc::clone(&session).run(inbound).await;
    metrics.session_closed();

    info!(
        identifier = %session.identifier(),
        session_id = session.session_id(),
        uptime = ?session.uptime(),
        "tunnel connection finished"
    );
}
