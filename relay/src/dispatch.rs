//! Request dispatch: HTTP request in, correlated tunnel response out.

use std::time::Duration;

use backhaul_shared::protocol::{HeaderMap, TunneledRequest};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, FailureReason, SessionError, TrackerError};
use crate::metrics::{Metrics, Outcome};
use crate::registry::Registry;

/// Inbound HTTP request as seen by the dispatcher
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Response handed back to the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(registry: Registry, metrics: Metrics) -> Self {
        Self { registry, metrics }
    }

    /// Forward `request` to the private server named `identifier` and wait
    /// at most `timeout` for its answer.
    pub async fn dispatch(
        &self,
        identifier: &str,
        request: ProxyRequest,
        timeout: Duration,
    ) -> Result<ProxyResponse, DispatchError> {
        let started = Instant::now();
        let bytes_in = request.body.len() as u64;

        let result = self.forward(identifier, request, timeout).await;

        let (outcome, bytes_out) = match &result {
            Ok(resp) => (Outcome::Ok(resp.status), resp.body.len() as u64),
            Err(DispatchError::ServerUnavailable(_)) => (Outcome::Unavailable, 0),
            Err(DispatchError::RequestTimeout(_)) => (Outcome::Timeout, 0),
            Err(DispatchError::SendFailed(_)) => (Outcome::SendFailed, 0),
            Err(DispatchError::InvalidStatus(_)) => (Outcome::InvalidStatus, 0),
        };
        let latency_us = started.elapsed().as_micros() as u64;
        self.metrics
            .record_dispatch(outcome, latency_us, bytes_in, bytes_out)
            .await;

        result
    }

    async fn forward(
        &self,
        identifier: &str,
        request: ProxyRequest,
        timeout: Duration,
    ) -> Result<ProxyResponse, DispatchError> {
        let session = self.registry.lookup(identifier).ok_or_else(|| {
            info!(%identifier, "private server not found");
            DispatchError::ServerUnavailable(format!("no tunnel for '{}'", identifier))
        })?;

        let request_id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        let pending = session.pending();

        let waiter = match pending.register(request_id.clone(), deadline) {
            Ok(waiter) => waiter,
            Err(TrackerError::Closed(reason)) => {
                return Err(DispatchError::ServerUnavailable(format!(
                    "tunnel for '{}' is closing ({})",
                    identifier, reason
                )));
            }
            Err(e @ TrackerError::DuplicateCorrelationId(_)) => {
                error!(%identifier, %request_id, "correlation id collision");
                return Err(DispatchError::SendFailed(e.to_string()));
            }
        };

        info!(
            %identifier,
            %request_id,
            method = %request.method,
            path = %request.path,
            "dispatching request"
        );

        let tunneled = TunneledRequest {
            request_id: request_id.clone(),
            method: request.method,
            path: request.path,
            query: request.query,
            header: request.headers,
            body: request.body,
        };

        match tokio::time::timeout_at(deadline, session.send(&tunneled)).await {
            Ok(Ok(())) => {}
            Ok(Err(SessionError::SessionClosed)) => {
                pending.fail(&request_id, FailureReason::ConnectionClosed);
                return Err(DispatchError::ServerUnavailable(format!(
                    "tunnel for '{}' closed",
                    identifier
                )));
            }
            Ok(Err(e)) => {
                pending.fail(&request_id, FailureReason::ConnectionClosed);
                warn!(%identifier, %request_id, error = %e, "failed to send request to private server");
                return Err(DispatchError::SendFailed(e.to_string()));
            }
            Err(_) => {
                // A write that outlives the deadline leaves the transport unusable
                pending.expire(&request_id);
                warn!(%identifier, %request_id, "tunnel write stalled past deadline");
                let stalled = session.clone();
                tokio::spawn(async move {
                    stalled.close(FailureReason::ConnectionClosed).await;
                });
                return Err(DispatchError::RequestTimeout(timeout));
            }
        }

        debug!(%identifier, %request_id, "waiting for response from private server");

        match waiter.wait().await {
            Ok(response) => {
                if !(100..=999).contains(&response.status_code) {
                    warn!(%identifier, %request_id, status = response.status_code, "invalid status from private server");
                    return Err(DispatchError::InvalidStatus(response.status_code));
                }
                info!(%identifier, %request_id, status = response.status_code, "received response from private server");
                Ok(ProxyResponse {
                    status: response.status_code,
                    headers: response.header,
                    body: response.body,
                })
            }
            Err(FailureReason::Timeout) => {
                info!(%identifier, %request_id, ?timeout, "request timed out");
                Err(DispatchError::RequestTimeout(timeout))
            }
            Err(reason) => {
                info!(%identifier, %request_id, %reason, "tunnel went away before responding");
                Err(DispatchError::ServerUnavailable(format!(
                    "tunnel for '{}' {}",
                    identifier, reason
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_transport::{pair, Peer};
    use crate::session::{serve_connection, Frame, SessionOptions, TunnelSession};
    use backhaul_shared::protocol::TunneledResponse;
    use std::sync::Arc;

    fn options(probe_interval: Duration) -> SessionOptions {
        SessionOptions {
            probe_interval,
            handshake_timeout: Duration::from_secs(1),
            idle_timeout: None,
        }
    }

    async fn wait_for_session(
        registry: &Registry,
        identifier: &str,
        replacing: Option<&Arc<TunnelSession>>,
    ) -> Arc<TunnelSession> {
        for _ in 0..200 {
            if let Some(session) = registry.lookup(identifier) {
                if replacing.map_or(true, |old| !Arc::ptr_eq(old, &session)) {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {} never registered", identifier);
    }

    async fn connect(registry: &Registry, identifier: &str, probe_interval: Duration) -> Peer {
        let (peer, inbound, outbound) = pair();
        peer.announce(identifier).await;
        tokio::spawn(serve_connection(
            inbound,
            outbound,
            registry.clone(),
            Metrics::new(),
            options(probe_interval),
        ));
        peer
    }

    fn get(path: &str) -> ProxyRequest {
        ProxyRequest {
            method: "GET".into(),
            path: path.into(),
            ..Default::default()
        }
    }

    fn reply(request: &TunneledRequest, status: u16, body: &[u8]) -> TunneledResponse {
        TunneledResponse {
            request_id: request.request_id.clone(),
            status_code: status,
            header: Default::default(),
            body: body.to_vec(),
        }
    }

    /// Drain frames until the relay releases the connection, reporting
    /// whether a close frame was seen on the way.
    async fn saw_close(peer: &mut Peer) -> bool {
        let mut closed = false;
        while let Some(frame) = peer.from_relay.recv().await {
            if frame == Frame::Close {
                closed = true;
            }
        }
        closed
    }

    #[tokio::test]
    async fn test_unknown_identifier_is_unavailable_immediately() {
        let dispatcher = Dispatcher::new(Registry::new(), Metrics::new());
        let started = Instant::now();
        let result = dispatcher
            .dispatch("nobody", get("/"), Duration::from_secs(10))
            .await;
        assert!(matches!(result, Err(DispatchError::ServerUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let registry = Registry::new();
        let dispatcher = Dispatcher::new(registry.clone(), Metrics::new());
        let mut peer = connect(&registry, "srv1", Duration::from_secs(3)).await;
        wait_for_session(&registry, "srv1", None).await;

        let call = tokio::spawn(async move {
            dispatcher
                .dispatch("srv1", get("/x"), Duration::from_secs(5))
                .await
        });

        let request = peer.next_request().await.unwrap();
        assert_eq!(request.path, "/x");
        assert_eq!(request.method, "GET");
        peer.respond(reply(&request, 200, b"ok")).await;

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_not_cross_delivered() {
        let registry = Registry::new();
        let dispatcher = Dispatcher::new(registry.clone(), Metrics::new());
        let mut peer = connect(&registry, "srv1", Duration::from_secs(3)).await;
        wait_for_session(&registry, "srv1", None).await;

        let mut calls = Vec::new();
        for i in 0..100 {
            let dispatcher = dispatcher.clone();
            calls.push(tokio::spawn(async move {
                let resp = dispatcher
                    .dispatch("srv1", get(&format!("/item/{}", i)), Duration::from_secs(10))
                    .await
                    .unwrap();
                (i, resp)
            }));
        }

        // Answer in reverse arrival order
        let mut requests = Vec::new();
        for _ in 0..100 {
            requests.push(peer.next_request().await.unwrap());
        }
        for request in requests.iter().rev() {
            peer.respond(reply(request, 200, request.path.as_bytes())).await;
        }

        for call in calls {
            let (i, resp) = call.await.unwrap();
            assert_eq!(resp.body, format!("/item/{}", i).into_bytes());
        }
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_dropped() {
        let registry = Registry::new();
        let dispatcher = Dispatcher::new(registry.clone(), Metrics::new());
        let mut peer = connect(&registry, "srv1", Duration::from_secs(3)).await;
        let session = wait_for_session(&registry, "srv1", None).await;

        let started = Instant::now();
        let call = tokio::spawn(async move {
            dispatcher
                .dispatch("srv1", get("/slow"), Duration::from_millis(200))
                .await
        });
        let request = peer.next_request().await.unwrap();

        let result = call.await.unwrap();
        let elapsed = started.elapsed();
        assert!(matches!(result, Err(DispatchError::RequestTimeout(_))));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(800));

        peer.respond(reply(&request, 200, b"late")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.pending().is_empty());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_old_session() {
        let registry = Registry::new();
        let dispatcher = Dispatcher::new(registry.clone(), Metrics::new());
        let mut old_peer = connect(&registry, "srv1", Duration::from_secs(3)).await;
        let old_session = wait_for_session(&registry, "srv1", None).await;

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch("srv1", get("/pending"), Duration::from_secs(10))
                    .await
            })
        };
        old_peer.next_request().await.unwrap();

        let mut new_peer = connect(&registry, "srv1", Duration::from_secs(3)).await;
        wait_for_session(&registry, "srv1", Some(&old_session)).await;

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DispatchError::ServerUnavailable(_))));
        assert!(saw_close(&mut old_peer).await);

        // The new connection serves traffic
        let call = tokio::spawn(async move {
            dispatcher
                .dispatch("srv1", get("/fresh"), Duration::from_secs(5))
                .await
        });
        let request = new_peer.next_request().await.unwrap();
        assert_eq!(request.path, "/fresh");
        new_peer.respond(reply(&request, 201, b"")).await;
        assert_eq!(call.await.unwrap().unwrap().status, 201);
    }

    #[tokio::test]
    async fn test_session_death_fails_pending() {
        let registry = Registry::new();
        let dispatcher = Dispatcher::new(registry.clone(), Metrics::new());
        let mut peer = connect(&registry, "srv1", Duration::from_secs(3)).await;
        wait_for_session(&registry, "srv1", None).await;

        let mut calls = Vec::new();
        for i in 0..5 {
            let dispatcher = dispatcher.clone();
            calls.push(tokio::spawn(async move {
                dispatcher
                    .dispatch("srv1", get(&format!("/{}", i)), Duration::from_secs(10))
                    .await
            }));
        }
        for _ in 0..5 {
            peer.next_request().await.unwrap();
        }
        drop(peer);

        for call in calls {
            let result = tokio::time::timeout(Duration::from_millis(500), call)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(DispatchError::ServerUnavailable(_))));
        }
        assert!(registry.lookup("srv1").is_none());
    }

    #[tokio::test]
    async fn test_write_failure_is_send_failed() {
        let registry = Registry::new();
        let dispatcher = Dispatcher::new(registry.clone(), Metrics::new());
        let Peer { to_relay, from_relay } = connect(&registry, "srv1", Duration::from_secs(60)).await;
        let session = wait_for_session(&registry, "srv1", None).await;

        // Peer stops reading but keeps its write half open
        drop(from_relay);
        let result = dispatcher
            .dispatch("srv1", get("/"), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(DispatchError::SendFailed(_))));
        assert!(session.is_closed());
        assert!(session.pending().is_empty());
        drop(to_relay);
    }

    #[tokio::test]
    async fn test_invalid_status_rejected() {
        let registry = Registry::new();
        let dispatcher = Dispatcher::new(registry.clone(), Metrics::new());
        let mut peer = connect(&registry, "srv1", Duration::from_secs(3)).await;
        wait_for_session(&registry, "srv1", None).await;

        let call = tokio::spawn(async move {
            dispatcher
                .dispatch("srv1", get("/"), Duration::from_secs(5))
                .await
        });
        let request = peer.next_request().await.unwrap();
        peer.respond(reply(&request, 42, b"")).await;

        assert!(matches!(
            call.await.unwrap(),
            Err(DispatchError::InvalidStatus(42))
        ));
    }
}
