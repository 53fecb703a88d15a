//! Session lifecycle controller.
//!
//! Owns at most one transport session and moves it through
//! `Idle -> Connecting -> Open -> Closed`. Overlapping `connect()` calls share
//! one in-flight attempt. `disconnect()` is final for the current session:
//! nothing reconnects automatically.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use task_bridge_core::{BridgeConfig, BridgeError, Command, ConfigError, config::validate_endpoint};
use task_bridge_transport::{CloseInfo, Connector, Signals, TransportSession, TransportSignal};
use tokio::sync::watch;

use crate::demux::{BridgeEvent, CloseCause, Demultiplexer, SessionClosed, Subscription};
use crate::dispatcher;

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), BridgeError>>>;

/// Observable session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

enum Phase {
    Idle,
    Connecting(ConnectAttempt),
    Open(TransportSession),
    Closed,
}

struct Slot {
    phase: Phase,
    /// Bumped by every new attempt and every `disconnect()`. Signals from an
    /// older generation are stale.
    generation: u64,
    /// Generation of a dead session replaced by `connect()` before its
    /// close signal was read. That close still gets reported.
    orphaned: Option<u64>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: Mutex<BridgeConfig>,
    slot: Mutex<Slot>,
    state: watch::Sender<SessionState>,
    demux: Demultiplexer,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config(&self) -> MutexGuard<'_, BridgeConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn disconnect(&self, slot: &mut Slot) {
        let closing = slot.generation;
        slot.generation += 1;
        match std::mem::replace(&mut slot.phase, Phase::Idle) {
            Phase::Open(session) => {
                tracing::info!("Disconnecting from {}", session.url());
                session.close();
                self.demux.publish(BridgeEvent::Closed(SessionClosed {
                    session: closing,
                    code: CloseInfo::normal().code,
                    reason: String::new(),
                    cause: CloseCause::Manual,
                }));
            }
            Phase::Connecting(_) => tracing::info!("Abandoning connection attempt"),
            Phase::Idle | Phase::Closed => {}
        }
        self.set_state(SessionState::Idle);
    }

    fn on_closed(&self, generation: u64, info: CloseInfo) {
        let mut slot = self.slot();
        let current = slot.generation == generation;
        if current {
            slot.phase = Phase::Closed;
        } else if slot.orphaned == Some(generation) {
            slot.orphaned = None;
        } else {
            tracing::debug!("Ignoring close of stale session ({})", info.code);
            return;
        }

        let cause = if info.is_normal() {
            tracing::info!("Session closed by peer: {}", info.reason);
            CloseCause::Peer
        } else {
            tracing::warn!("Session closed unexpectedly ({}): {}", info.code, info.reason);
            CloseCause::Unexpected
        };
        if current {
            self.set_state(SessionState::Closed);
        }
        self.demux.publish(BridgeEvent::Closed(SessionClosed {
            session: generation,
            code: info.code,
            reason: info.reason,
            cause,
        }));
    }
}

/// Session lifecycle controller. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Create a controller over any connector.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: BridgeConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                connector,
                config: Mutex::new(config),
                slot: Mutex::new(Slot {
                    phase: Phase::Idle,
                    generation: 0,
                    orphaned: None,
                }),
                state,
                demux: Demultiplexer::new(),
            }),
        }
    }

    /// Create a controller that connects over WebSocket.
    #[must_use]
    pub fn websocket(config: BridgeConfig) -> Self {
        Self::new(Arc::new(task_bridge_transport::WsConnector::new()), config)
    }

    /// Open the session unless it is already open.
    ///
    /// Resolves once the transport is open. Concurrent callers share the
    /// same attempt.
    ///
    /// # Errors
    /// Returns `ConnectionTimeout`, `Transport`, or `ConnectionAborted` if a
    /// `disconnect()` overtook the handshake.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let attempt = {
            let mut slot = self.inner.slot();
            match &slot.phase {
                Phase::Open(session) if session.is_open() => return Ok(()),
                Phase::Connecting(attempt) => attempt.clone(),
                _ => {
                    if matches!(slot.phase, Phase::Open(_)) {
                        slot.orphaned = Some(slot.generation);
                    }
                    slot.generation += 1;
                    let generation = slot.generation;
                    let (url, timeout) = {
                        let config = self.inner.config();
                        (config.endpoint_url.clone(), config.connect_timeout)
                    };
                    let handle = tokio::spawn(establish(
                        Arc::clone(&self.inner),
                        generation,
                        url,
                        timeout,
                    ));
                    let attempt = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(BridgeError::Transport(format!("connect task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    slot.phase = Phase::Connecting(attempt.clone());
                    self.inner.set_state(SessionState::Connecting);
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Close the session on purpose and return to `Idle`.
    ///
    /// Abandons an in-flight handshake. Safe to call in any state.
    pub fn disconnect(&self) {
        let mut slot = self.inner.slot();
        self.inner.disconnect(&mut slot);
    }

    /// Like [`disconnect`](Self::disconnect), but only while `session` is
    /// still the latest one. Returns whether anything was closed.
    pub fn disconnect_session(&self, session: u64) -> bool {
        let mut slot = self.inner.slot();
        if slot.generation != session {
            return false;
        }
        self.inner.disconnect(&mut slot);
        true
    }

    /// Send one command on the open session.
    ///
    /// # Errors
    /// Returns `BridgeError::NotConnected` unless the session is open. Never
    /// buffers.
    pub fn send_command(&self, command: &Command) -> Result<(), BridgeError> {
        let slot = self.inner.slot();
        match &slot.phase {
            Phase::Open(session) => dispatcher::dispatch(session, command),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Id of the open session, if any. Matches `SessionClosed::session`.
    #[must_use]
    pub fn session(&self) -> Option<u64> {
        let slot = self.inner.slot();
        match &slot.phase {
            Phase::Open(session) if session.is_open() => Some(slot.generation),
            _ => None,
        }
    }

    /// Change the endpoint used by the next `connect()`.
    ///
    /// # Errors
    /// Returns error if the URL is not `ws://` or `wss://`.
    pub fn set_endpoint(&self, url: &str) -> Result<(), ConfigError> {
        let url = validate_endpoint(url)?;
        tracing::info!("Endpoint set to {url}");
        self.inner.config().endpoint_url = url;
        Ok(())
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        self.inner.config().endpoint_url.clone()
    }

    #[must_use]
    pub fn config(&self) -> BridgeConfig {
        self.inner.config().clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Watch state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to lifecycle and inbound events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.inner.demux.subscribe()
    }

    /// Inbound frames dropped as malformed.
    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.inner.demux.malformed_count()
    }
}

async fn establish(
    inner: Arc<Inner>,
    generation: u64,
    url: String,
    timeout: std::time::Duration,
) -> Result<(), BridgeError> {
    tracing::info!("Connecting to {url}");
    let result = TransportSession::open(inner.connector.as_ref(), &url, timeout).await;

    let mut slot = inner.slot();
    if slot.generation != generation {
        if let Ok((session, _)) = result {
            session.close();
        }
        return Err(BridgeError::ConnectionAborted);
    }

    match result {
        Ok((session, signals)) => {
            slot.phase = Phase::Open(session);
            inner.set_state(SessionState::Open);
            inner.demux.publish(BridgeEvent::Connected);
            tokio::spawn(read_loop(Arc::clone(&inner), generation, signals));
            Ok(())
        }
        Err(e) => {
            tracing::warn!("Connection to {url} failed: {e}");
            slot.phase = Phase::Idle;
            inner.set_state(SessionState::Idle);
            Err(e.into())
        }
    }
}

/// Forward frames to the demultiplexer in arrival order.
async fn read_loop(inner: Arc<Inner>, generation: u64, mut signals: Signals) {
    while let Some(signal) = signals.recv().await {
        match signal {
            TransportSignal::Message(raw) => {
                if inner.slot().generation != generation {
                    continue;
                }
                inner.demux.route(&raw);
            }
            TransportSignal::Closed(info) => {
                inner.on_closed(generation, info);
                return;
            }
        }
    }
    inner.on_closed(generation, CloseInfo::abnormal("transport task ended"));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use task_bridge_core::{InboundEvent, TaskRequest};
    use task_bridge_transport::LoopbackConnector;

    use super::*;

    fn controller() -> (
        SessionController,
        LoopbackConnector,
        task_bridge_transport::LoopbackListener,
    ) {
        let (connector, listener) = LoopbackConnector::new();
        let config = BridgeConfig::with_endpoint("ws://loop/ws").unwrap();
        let controller = SessionController::new(Arc::new(connector.clone()), config);
        (controller, connector, listener)
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_transport() {
        let (controller, connector, mut listener) = controller();
        connector.accept_after(Some(Duration::from_millis(50)));

        let (a, b, c) = tokio::join!(
            controller.connect(),
            controller.connect(),
            controller.connect()
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(connector.attempts(), 1);
        assert_eq!(controller.state(), SessionState::Open);

        controller.connect().await.unwrap();
        assert_eq!(connector.attempts(), 1);
        assert!(listener.try_accept().is_some());
        assert!(listener.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_send_without_session_fails_fast() {
        let (controller, connector, _listener) = controller();
        let command = TaskRequest::new("SCRAPE").to_command().unwrap();

        assert_eq!(
            controller.send_command(&command),
            Err(BridgeError::NotConnected)
        );
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_session_open() {
        let (controller, _connector, mut listener) = controller();
        let mut events = controller.subscribe();
        controller.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(BridgeEvent::Connected));

        peer.send_raw("{{{ not json");
        peer.send_json(&json!({"type": "TASK_LOG", "line": "still here"}));

        let Some(BridgeEvent::Inbound(InboundEvent::TaskLog { line, .. })) = events.recv().await
        else {
            panic!("expected a log event");
        };
        assert_eq!(line, "still here");
        assert_eq!(controller.malformed_count(), 1);
        assert!(controller.is_open());
    }

    #[tokio::test]
    async fn test_unexpected_close_is_distinct() {
        let (controller, _connector, mut listener) = controller();
        let mut events = controller.subscribe();
        controller.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();
        let _ = events.recv().await;

        peer.close(1006, "");
        assert_eq!(
            events.recv().await,
            Some(BridgeEvent::Closed(SessionClosed {
                session: 1,
                code: 1006,
                reason: String::new(),
                cause: CloseCause::Unexpected,
            }))
        );
        assert_eq!(controller.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_normal_close() {
        let (controller, _connector, mut listener) = controller();
        let mut events = controller.subscribe();
        controller.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();
        let _ = events.recv().await;

        peer.close(1000, "bye");
        let Some(BridgeEvent::Closed(closed)) = events.recv().await else {
            panic!("expected a close event");
        };
        assert_eq!(closed.cause, CloseCause::Peer);
    }

    #[tokio::test]
    async fn test_disconnect_is_manual_and_resets() {
        let (controller, connector, mut listener) = controller();
        let mut events = controller.subscribe();
        controller.connect().await.unwrap();
        let mut peer = listener.accept().await.unwrap();
        let _ = events.recv().await;

        controller.disconnect();
        assert_eq!(controller.state(), SessionState::Idle);
        let Some(BridgeEvent::Closed(closed)) = events.recv().await else {
            panic!("expected a close event");
        };
        assert_eq!(closed.cause, CloseCause::Manual);

        // The transport's own close signal is stale and must not surface.
        assert_eq!(peer.recv().await, None);
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_none());

        controller.disconnect();
        controller.connect().await.unwrap();
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_session_spares_newer_session() {
        let (controller, _connector, mut listener) = controller();
        controller.connect().await.unwrap();
        let old = controller.session().unwrap();
        let peer = listener.accept().await.unwrap();

        peer.close(1006, "");
        let mut state = controller.watch_state();
        state.wait_for(|s| *s == SessionState::Closed).await.unwrap();
        controller.connect().await.unwrap();

        assert!(!controller.disconnect_session(old));
        assert!(controller.is_open());
        let current = controller.session().unwrap();
        assert!(controller.disconnect_session(current));
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_aborts_pending_connect() {
        let (controller, connector, _listener) = controller();
        connector.accept_after(Some(Duration::from_millis(50)));

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.state(), SessionState::Connecting);
        controller.disconnect();

        assert_eq!(
            pending.await.unwrap(),
            Err(BridgeError::ConnectionAborted)
        );
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let (controller, connector, _listener) = controller();
        connector.unreachable();

        let started = tokio::time::Instant::now();
        let err = controller.connect().await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::ConnectionTimeout {
                timeout: Duration::from_secs(10)
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_reconnect_still_reports_pending_close() {
        let connector = Arc::new(crate::testing::ManualConnector::default());
        let config = BridgeConfig::with_endpoint("ws://loop/ws").unwrap();
        let controller = SessionController::new(connector.clone(), config);
        let mut events = controller.subscribe();
        controller.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(BridgeEvent::Connected));

        // The link dies, but its close is still queued when a new connect arrives.
        let (outbound_rx, signals_tx) = connector.take(0);
        signals_tx
            .send(TransportSignal::Closed(CloseInfo::abnormal("")))
            .unwrap();
        drop(outbound_rx);

        let mut reconnect = Box::pin(controller.connect());
        assert!(futures::poll!(&mut reconnect).is_pending());

        let closed = loop {
            match events.recv().await {
                Some(BridgeEvent::Closed(closed)) => break closed,
                Some(_) => {}
                None => panic!("subscription ended"),
            }
        };
        assert_eq!(closed.session, 1);
        assert_eq!(closed.code, 1006);
        assert_eq!(closed.cause, CloseCause::Unexpected);

        reconnect.await.unwrap();
        assert_eq!(controller.state(), SessionState::Open);
        assert_eq!(controller.session(), Some(2));
        assert_eq!(connector.open_links(), 1);
    }

    #[tokio::test]
    async fn test_set_endpoint_applies_on_next_connect() {
        let (controller, _connector, mut listener) = controller();
        assert!(controller.set_endpoint("http://nope").is_err());
        controller.set_endpoint("ws://other/ws").unwrap();
        controller.connect().await.unwrap();
        assert_eq!(listener.accept().await.unwrap().url(), "ws://other/ws");
    }
}
