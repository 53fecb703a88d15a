//! In-process loopback connector.
//!
//! Each accepted link hands a [`RemotePeer`] to the [`LoopbackListener`],
//! which plays the worker cluster: it reads the client's frames and pushes
//! events, malformed frames, or a close back.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{CloseInfo, Outbound, TransportError, TransportSignal};
use crate::session::{Connector, Link};

#[derive(Debug, Clone)]
enum Mode {
    Accept { delay: Option<Duration> },
    Refuse(String),
    Unreachable,
}

struct Shared {
    mode: Mutex<Mode>,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<RemotePeer>,
}

/// Connector whose links end inside the same process.
#[derive(Clone)]
pub struct LoopbackConnector {
    shared: Arc<Shared>,
}

/// Receives the remote end of every accepted link.
pub struct LoopbackListener {
    rx: mpsc::UnboundedReceiver<RemotePeer>,
}

impl LoopbackListener {
    /// Next accepted link.
    pub async fn accept(&mut self) -> Option<RemotePeer> {
        self.rx.recv().await
    }

    /// Accepted link, if one is already waiting.
    pub fn try_accept(&mut self) -> Option<RemotePeer> {
        self.rx.try_recv().ok()
    }
}

impl LoopbackConnector {
    /// Create a connector that accepts immediately.
    #[must_use]
    pub fn new() -> (Self, LoopbackListener) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(Shared {
                mode: Mutex::new(Mode::Accept { delay: None }),
                attempts: AtomicUsize::new(0),
                peers,
            }),
        };
        (connector, LoopbackListener { rx })
    }

    fn set_mode(&self, mode: Mode) {
        *self.shared.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    /// Accept links, optionally after a handshake delay.
    pub fn accept_after(&self, delay: Option<Duration>) {
        self.set_mode(Mode::Accept { delay });
    }

    /// Fail every handshake with `message`.
    pub fn refuse(&self, message: impl Into<String>) {
        self.set_mode(Mode::Refuse(message.into()));
    }

    /// Never finish a handshake.
    pub fn unreachable(&self) {
        self.set_mode(Mode::Unreachable);
    }

    /// Number of handshakes started so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = self
            .shared
            .mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match mode {
            Mode::Refuse(message) => return Err(TransportError::Refused(message)),
            Mode::Unreachable => futures::future::pending::<()>().await,
            Mode::Accept { delay: Some(delay) } => tokio::time::sleep(delay).await,
            Mode::Accept { delay: None } => {}
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let peer = RemotePeer {
            url: url.to_string(),
            inbox: inbox_rx,
            signals: sig_tx.clone(),
            closed: closed.clone(),
        };
        self.shared
            .peers
            .send(peer)
            .map_err(|_| TransportError::Refused("loopback listener dropped".into()))?;

        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    Outbound::Text(text) if !closed.load(Ordering::SeqCst) => {
                        let _ = inbox_tx.send(text);
                    }
                    Outbound::Text(_) => {}
                    Outbound::Close => break,
                }
            }
            emit_close(&closed, &sig_tx, CloseInfo::normal());
        });

        Ok(Link {
            outbound: out_tx,
            signals: sig_rx,
        })
    }
}

fn emit_close(
    closed: &AtomicBool,
    signals: &mpsc::UnboundedSender<TransportSignal>,
    info: CloseInfo,
) -> bool {
    if closed.swap(true, Ordering::SeqCst) {
        return false;
    }
    let _ = signals.send(TransportSignal::Closed(info));
    true
}

/// Remote end of a loopback link.
pub struct RemotePeer {
    url: String,
    inbox: mpsc::UnboundedReceiver<String>,
    signals: mpsc::UnboundedSender<TransportSignal>,
    closed: Arc<AtomicBool>,
}

impl RemotePeer {
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame from the client. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbox.recv().await
    }

    /// Next frame from the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let raw = self.recv().await?;
        serde_json::from_str(&raw).ok()
    }

    /// Push a JSON event to the client.
    pub fn send_json(&self, value: &Value) {
        self.send_raw(&value.to_string());
    }

    /// Push a raw text frame to the client.
    pub fn send_raw(&self, text: &str) {
        if !self.is_closed() {
            let _ = self
                .signals
                .send(TransportSignal::Message(text.to_string()));
        }
    }

    /// Close the link from the remote side.
    pub fn close(&self, code: u16, reason: &str) {
        emit_close(&self.closed, &self.signals, CloseInfo::new(code, reason));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
