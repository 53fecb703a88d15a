//! Transport session: one bidirectional text-message link.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{Outbound, TransportError, TransportSignal};

/// Channel pair handed back by a connector once the link is open.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub signals: mpsc::UnboundedReceiver<TransportSignal>,
}

/// Opens links to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake and return the open link.
    ///
    /// The future may be dropped mid-handshake; that must abort the attempt.
    async fn connect(&self, url: &str) -> Result<Link, TransportError>;
}

/// Receiving half of an open session.
#[derive(Debug)]
pub struct Signals {
    rx: mpsc::UnboundedReceiver<TransportSignal>,
}

impl Signals {
    /// Next signal. `None` once the connector is gone.
    pub async fn recv(&mut self) -> Option<TransportSignal> {
        self.rx.recv().await
    }
}

/// Sending half of an open session.
#[derive(Debug)]
pub struct TransportSession {
    url: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl TransportSession {
    /// Open a link, giving up after `timeout`.
    ///
    /// # Errors
    /// Returns `TransportError::Timeout` if the handshake does not finish in
    /// time, or the connector's error if it fails.
    pub async fn open(
        connector: &dyn Connector,
        url: &str,
        timeout: Duration,
    ) -> Result<(Self, Signals), TransportError> {
        let link = tokio::time::timeout(timeout, connector.connect(url))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        tracing::debug!("Transport link open: {url}");
        let session = Self {
            url: url.to_string(),
            outbound: link.outbound,
            closed: Arc::new(AtomicBool::new(false)),
        };
        Ok((session, Signals { rx: link.signals }))
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the link can still carry frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Queue one text frame.
    ///
    /// # Errors
    /// Returns `TransportError::NotOpen` if the link is closed.
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .send(Outbound::Text(text.into()))
            .map_err(|_| TransportError::NotOpen)
    }

    /// Close with code 1000. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Closing transport link: {}", self.url);
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}
