//! Test connector that exposes raw links.

use std::sync::Mutex;

use async_trait::async_trait;
use task_bridge_transport::{Connector, Link, Outbound, TransportError, TransportSignal};
use tokio::sync::mpsc;

type RawLink = (
    mpsc::UnboundedReceiver<Outbound>,
    mpsc::UnboundedSender<TransportSignal>,
);

/// Hands out raw links so a test can stage transport signals by hand.
#[derive(Default)]
pub struct ManualConnector {
    links: Mutex<Vec<RawLink>>,
}

impl ManualConnector {
    /// Remove the `index`-th open link: its outbound queue and signal sender.
    pub fn take(&self, index: usize) -> RawLink {
        self.links.lock().unwrap().remove(index)
    }

    pub fn open_links(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for ManualConnector {
    async fn connect(&self, _url: &str) -> Result<Link, TransportError> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push((outbound_rx, signals_tx));
        Ok(Link { outbound, signals })
    }
}
