//! WebSocket connector built on `tokio-tungstenite`.

use std::sync::Once;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::protocol::{CLOSE_NO_STATUS, CloseInfo, Outbound, TransportError, TransportSignal};
use crate::session::{Connector, Link};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static CRYPTO_PROVIDER: Once = Once::new();

/// Connector for `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Copy)]
pub struct WsConnector;

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WsConnector {
    #[must_use]
    pub fn new() -> Self {
        CRYPTO_PROVIDER.call_once(|| {
            // Another provider may already be installed by the host process.
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Refused(e.to_string()))?;
        tracing::info!("WebSocket connected: {url}");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws, out_rx, sig_tx));

        Ok(Link {
            outbound: out_tx,
            signals: sig_rx,
        })
    }
}

/// Shuttle frames between the socket and the session until either side closes.
async fn pump(
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    sig_tx: mpsc::UnboundedSender<TransportSignal>,
) {
    let (mut sink, mut stream) = ws.split();

    let close = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = sig_tx.send(TransportSignal::Message(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        let _ = sig_tx.send(TransportSignal::Message(text));
                    }
                    Err(_) => tracing::debug!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(
                        || CloseInfo::new(CLOSE_NO_STATUS, ""),
                        |f| CloseInfo::new(u16::from(f.code), f.reason.to_string()),
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error: {e}");
                    break CloseInfo::abnormal(e.to_string());
                }
                None => break CloseInfo::abnormal("stream ended"),
            },
            out = out_rx.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        tracing::warn!("WebSocket send failed: {e}");
                        break CloseInfo::abnormal(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: String::new().into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        tracing::debug!("Close frame not delivered: {e}");
                    }
                    break CloseInfo::normal();
                }
            },
        }
    };

    let _ = sink.close().await;
    tracing::info!("WebSocket closed ({}): {}", close.code, close.reason);
    let _ = sig_tx.send(TransportSignal::Closed(close));
}
