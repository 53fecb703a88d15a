//! Event demultiplexer: raw frames in, typed bridge events out.

use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use task_bridge_core::InboundEvent;
use tokio::sync::mpsc;

/// Who ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// `disconnect()` was called.
    Manual,
    /// The remote side closed with code 1000.
    Peer,
    /// Anything else: dropped link, error code, missing close frame.
    Unexpected,
}

/// A session closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosed {
    /// Id of the session that ended, as reported by `SessionController::session`.
    pub session: u64,
    pub code: u16,
    pub reason: String,
    pub cause: CloseCause,
}

/// Event delivered to controller subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The session is open.
    Connected,
    /// A decoded inbound event.
    Inbound(InboundEvent),
    /// The session closed.
    Closed(SessionClosed),
}

/// Outcome of routing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Delivered,
    /// Well-formed but of an unknown type.
    Ignored,
    /// Not a valid event; dropped.
    Malformed,
}

/// Receiver side of a subscription.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
}

impl Subscription {
    /// Next event. `None` once the controller is gone.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }

    /// Next event, if one is already queued.
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        self.rx.try_recv().ok()
    }
}

/// Fans decoded events out to every live subscriber.
#[derive(Default)]
pub struct Demultiplexer {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BridgeEvent>>>,
    malformed: AtomicU64,
}

impl Demultiplexer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Dropped subscriptions are pruned on publish.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription { rx }
    }

    /// Decode one raw frame and deliver it.
    pub fn route(&self, raw: &str) -> Routed {
        match InboundEvent::decode(raw) {
            Ok(event) if event.is_unknown() => {
                tracing::debug!("Ignoring event of unknown type '{}'", event.name());
                Routed::Ignored
            }
            Ok(event) => {
                tracing::debug!("Routing {} event", event.name());
                self.publish(BridgeEvent::Inbound(event));
                Routed::Delivered
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping malformed frame: {e}");
                Routed::Malformed
            }
        }
    }

    /// Deliver an event to every live subscriber.
    pub fn publish(&self, event: BridgeEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Frames dropped as malformed so far.
    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}
