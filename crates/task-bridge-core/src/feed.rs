//! Broadcast + history feed of run updates.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future, stream::BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::run::{FailureReason, LogLine, RunStatus};

/// Default history size limit (4 MB).
const HISTORY_BYTES: usize = 4 * 1024 * 1024;

/// One observable change in the active run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunUpdate {
    Status { status: RunStatus },
    Log(LogLine),
    OtpRequired { prompt: String },
    Finished {
        status: RunStatus,
        failure: Option<FailureReason>,
        url: Option<String>,
    },
}

impl RunUpdate {
    /// Approximate heap footprint, for history bounding.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        let payload = match self {
            Self::Status { .. } => 0,
            Self::Log(line) => line.line.len(),
            Self::OtpRequired { prompt } => prompt.len(),
            Self::Finished { url, failure, .. } => {
                url.as_ref().map_or(0, String::len)
                    + failure.as_ref().map_or(0, |f| f.to_string().len())
            }
        };
        OVERHEAD + payload
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

#[derive(Clone)]
struct StoredUpdate {
    update: RunUpdate,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredUpdate>,
    total_bytes: usize,
}

/// Update feed with broadcast and history support.
///
/// Late subscribers replay the current run's history and then
/// switch to live updates.
pub struct RunFeed {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<RunUpdate>,
}

impl Default for RunFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFeed {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
        }
    }

    /// Push an update to both live listeners and history.
    pub fn push(&self, update: RunUpdate) {
        let bytes = update.approx_bytes();
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
                if let Some(front) = inner.history.pop_front() {
                    inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
                } else {
                    break;
                }
            }
            inner.history.push_back(StoredUpdate {
                update: update.clone(),
                bytes,
            });
            inner.total_bytes = inner.total_bytes.saturating_add(bytes);
        }
        let _ = self.sender.send(update);
    }

    /// Drop history at the start of a new run.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.history.clear();
        inner.total_bytes = 0;
    }

    /// Receiver for live updates only.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunUpdate> {
        self.sender.subscribe()
    }

    /// Snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<RunUpdate> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.update.clone())
            .collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> BoxStream<'static, RunUpdate> {
        // Subscribe under the read lock so no push falls between the two.
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let history: Vec<_> = inner.history.iter().map(|s| s.update.clone()).collect();
            (history, self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));
        hist.chain(live).boxed()
    }

    /// History plus live updates, ending with `Finished`.
    #[must_use]
    pub fn until_finished(&self) -> BoxStream<'static, RunUpdate> {
        futures::stream::unfold(
            (self.history_plus_stream(), false),
            |(mut stream, done)| async move {
                if done {
                    return None;
                }
                let update = stream.next().await?;
                let done = update.is_finished();
                Some((update, (stream, done)))
            },
        )
        .boxed()
    }

    /// Log lines of the current run (until Finished).
    #[must_use]
    pub fn log_stream(&self) -> BoxStream<'static, LogLine> {
        self.history_plus_stream()
            .take_while(|update| future::ready(!update.is_finished()))
            .filter_map(|update| {
                future::ready(match update {
                    RunUpdate::Log(line) => Some(line),
                    _ => None,
                })
            })
            .boxed()
    }
}
