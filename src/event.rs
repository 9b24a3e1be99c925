use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

use crate::cache::CacheSource;
use crate::error::SyncError;
use crate::query::ViewRegistry;

/// State transitions of synchronized resources
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// A fetch started
  Loading { id: String },
  /// Server state (or a snapshot of it) landed in the cache
  Loaded { id: String, source: CacheSource },
  FetchFailed { id: String, error: SyncError },
  /// A local edit was applied
  Edited { id: String },
  /// A write started
  Saving { id: String },
  Saved { id: String },
  /// The write failed; the pending edit is kept
  SaveFailed { id: String, error: SyncError },
  /// A poll was throttled; the next one is delayed by `retry_in`
  PollThrottled {
    id: String,
    consecutive: u32,
    retry_in: Duration,
  },
  /// Too many consecutive throttles; polling stopped until resumed
  PollingPaused { id: String, consecutive: u32 },
  PollingResumed { id: String },
  /// The resource was deleted
  Removed { id: String },
  /// Outstanding timers and requests for the resource were cancelled
  Cancelled { id: String },
}

impl SyncEvent {
  pub fn resource_id(&self) -> &str {
    match self {
      Self::Loading { id }
      | Self::Loaded { id, .. }
      | Self::FetchFailed { id, .. }
      | Self::Edited { id }
      | Self::Saving { id }
      | Self::Saved { id }
      | Self::SaveFailed { id, .. }
      | Self::PollThrottled { id, .. }
      | Self::PollingPaused { id, .. }
      | Self::PollingResumed { id }
      | Self::Removed { id }
      | Self::Cancelled { id } => id,
    }
  }
}

/// Fan-out point for sync events.
///
/// Every event first updates the view registry (if attached), then goes to
/// broadcast subscribers. Emitting with no subscribers is fine.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
  views: Option<Arc<ViewRegistry>>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx, views: None }
  }

  pub fn with_views(mut self, views: Arc<ViewRegistry>) -> Self {
    self.views = Some(views);
    self
  }

  pub fn emit(&self, event: SyncEvent) {
    if let Some(views) = &self.views {
      views.apply(&event);
    }
    // Ignore send errors - there may be no subscribers
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> EventStream {
    EventStream {
      rx: self.tx.subscribe(),
    }
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}

/// Receiving end of an [`EventBus`]
pub struct EventStream {
  rx: broadcast::Receiver<SyncEvent>,
}

impl EventStream {
  /// Receive the next event; `None` once the bus is gone.
  ///
  /// A slow consumer skips the events it missed.
  pub async fn next(&mut self) -> Option<SyncEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "event consumer lagged behind");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Non-blocking variant for event loops that poll on a tick.
  pub fn try_next(&mut self) -> Option<SyncEvent> {
    loop {
      match self.rx.try_recv() {
        Ok(event) => return Some(event),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }
}
