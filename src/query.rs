//! View-layer subscription to synchronized resources.
//!
//! A [`ResourceQuery`] is what a view holds for one resource: the current
//! [`ResourceState`] plus the imperative operations (`save`, `refresh`,
//! `cancel`). State is pushed by the [`ViewRegistry`], which folds every
//! [`SyncEvent`] into the per-resource state before the event is broadcast.
//!
//! # Example
//!
//! ```ignore
//! let mut query = facade.query("doc1");
//! query.refresh(true).await?;
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//!     render(&query.state());
//! }
//!
//! // Keystroke-driven edits are debounced
//! query.edit(Patch::new().set("title", "Draft"));
//!
//! // View closed
//! query.close();
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::cache::CacheSource;
use crate::error::{SyncResult, ViewError};
use crate::event::SyncEvent;
use crate::resource::facade::ResourceFacade;
use crate::resource::types::{Patch, PendingEdit, Resource};
use crate::sync::{OptimisticCache, PollPhase};

/// Everything a view needs to render one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
  /// Merged view: confirmed state with unsaved edits laid over it
  pub data: Option<Resource>,
  pub is_loading: bool,
  pub is_saving: bool,
  /// Last terminal error; cleared by the next successful load or save
  pub error: Option<ViewError>,
  pub has_unsaved_changes: bool,
  /// User-visible warning, e.g. polling paused after repeated throttling
  pub warning: Option<String>,
  /// Automatic refresh stopped after repeated throttling; cleared on resume
  pub polling_paused: bool,
  /// Where `data` came from on the last load
  pub source: Option<CacheSource>,
}

const PAUSED_WARNING: &str = "Server keeps throttling requests, automatic refresh paused";

impl ResourceState {
  /// Fold one event into the state. Data and the unsaved flag are refreshed
  /// separately from the cache.
  fn on_event(&mut self, event: &SyncEvent) {
    match event {
      SyncEvent::Loading { .. } => self.is_loading = true,
      SyncEvent::Loaded { source, .. } => {
        self.is_loading = false;
        self.error = None;
        self.source = Some(*source);
        self.warning = match source {
          CacheSource::Offline => Some("Offline, showing the last saved snapshot".to_string()),
          _ if self.polling_paused => Some(PAUSED_WARNING.to_string()),
          CacheSource::Network | CacheSource::CacheFresh => None,
        };
      }
      SyncEvent::FetchFailed { error, .. } => {
        self.is_loading = false;
        self.error = Some(error.to_view());
      }
      SyncEvent::Edited { .. } => {}
      SyncEvent::Saving { .. } => self.is_saving = true,
      SyncEvent::Saved { .. } => {
        self.is_saving = false;
        self.error = None;
      }
      SyncEvent::SaveFailed { error, .. } => {
        self.is_saving = false;
        self.error = Some(error.to_view());
      }
      SyncEvent::PollThrottled { retry_in, .. } => {
        self.warning = Some(format!(
          "Server is throttling requests, retrying in {}ms",
          retry_in.as_millis()
        ));
      }
      SyncEvent::PollingPaused { .. } => {
        self.polling_paused = true;
        self.warning = Some(PAUSED_WARNING.to_string());
      }
      SyncEvent::PollingResumed { .. } => {
        self.polling_paused = false;
        self.warning = None;
      }
      SyncEvent::Removed { .. } => *self = Self::default(),
      SyncEvent::Cancelled { .. } => {
        self.is_loading = false;
        self.is_saving = false;
      }
    }
  }
}

/// Per-resource state channels, kept current from the event stream.
pub struct ViewRegistry {
  cache: Arc<OptimisticCache>,
  channels: Mutex<HashMap<String, watch::Sender<ResourceState>>>,
}

impl ViewRegistry {
  pub fn new(cache: Arc<OptimisticCache>) -> Self {
    Self {
      cache,
      channels: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<ResourceState>>> {
    self.channels.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// State as it would be seen by a new subscriber.
  pub fn snapshot(&self, id: &str) -> ResourceState {
    match self.lock().get(id) {
      Some(tx) => tx.borrow().clone(),
      None => ResourceState {
        data: self.cache.read(id),
        has_unsaved_changes: self.cache.has_unsaved_changes(id),
        ..ResourceState::default()
      },
    }
  }

  pub fn subscribe(&self, id: &str) -> watch::Receiver<ResourceState> {
    let mut channels = self.lock();
    if let Some(tx) = channels.get(id) {
      return tx.subscribe();
    }

    let (tx, rx) = watch::channel(ResourceState {
      data: self.cache.read(id),
      has_unsaved_changes: self.cache.has_unsaved_changes(id),
      ..ResourceState::default()
    });
    channels.insert(id.to_string(), tx);
    rx
  }

  /// Fold `event` into the state of its resource.
  ///
  /// Subscribers are only woken when the state actually changed.
  pub fn apply(&self, event: &SyncEvent) {
    let id = event.resource_id();
    let mut channels = self.lock();
    let Some(tx) = channels.get(id) else {
      return;
    };
    if tx.is_closed() {
      channels.remove(id);
      return;
    }

    let data = self.cache.read(id);
    let has_unsaved_changes = self.cache.has_unsaved_changes(id);
    tx.send_if_modified(|state| {
      let before = state.clone();
      state.on_event(event);
      state.data = data;
      state.has_unsaved_changes = has_unsaved_changes;
      *state != before
    });
  }
}

/// A view's handle on one resource: state subscription plus operations.
pub struct ResourceQuery {
  facade: ResourceFacade,
  id: String,
  rx: watch::Receiver<ResourceState>,
}

impl ResourceQuery {
  pub(crate) fn new(facade: ResourceFacade, id: &str, rx: watch::Receiver<ResourceState>) -> Self {
    Self {
      facade,
      id: id.to_string(),
      rx,
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn state(&self) -> ResourceState {
    self.rx.borrow().clone()
  }

  pub fn data(&self) -> Option<Resource> {
    self.rx.borrow().data.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.rx.borrow().is_loading
  }

  pub fn has_unsaved_changes(&self) -> bool {
    self.rx.borrow().has_unsaved_changes
  }

  pub fn error(&self) -> Option<ViewError> {
    self.rx.borrow().error.clone()
  }

  /// Check for a state change since the last call.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    match self.rx.has_changed() {
      Ok(true) => {
        self.rx.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next state change. `None` once the facade is gone.
  pub async fn changed(&mut self) -> Option<ResourceState> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }

  /// High-frequency edit: applied locally now, written after the debounce delay.
  pub fn edit(&self, patch: Patch) -> PendingEdit {
    self.facade.edit(&self.id, patch)
  }

  /// Write unsaved changes now.
  pub async fn save(&self) -> SyncResult<Option<Resource>> {
    self.facade.save(&self.id).await
  }

  pub async fn refresh(&self, force: bool) -> SyncResult<Option<Resource>> {
    self.facade.refresh(&self.id, force).await
  }

  /// Drop unsaved changes without writing them.
  pub fn discard(&self) -> Option<PendingEdit> {
    self.facade.discard(&self.id)
  }

  /// Cancel timers and requests for this resource. Unsaved changes are kept.
  pub fn cancel(&self) {
    self.facade.cancel(&self.id);
  }

  pub fn start_polling(&self, interval: Option<Duration>) {
    self.facade.start_polling(&self.id, interval);
  }

  pub fn stop_polling(&self) -> bool {
    self.facade.stop_polling(&self.id)
  }

  pub fn poll_phase(&self) -> PollPhase {
    self.facade.poll_phase(&self.id)
  }

  /// Tear down the view: nothing started for this resource touches it afterwards.
  pub fn close(self) {
    self.facade.cancel(&self.id);
  }
}

impl std::fmt::Debug for ResourceQuery {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResourceQuery")
      .field("id", &self.id)
      .field("state", &*self.rx.borrow())
      .finish_non_exhaustive()
  }
}
