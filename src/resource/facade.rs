//! Public API for one resource kind.
//!
//! `ResourceFacade` wires the governor, the optimistic cache, the persistence
//! queue, the poller and the snapshot store together. Two entry points write:
//! `edit` is debounced (keystrokes, cell edits), `update` is dispatched
//! immediately (explicit user actions), as are `archive` and `delete`.

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{CacheLayer, CacheResult, CacheSource, CacheStorage};
use crate::error::{SyncError, SyncResult};
use crate::event::{EventBus, EventStream, SyncEvent};
use crate::query::{ResourceQuery, ResourceState, ViewRegistry};
use crate::sync::{
  request_key, AfterSink, FetchSpacing, Fetcher, GovernorOptions, OptimisticCache, PersistenceQueue,
  PollOptions, PollPhase, PollingSupervisor, RequestGovernor, Sink, Ticket, WriteFn, WriteMonitor,
};

use super::client::{Backend, Operation};
use super::types::{Patch, PendingEdit, Resource, ResourceKind};

/// Tuning for one facade.
#[derive(Debug, Clone, PartialEq)]
pub struct FacadeOptions {
  /// Quiet period before a debounced edit is written
  pub debounce: Duration,
  pub governor: GovernorOptions,
  pub poll: PollOptions,
  /// How long a persisted snapshot may answer `get` without the network
  pub stale_after: chrono::Duration,
  pub event_capacity: usize,
}

impl Default for FacadeOptions {
  fn default() -> Self {
    Self {
      debounce: Duration::from_millis(2_000),
      governor: GovernorOptions::default(),
      poll: PollOptions::default(),
      stale_after: chrono::Duration::zero(),
      event_capacity: 256,
    }
  }
}

struct Inner {
  kind: ResourceKind,
  backend: Arc<dyn Backend>,
  options: FacadeOptions,
  governor: RequestGovernor,
  cache: Arc<OptimisticCache>,
  layer: CacheLayer,
  queue: PersistenceQueue,
  poller: PollingSupervisor<(Ticket, Resource)>,
  spacing: Arc<FetchSpacing>,
  views: Arc<ViewRegistry>,
  events: EventBus,
  creates: AtomicU64,
}

/// Synchronized client for one resource kind. Cheap to clone.
#[derive(Clone)]
pub struct ResourceFacade {
  inner: Arc<Inner>,
}

impl ResourceFacade {
  /// Build a facade; unsaved edits left in `storage` by an earlier session
  /// are restored into the cache.
  pub fn new(
    kind: ResourceKind,
    backend: Arc<dyn Backend>,
    storage: Arc<dyn CacheStorage>,
    options: FacadeOptions,
  ) -> Self {
    let cache = Arc::new(OptimisticCache::new());
    let views = Arc::new(ViewRegistry::new(Arc::clone(&cache)));
    let events = EventBus::new(options.event_capacity).with_views(Arc::clone(&views));
    let governor = RequestGovernor::new(options.governor.clone());
    let layer = CacheLayer::new(storage, kind.name()).with_stale_time(options.stale_after);
    let spacing = Arc::new(FetchSpacing::new(options.poll.min_spacing));

    let writer = write_fn(&kind, &backend, &governor);
    let queue = PersistenceQueue::new(options.debounce, Arc::clone(&cache), writer, events.clone())
      .with_persistence(layer.clone());

    let monitor: Arc<dyn WriteMonitor> = Arc::new(queue.clone());
    let poller = PollingSupervisor::new(
      options.poll.clone(),
      Arc::clone(&spacing),
      poll_sink(&cache, &layer, &events),
      events.clone(),
    )
    .with_write_monitor(monitor);

    let restored = layer.pending_edits();
    if !restored.is_empty() {
      info!(kind = %kind, count = restored.len(), "restored unsaved edits");
    }
    for edit in restored {
      cache.restore(edit);
    }

    Self {
      inner: Arc::new(Inner {
        kind,
        backend,
        options,
        governor,
        cache,
        layer,
        queue,
        poller,
        spacing,
        views,
        events,
        creates: AtomicU64::new(0),
      }),
    }
  }

  pub fn kind(&self) -> &ResourceKind {
    &self.inner.kind
  }

  pub fn options(&self) -> &FacadeOptions {
    &self.inner.options
  }

  /// Subscribe to every sync event of this facade.
  pub fn events(&self) -> EventStream {
    self.inner.events.subscribe()
  }

  /// View-layer handle on `id`.
  pub fn query(&self, id: &str) -> ResourceQuery {
    ResourceQuery::new(self.clone(), id, self.inner.views.subscribe(id))
  }

  pub fn state(&self, id: &str) -> ResourceState {
    self.inner.views.snapshot(id)
  }

  /// Merged local view of `id`, without touching the network.
  pub fn read(&self, id: &str) -> Option<Resource> {
    self.inner.cache.read(id)
  }

  pub fn has_unsaved_changes(&self, id: &str) -> bool {
    self.inner.cache.has_unsaved_changes(id)
  }

  pub fn unsaved_ids(&self) -> Vec<String> {
    self.inner.cache.unsaved_ids()
  }

  /// Fetch `id` and return the merged view (server state plus unsaved edits).
  pub async fn get(&self, id: &str) -> SyncResult<Resource> {
    self.fetch(id, false).await.map(|result| result.data)
  }

  /// Like `get`, but reports where the data came from.
  pub async fn fetch(&self, id: &str, force: bool) -> SyncResult<CacheResult<Resource>> {
    let inner = &self.inner;
    let ticket = inner.cache.ticket(id);
    inner.events.emit(SyncEvent::Loading { id: id.to_string() });
    inner.spacing.record(id);

    let key = request_key(id, "read");
    let result = inner
      .layer
      .fetch_one(id, force, || async {
        inner
          .governor
          .execute(&key, inner.governor.options(), || {
            inner.backend.execute(&inner.kind, Operation::Get { id: id.to_string() })
          })
          .await?
          .into_resource()
      })
      .await;

    match result {
      Ok(result) => {
        if !inner.cache.reconcile(id, ticket, result.data.clone()) && inner.cache.ticket(id) != ticket {
          debug!(id, "fetch finished after cancel, dropping result");
          return Err(SyncError::Cancelled);
        }
        inner.events.emit(SyncEvent::Loaded {
          id: id.to_string(),
          source: result.source,
        });
        let merged = inner.cache.read(id);
        Ok(result.map(|fetched| merged.unwrap_or(fetched)))
      }
      Err(error) => {
        if error != SyncError::Cancelled {
          inner.events.emit(SyncEvent::FetchFailed {
            id: id.to_string(),
            error: error.clone(),
          });
        }
        Err(error)
      }
    }
  }

  /// Create a resource. Sent once: a retried POST could create duplicates.
  pub async fn create(&self, payload: Map<String, Value>) -> SyncResult<Resource> {
    let inner = &self.inner;
    let n = inner.creates.fetch_add(1, Ordering::Relaxed) + 1;
    let key = request_key(&format!("create:{}", n), "write");
    let options = inner.governor.options().clone().without_retries();

    let resource = inner
      .governor
      .execute(&key, &options, || {
        inner.backend.execute(
          &inner.kind,
          Operation::Create {
            payload: payload.clone(),
          },
        )
      })
      .await?
      .into_resource()?;

    let ticket = inner.cache.ticket(&resource.id);
    inner.cache.reconcile(&resource.id, ticket, resource.clone());
    inner.layer.store(&resource);
    info!(kind = %inner.kind, id = %resource.id, "created resource");
    inner.events.emit(SyncEvent::Loaded {
      id: resource.id.clone(),
      source: CacheSource::Network,
    });
    Ok(resource)
  }

  /// Explicit save of `patch`: applied locally, then written without debounce.
  ///
  /// The edit stays pending if the write fails.
  pub async fn update(&self, id: &str, patch: Patch) -> SyncResult<Resource> {
    match self.inner.queue.write_now(id, patch).await? {
      Some(resource) => Ok(resource),
      // Nothing left to send, e.g. an empty patch
      None => self
        .inner
        .cache
        .read(id)
        .ok_or_else(|| SyncError::NotFound(id.to_string())),
    }
  }

  /// High-frequency edit: applied locally now, written after the debounce delay.
  pub fn edit(&self, id: &str, patch: Patch) -> PendingEdit {
    self.inner.queue.schedule_write(id, patch)
  }

  /// Write unsaved changes of `id` now. `None` if there were none.
  pub async fn save(&self, id: &str) -> SyncResult<Option<Resource>> {
    self.inner.queue.flush(id).await
  }

  /// Drop unsaved changes of `id` without writing them.
  pub fn discard(&self, id: &str) -> Option<PendingEdit> {
    self.inner.queue.discard(id)
  }

  /// Soft-delete `id`. Serialized with saves of the same resource.
  pub async fn archive(&self, id: &str) -> SyncResult<Option<Resource>> {
    let inner = &self.inner;
    let ticket = inner.cache.ticket(id);
    let key = request_key(id, "archive");

    let reply = inner
      .queue
      .run_exclusive(
        id,
        inner.governor.execute(&key, inner.governor.options(), || {
          inner.backend.execute(&inner.kind, Operation::Archive { id: id.to_string() })
        }),
      )
      .await?;

    match reply.into_resource() {
      Ok(resource) => {
        if inner.cache.reconcile(id, ticket, resource.clone()) {
          inner.layer.store(&resource);
        }
        info!(kind = %inner.kind, id, "archived resource");
        inner.events.emit(SyncEvent::Loaded {
          id: id.to_string(),
          source: CacheSource::Network,
        });
        Ok(inner.cache.read(id))
      }
      // Archived without a body; the next refresh picks up the new state
      Err(_) => Ok(None),
    }
  }

  /// Hard-delete `id` and forget everything known about it locally.
  pub async fn delete(&self, id: &str) -> SyncResult<()> {
    let inner = &self.inner;
    let ticket = inner.cache.ticket(id);
    let key = request_key(id, "delete");

    inner
      .queue
      .run_exclusive(
        id,
        inner.governor.execute(&key, inner.governor.options(), || {
          inner.backend.execute(&inner.kind, Operation::Delete { id: id.to_string() })
        }),
      )
      .await?;

    inner.poller.stop_polling(id);
    if !inner.cache.forget(id, ticket) {
      debug!(id, "delete finished after cancel, keeping local state");
      return Err(SyncError::Cancelled);
    }
    inner.queue.cancel(id);
    inner.layer.remove(id);
    inner.layer.store_pending(id, None);
    info!(kind = %inner.kind, id, "deleted resource");
    inner.events.emit(SyncEvent::Removed { id: id.to_string() });
    Ok(())
  }

  /// Re-fetch `id` on demand.
  ///
  /// Without `force` the refresh is skipped (`Ok(None)`) while a write is in
  /// flight or when the last fetch was too recent. A forced refresh also
  /// resumes a poller paused by throttling.
  pub async fn refresh(&self, id: &str, force: bool) -> SyncResult<Option<Resource>> {
    let inner = &self.inner;
    if force {
      inner.poller.resume(id);
    } else {
      if inner.queue.is_writing(id) {
        debug!(id, "write in flight, skipping refresh");
        return Ok(None);
      }
      if let Some(wait) = inner.spacing.remaining(id) {
        debug!(id, ?wait, "last fetch too recent, skipping refresh");
        return Ok(None);
      }
    }

    self.fetch(id, force).await.map(|result| Some(result.data))
  }

  /// Poll `id` every `interval` (default: the configured poll interval).
  pub fn start_polling(&self, id: &str, interval: Option<Duration>) {
    let interval = interval.unwrap_or(self.inner.options.poll.interval);
    self.inner.poller.start_polling(id, interval, self.poll_fetcher());
  }

  pub fn stop_polling(&self, id: &str) -> bool {
    self.inner.poller.stop_polling(id)
  }

  /// Restart polling paused by throttling.
  pub fn resume_polling(&self, id: &str) -> bool {
    self.inner.poller.resume(id)
  }

  pub fn poll_phase(&self, id: &str) -> PollPhase {
    self.inner.poller.phase(id)
  }

  /// Cancel every timer and request for `id`.
  ///
  /// Once this returns nothing started earlier changes the cached state of
  /// `id`. Unsaved edits are kept.
  pub fn cancel(&self, id: &str) {
    let inner = &self.inner;
    inner.poller.stop_polling(id);
    inner.queue.cancel(id);
    let aborted = inner.governor.cancel_resource(id);
    debug!(id, aborted, "cancelled resource activity");
    inner.events.emit(SyncEvent::Cancelled { id: id.to_string() });
  }

  /// Cancel everything this facade has in flight.
  pub fn shutdown(&self) {
    self.inner.poller.stop_all();
    self.inner.queue.cancel_all();
    self.inner.governor.cancel_all();
  }

  /// Fetcher used by the poller; returns the ticket the fetch started under.
  fn poll_fetcher(&self) -> Fetcher<(Ticket, Resource)> {
    let inner = &self.inner;
    let kind = inner.kind.clone();
    let backend = Arc::clone(&inner.backend);
    let governor = inner.governor.clone();
    let cache = Arc::clone(&inner.cache);
    // The poller handles throttling itself
    let options = inner.governor.options().clone().without_retries();

    Arc::new(move |id: String| -> BoxFuture<'static, SyncResult<(Ticket, Resource)>> {
      let kind = kind.clone();
      let backend = Arc::clone(&backend);
      let governor = governor.clone();
      let cache = Arc::clone(&cache);
      let options = options.clone();
      Box::pin(async move {
        let ticket = cache.ticket(&id);
        // Same key as on-demand reads: a forced refresh supersedes this fetch
        let key = request_key(&id, "read");
        if governor.is_in_flight(&key) {
          debug!(id = %id, "read in flight, skipping poll");
          return Err(SyncError::Cancelled);
        }
        let resource = governor
          .execute(&key, &options, || {
            backend.execute(&kind, Operation::Get { id: id.clone() })
          })
          .await?
          .into_resource()?;
        Ok((ticket, resource))
      })
    })
  }
}

/// Debounced writes go through the governor under the `"{id}/write"` key.
fn write_fn(kind: &ResourceKind, backend: &Arc<dyn Backend>, governor: &RequestGovernor) -> WriteFn {
  let kind = kind.clone();
  let backend = Arc::clone(backend);
  let governor = governor.clone();

  Arc::new(move |id: String, patch: Patch| -> BoxFuture<'static, SyncResult<Resource>> {
    let kind = kind.clone();
    let backend = Arc::clone(&backend);
    let governor = governor.clone();
    Box::pin(async move {
      let key = request_key(&id, "write");
      let options = governor.options().clone();
      governor
        .execute(&key, &options, || {
          backend.execute(
            &kind,
            Operation::Update {
              id: id.clone(),
              patch: patch.clone(),
            },
          )
        })
        .await?
        .into_resource()
    })
  })
}

fn poll_sink(cache: &Arc<OptimisticCache>, layer: &CacheLayer, events: &EventBus) -> Sink<(Ticket, Resource)> {
  let cache = Arc::clone(cache);
  let layer = layer.clone();
  let events = events.clone();

  Arc::new(move |id: &str, (ticket, resource): (Ticket, Resource)| -> Option<AfterSink> {
    let changed = cache.reconcile(id, ticket, resource.clone());
    events.emit(SyncEvent::Loaded {
      id: id.to_string(),
      source: CacheSource::Network,
    });

    let layer = layer.clone();
    changed.then(|| Box::new(move || layer.store(&resource)) as AfterSink)
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{NoopStorage, SqliteStorage};
  use crate::error::ErrorKind;
  use crate::resource::testing::FakeBackend;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  fn facade_with(backend: &FakeBackend, storage: Arc<dyn CacheStorage>) -> ResourceFacade {
    ResourceFacade::new(
      ResourceKind::new("documents"),
      Arc::new(backend.clone()),
      storage,
      FacadeOptions::default(),
    )
  }

  fn facade(backend: &FakeBackend) -> ResourceFacade {
    facade_with(backend, Arc::new(NoopStorage))
  }

  async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
  }

  fn updates(backend: &FakeBackend) -> Vec<Patch> {
    backend
      .calls()
      .into_iter()
      .filter_map(|operation| match operation {
        Operation::Update { patch, .. } => Some(patch),
        _ => None,
      })
      .collect()
  }

  fn throttled() -> SyncError {
    SyncError::ServerThrottled { retry_after: None }
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_populates_cache_and_view() {
    let backend = FakeBackend::new();
    backend.seed("doc1", json!({"title": "Report", "body": "text"}));
    let facade = facade(&backend);
    let query = facade.query("doc1");

    let resource = facade.get("doc1").await.unwrap();
    assert_eq!(resource.payload["title"], "Report");

    let state = query.state();
    assert!(!state.is_loading);
    assert_eq!(state.source, Some(CacheSource::Network));
    assert_eq!(state.data.unwrap().payload["title"], "Report");
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_overlays_unsaved_edits() {
    let backend = FakeBackend::new();
    backend.seed("doc1", json!({"title": "Report", "body": "text"}));
    let facade = facade(&backend);

    facade.edit("doc1", Patch::new().set("title", "Draft"));
    let resource = facade.get("doc1").await.unwrap();

    assert_eq!(resource.payload["title"], "Draft");
    assert_eq!(resource.payload["body"], "text");
  }

  #[tokio::test(start_paused = true)]
  async fn test_missing_resource_is_not_found() {
    let backend = FakeBackend::new();
    let facade = facade(&backend);
    let query = facade.query("nope");

    let error = facade.get("nope").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(backend.count("get"), 1);
    assert_eq!(query.error().unwrap().kind, ErrorKind::NotFound);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rapid_edits_send_one_patch() {
    let backend = FakeBackend::new();
    backend.seed("doc1", json!({"title": "Original"}));
    let facade = facade(&backend);

    facade.edit("doc1", Patch::new().set("title", "A"));
    sleep_ms(300).await;
    facade.edit("doc1", Patch::new().set("title", "B"));
    sleep_ms(5_000).await;

    assert_eq!(updates(&backend), vec![Patch::new().set("title", "B")]);
    assert_eq!(backend.resource("doc1").unwrap().payload["title"], "B");
    assert!(!facade.has_unsaved_changes("doc1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_single_flight_under_continuous_editing() {
    let backend = FakeBackend::new().with_latency(Duration::from_millis(3_000));
    backend.seed("doc1", json!({"title": "", "body": ""}));
    let facade = facade(&backend);

    for i in 0..20 {
      facade.edit("doc1", Patch::new().set("title", format!("t{}", i)));
      facade.edit("doc1", Patch::new().set("body", format!("b{}", i)));
      sleep_ms(2_500).await;
    }
    sleep_ms(20_000).await;

    assert_eq!(backend.peak_writes(), 1);
    let server = backend.resource("doc1").unwrap();
    assert_eq!(server.payload["title"], "t19");
    assert_eq!(server.payload["body"], "b19");
    assert!(!facade.has_unsaved_changes("doc1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_validation_error_is_not_retried() {
    let backend = FakeBackend::new();
    backend.seed("doc1", json!({"title": "Report"}));
    let mut field_errors = crate::error::FieldErrors::new();
    field_errors.insert("title".into(), vec!["must not be empty".into()]);
    backend.fail_next(
      "update",
      SyncError::Validation {
        message: "invalid payload".into(),
        field_errors,
      },
    );
    let facade = facade(&backend);

    let error = facade
      .update("doc1", Patch::new().set("title", ""))
      .await
      .unwrap_err();

    assert_eq!(backend.count("update"), 1);
    let view = error.to_view();
    assert_eq!(view.kind, ErrorKind::ValidationError);
    assert_eq!(
      view.field_errors.unwrap()["title"],
      vec!["must not be empty".to_string()]
    );
    // The edit is kept for the caller to fix or discard
    assert!(facade.has_unsaved_changes("doc1"));

    sleep_ms(60_000).await;
    assert_eq!(backend.count("update"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_retries_transient_failures() {
    let backend = FakeBackend::new();
    backend.seed("doc1", json!({"title": "Report"}));
    backend.fail_next("update", SyncError::Network("connection reset".into()));
    let facade = facade(&backend);

    let resource = facade
      .update("doc1", Patch::new().set("title", "Final"))
      .await
      .unwrap();

    assert_eq!(resource.payload["title"], "Final");
    assert_eq!(backend.count("update"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_throttling_pauses_with_warning() {
    let backend = FakeBackend::new();
    backend.seed("dash", json!({"open_cases": 4}));
    backend.fail_always("get", throttled());
    let facade = facade(&backend);
    let query = facade.query("dash");

    facade.start_polling("dash", Some(Duration::from_millis(10_000)));
    sleep_ms(120_000).await;

    assert_eq!(backend.count("get"), 3);
    assert_eq!(facade.poll_phase("dash"), PollPhase::Paused);
    assert!(query.state().warning.is_some());

    // Forced refresh resumes polling once the server recovers
    backend.clear_failures();
    let resource = facade.refresh("dash", true).await.unwrap().unwrap();
    assert_eq!(resource.payload["open_cases"], 4);
    assert_eq!(facade.poll_phase("dash"), PollPhase::Scheduled);
    assert_eq!(query.state().warning, None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_waits_for_write_in_flight() {
    let backend = FakeBackend::new().with_latency(Duration::from_millis(4_000));
    backend.seed("doc1", json!({"title": "Report"}));
    let facade = facade(&backend);

    facade.start_polling("doc1", Some(Duration::from_millis(3_000)));
    facade.edit("doc1", Patch::new().set("title", "Draft"));
    // Write runs from 2000ms to 6000ms; the 3000ms tick must wait for it
    sleep_ms(5_000).await;
    assert_eq!(backend.count("get"), 0);

    sleep_ms(1_500).await;
    assert_eq!(backend.count("get"), 1);
    facade.stop_polling("doc1");
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_polling_mid_flight_leaves_cache_untouched() {
    let backend = FakeBackend::new().with_latency(Duration::from_millis(2_000));
    backend.seed("doc1", json!({"title": "v1"}));
    let facade = facade(&backend);
    facade.get("doc1").await.unwrap();

    backend.seed("doc1", json!({"title": "v2"}));
    facade.start_polling("doc1", Some(Duration::from_millis(5_000)));
    sleep_ms(6_000).await;
    assert_eq!(facade.poll_phase("doc1"), PollPhase::Fetching);

    facade.stop_polling("doc1");
    sleep_ms(10_000).await;

    assert_eq!(facade.read("doc1").unwrap().payload["title"], "v1");
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_mid_write_keeps_edit() {
    let backend = FakeBackend::new().with_latency(Duration::from_millis(1_000));
    backend.seed("doc1", json!({"title": "Report"}));
    let facade = facade(&backend);
    facade.get("doc1").await.unwrap();
    let mut events = facade.events();

    facade.edit("doc1", Patch::new().set("title", "Draft"));
    sleep_ms(2_500).await;
    assert_eq!(backend.count("update"), 1);

    facade.cancel("doc1");
    sleep_ms(5_000).await;

    assert_eq!(facade.inner.cache.confirmed("doc1").unwrap().payload["title"], "Report");
    assert!(facade.has_unsaved_changes("doc1"));

    let mut saw_cancel = false;
    while let Some(event) = events.try_next() {
      assert!(!matches!(event, SyncEvent::Saved { .. }));
      saw_cancel |= matches!(event, SyncEvent::Cancelled { .. });
    }
    assert!(saw_cancel);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_reaches_save_waiting_behind_write() {
    let backend = FakeBackend::new().with_latency(Duration::from_millis(3_000));
    backend.seed("doc1", json!({"title": "Report"}));
    let facade = facade(&backend);
    facade.get("doc1").await.unwrap();

    facade.edit("doc1", Patch::new().set("title", "Draft"));
    // Debounced write is on the wire from 2000ms to 5000ms
    sleep_ms(2_500).await;
    assert_eq!(backend.count("update"), 1);

    let saving = facade.clone();
    let save = tokio::spawn(async move { saving.save("doc1").await });
    sleep_ms(100).await;
    facade.cancel("doc1");

    assert_eq!(save.await.unwrap(), Err(SyncError::Cancelled));
    sleep_ms(10_000).await;

    assert_eq!(backend.count("update"), 1);
    assert_eq!(facade.inner.cache.confirmed("doc1").unwrap().payload["title"], "Report");
    assert!(facade.has_unsaved_changes("doc1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_reaches_update_waiting_behind_write() {
    let backend = FakeBackend::new().with_latency(Duration::from_millis(3_000));
    backend.seed("doc1", json!({"title": "Report", "body": "text"}));
    let facade = facade(&backend);
    facade.get("doc1").await.unwrap();

    facade.edit("doc1", Patch::new().set("title", "Draft"));
    sleep_ms(2_500).await;

    let updating = facade.clone();
    let update = tokio::spawn(async move {
      updating
        .update("doc1", Patch::new().set("body", "new"))
        .await
    });
    sleep_ms(100).await;
    facade.cancel("doc1");

    assert_eq!(update.await.unwrap(), Err(SyncError::Cancelled));
    sleep_ms(10_000).await;
    assert_eq!(backend.count("update"), 1);
    assert_eq!(backend.resource("doc1").unwrap().payload["body"], "text");
  }

  #[tokio::test(start_paused = true)]
  async fn test_forced_refresh_supersedes_poll_fetch() {
    let backend = FakeBackend::new().with_latency(Duration::from_millis(2_000));
    backend.seed("doc1", json!({"title": "v1"}));
    let facade = facade(&backend);

    facade.start_polling("doc1", Some(Duration::from_millis(5_000)));
    // Poll GET runs from 5000ms
    sleep_ms(5_500).await;
    assert_eq!(facade.poll_phase("doc1"), PollPhase::Fetching);

    backend.seed("doc1", json!({"title": "v2"}));
    let resource = facade.refresh("doc1", true).await.unwrap().unwrap();

    assert_eq!(resource.payload["title"], "v2");
    assert_eq!(backend.count("get"), 2);
    assert_eq!(backend.peak_reads(), 1);
    assert_eq!(facade.poll_phase("doc1"), PollPhase::Scheduled);
    facade.stop_polling("doc1");
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_respects_spacing_and_writes() {
    let backend = FakeBackend::new();
    backend.seed("doc1", json!({"title": "Report"}));
    let facade = facade(&backend);

    facade.get("doc1").await.unwrap();
    assert_eq!(facade.refresh("doc1", false).await, Ok(None));
    assert_eq!(backend.count("get"), 1);

    sleep_ms(2_500).await;
    assert!(facade.refresh("doc1", false).await.unwrap().is_some());
    assert!(facade.refresh("doc1", true).await.unwrap().is_some());
    assert_eq!(backend.count("get"), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_archive_delete() {
    let backend = FakeBackend::new();
    let facade = facade(&backend);
    let mut payload = Map::new();
    payload.insert("title".into(), json!("New case"));

    let created = facade.create(payload).await.unwrap();
    assert_eq!(facade.read(&created.id).unwrap().payload["title"], "New case");

    let archived = facade.archive(&created.id).await.unwrap().unwrap();
    assert_eq!(archived.payload["archived"], json!(true));

    let mut events = facade.events();
    facade.delete(&created.id).await.unwrap();
    assert!(facade.read(&created.id).is_none());
    assert!(backend.resource(&created.id).is_none());
    assert_eq!(
      events.try_next(),
      Some(SyncEvent::Removed {
        id: created.id.clone()
      })
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_is_sent_once() {
    let backend = FakeBackend::new();
    backend.fail_next("create", SyncError::Timeout(Duration::from_secs(15)));
    let facade = facade(&backend);

    let result = facade.create(Map::new()).await;
    assert!(matches!(result, Err(SyncError::Timeout(_))));
    assert_eq!(backend.count("create"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_get_serves_snapshot() {
    let backend = FakeBackend::new();
    backend.seed("doc1", json!({"title": "Report"}));
    let facade = facade_with(&backend, Arc::new(SqliteStorage::open_in_memory().unwrap()));
    let query = facade.query("doc1");
    facade.get("doc1").await.unwrap();

    backend.fail_always("get", SyncError::Network("unreachable".into()));
    let result = facade.fetch("doc1", false).await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.payload["title"], "Report");
    assert!(query.state().warning.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_unsaved_edits_survive_restart() {
    let backend = FakeBackend::new();
    backend.seed("doc1", json!({"title": "Report"}));
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());

    let first = facade_with(&backend, Arc::clone(&storage));
    first.edit("doc1", Patch::new().set("title", "Unsaved"));
    first.shutdown();

    let second = facade_with(&backend, storage);
    assert!(second.has_unsaved_changes("doc1"));
    second.save("doc1").await.unwrap();
    assert_eq!(backend.resource("doc1").unwrap().payload["title"], "Unsaved");
    assert!(!second.has_unsaved_changes("doc1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_discard_drops_edit() {
    let backend = FakeBackend::new();
    backend.seed("doc1", json!({"title": "Report"}));
    let facade = facade(&backend);
    facade.get("doc1").await.unwrap();

    facade.edit("doc1", Patch::new().set("title", "Oops"));
    assert!(facade.discard("doc1").is_some());
    sleep_ms(5_000).await;

    assert_eq!(backend.count("update"), 0);
    assert_eq!(facade.read("doc1").unwrap().payload["title"], "Report");
  }
}
