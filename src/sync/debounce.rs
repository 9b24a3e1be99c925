//! Debounced persistence queue.
//!
//! Rapid edits to one resource are coalesced in the optimistic cache and
//! written once the resource has been quiet for the debounce delay. Each
//! resource has a write gate (an async mutex); holding it is the only way to
//! write, so there is never more than one write in flight per resource.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheLayer;
use crate::error::{SyncError, SyncResult};
use crate::event::{EventBus, SyncEvent};
use crate::resource::types::{Patch, PendingEdit, Resource};

use super::optimistic::{OptimisticCache, Ticket};

/// Performs the actual write of a merged patch.
pub type WriteFn = Arc<dyn Fn(String, Patch) -> BoxFuture<'static, SyncResult<Resource>> + Send + Sync>;

/// Lets other components observe write activity without owning the queue.
pub trait WriteMonitor: Send + Sync {
  fn is_writing(&self, id: &str) -> bool;

  /// Resolves once no write for `id` is in flight.
  fn settled(&self, id: &str) -> BoxFuture<'static, ()>;
}

#[derive(Default)]
struct Slot {
  gate: Arc<tokio::sync::Mutex<()>>,
  timer: Option<JoinHandle<()>>,
  /// Identifies the current timer; an outdated timer must not start a write
  timer_seq: u64,
  write: Option<JoinHandle<()>>,
}

struct Shared {
  delay: Duration,
  cache: Arc<OptimisticCache>,
  writer: WriteFn,
  events: EventBus,
  persist: Option<CacheLayer>,
  slots: Mutex<HashMap<String, Slot>>,
}

#[derive(Clone)]
pub struct PersistenceQueue {
  shared: Arc<Shared>,
}

impl PersistenceQueue {
  pub fn new(delay: Duration, cache: Arc<OptimisticCache>, writer: WriteFn, events: EventBus) -> Self {
    Self {
      shared: Arc::new(Shared {
        delay,
        cache,
        writer,
        events,
        persist: None,
        slots: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Mirror pending edits and confirmed writes into a local snapshot store.
  ///
  /// Must be called before the queue is cloned or used.
  pub fn with_persistence(mut self, layer: CacheLayer) -> Self {
    if let Some(shared) = Arc::get_mut(&mut self.shared) {
      shared.persist = Some(layer);
    }
    self
  }

  pub fn delay(&self) -> Duration {
    self.shared.delay
  }

  /// Apply `patch` locally and (re)start the debounce timer for `id`.
  pub fn schedule_write(&self, id: &str, patch: Patch) -> PendingEdit {
    self.schedule_write_after(id, patch, self.shared.delay)
  }

  pub fn schedule_write_after(&self, id: &str, patch: Patch, delay: Duration) -> PendingEdit {
    let edit = self.stage(id, patch);

    let mut slots = self.shared.lock();
    let slot = slots.entry(id.to_string()).or_default();
    if let Some(timer) = slot.timer.take() {
      debug!(id, "coalescing edit into scheduled write");
      timer.abort();
    }
    slot.timer_seq += 1;

    let shared = Arc::clone(&self.shared);
    let seq = slot.timer_seq;
    let id = id.to_string();
    slot.timer = Some(tokio::spawn(shared.run_timer(id, seq, delay)));

    edit
  }

  /// Apply `patch` and write it right away, skipping the debounce delay.
  ///
  /// Still serialized behind a write already in flight for `id`.
  pub async fn write_now(&self, id: &str, patch: Patch) -> SyncResult<Option<Resource>> {
    let ticket = self.shared.cache.ticket(id);
    self.stage(id, patch);
    self.flush_from(id, ticket).await
  }

  /// Write the pending edit for `id` now, after any write already in flight.
  ///
  /// Returns `Ok(None)` if there was nothing to write, and `Cancelled` if
  /// `id` was cancelled while waiting for the write in flight.
  pub async fn flush(&self, id: &str) -> SyncResult<Option<Resource>> {
    let ticket = self.shared.cache.ticket(id);
    self.flush_from(id, ticket).await
  }

  async fn flush_from(&self, id: &str, ticket: Ticket) -> SyncResult<Option<Resource>> {
    let gate = {
      let mut slots = self.shared.lock();
      let slot = slots.entry(id.to_string()).or_default();
      if let Some(timer) = slot.timer.take() {
        timer.abort();
      }
      slot.timer_seq += 1;
      Arc::clone(&slot.gate)
    };

    let guard = gate.lock_owned().await;
    Arc::clone(&self.shared).write(id.to_string(), ticket, guard).await
  }

  /// Run `operation` while holding the write gate of `id`.
  ///
  /// Used for immediate writes (archive, delete) so they serialize with saves.
  /// `operation` is dropped unstarted if `id` is cancelled while waiting.
  pub async fn run_exclusive<T, Fut>(&self, id: &str, operation: Fut) -> SyncResult<T>
  where
    Fut: Future<Output = SyncResult<T>>,
  {
    let ticket = self.shared.cache.ticket(id);
    let gate = self.shared.gate(id);
    let _guard = gate.lock_owned().await;
    if self.shared.cache.ticket(id) != ticket {
      debug!(id, "cancelled while waiting for write gate");
      return Err(SyncError::Cancelled);
    }
    operation.await
  }

  fn stage(&self, id: &str, patch: Patch) -> PendingEdit {
    let edit = self.shared.cache.apply(id, patch);
    self.shared.persist_pending(id);
    self.shared.events.emit(SyncEvent::Edited { id: id.to_string() });
    edit
  }

  pub fn has_scheduled_write(&self, id: &str) -> bool {
    self
      .shared
      .lock()
      .get(id)
      .and_then(|slot| slot.timer.as_ref())
      .is_some_and(|timer| !timer.is_finished())
  }

  /// Stop the timer and the background write for `id`.
  ///
  /// The pending edit stays in the cache; a write already on the wire can no
  /// longer confirm it.
  pub fn cancel(&self, id: &str) {
    if let Some(slot) = self.shared.lock().get_mut(id) {
      if let Some(timer) = slot.timer.take() {
        timer.abort();
      }
      if let Some(write) = slot.write.take() {
        write.abort();
      }
      slot.timer_seq += 1;
    }
    self.shared.cache.invalidate(id);
  }

  pub fn cancel_all(&self) {
    let ids: Vec<String> = self.shared.lock().keys().cloned().collect();
    for id in ids {
      self.cancel(&id);
    }
  }

  /// Drop the pending edit for `id` without writing it.
  pub fn discard(&self, id: &str) -> Option<PendingEdit> {
    if let Some(slot) = self.shared.lock().get_mut(id) {
      if let Some(timer) = slot.timer.take() {
        timer.abort();
      }
      slot.timer_seq += 1;
    }

    let discarded = self.shared.cache.discard(id);
    if discarded.is_some() {
      self.shared.persist_pending(id);
      self.shared.events.emit(SyncEvent::Edited { id: id.to_string() });
    }
    discarded
  }
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn gate(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
    Arc::clone(&self.lock().entry(id.to_string()).or_default().gate)
  }

  fn persist_pending(&self, id: &str) {
    if let Some(layer) = &self.persist {
      layer.store_pending(id, self.cache.pending(id).as_ref());
    }
  }

  async fn run_timer(self: Arc<Self>, id: String, seq: u64, delay: Duration) {
    loop {
      tokio::time::sleep(delay).await;

      let ticket = self.cache.ticket(&id);
      let mut slots = self.lock();
      let Some(slot) = slots.get_mut(&id) else {
        return;
      };
      if slot.timer_seq != seq {
        return;
      }

      match Arc::clone(&slot.gate).try_lock_owned() {
        Ok(guard) => {
          // Dropping our own handle detaches, it does not abort
          slot.timer = None;
          let shared = Arc::clone(&self);
          let write_id = id.clone();
          slot.write = Some(tokio::spawn(async move {
            let _ = shared.write(write_id, ticket, guard).await;
          }));
          return;
        }
        Err(_) => {
          debug!(id = %id, "write in flight, restarting debounce timer");
        }
      }
    }
  }

  /// Write the current pending edit. The caller holds the gate.
  ///
  /// `ticket` is the epoch the caller started under; a cancel since then
  /// turns the write into `Cancelled` before anything is sent.
  async fn write(
    self: Arc<Self>,
    id: String,
    ticket: Ticket,
    _guard: OwnedMutexGuard<()>,
  ) -> SyncResult<Option<Resource>> {
    if self.cache.ticket(&id) != ticket {
      debug!(id = %id, "cancelled while waiting for write gate");
      return Err(SyncError::Cancelled);
    }
    let Some(pending) = self.cache.pending(&id) else {
      return Ok(None);
    };
    let sent = pending.patch;

    self.events.emit(SyncEvent::Saving { id: id.clone() });
    match (self.writer)(id.clone(), sent.clone()).await {
      Ok(resource) => {
        if self.cache.confirm(&id, ticket, resource.clone(), &sent) {
          if let Some(layer) = &self.persist {
            layer.store(&resource);
          }
          self.persist_pending(&id);
          info!(id = %id, fields = sent.len(), "saved pending edit");
          self.events.emit(SyncEvent::Saved { id });
        }
        Ok(Some(resource))
      }
      Err(error) => {
        if error != SyncError::Cancelled && self.cache.ticket(&id) == ticket {
          warn!(id = %id, %error, "save failed, keeping pending edit");
          self.events.emit(SyncEvent::SaveFailed {
            id,
            error: error.clone(),
          });
        }
        Err(error)
      }
    }
  }
}

impl WriteMonitor for PersistenceQueue {
  fn is_writing(&self, id: &str) -> bool {
    self
      .shared
      .lock()
      .get(id)
      .is_some_and(|slot| slot.gate.try_lock().is_err())
  }

  fn settled(&self, id: &str) -> BoxFuture<'static, ()> {
    let gate = self.shared.gate(id);
    Box::pin(async move {
      drop(gate.lock().await);
    })
  }
}
