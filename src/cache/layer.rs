//! Cache layer that orchestrates the local snapshot store with network fetching.

use chrono::{Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::resource::types::{PendingEdit, Resource};

use super::storage::CacheStorage;
use super::traits::CacheResult;

/// Cache layer that manages snapshot persistence and offline fallback.
///
/// Storage failures are logged and otherwise ignored: the local copy is a
/// convenience, the server remains the source of truth.
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  kind: String,
  /// How long a persisted snapshot may short-circuit the network
  stale_time: Duration,
}

impl CacheLayer {
  /// Create a new cache layer over `storage` for one resource kind.
  pub fn new(storage: Arc<dyn CacheStorage>, kind: impl Into<String>) -> Self {
    Self {
      storage,
      kind: kind.into(),
      stale_time: Duration::zero(),
    }
  }

  /// Set the stale time for persisted snapshots.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Check if cached data is stale based on cached_at timestamp.
  fn is_stale(&self, cached_at: chrono::DateTime<Utc>) -> bool {
    Utc::now() - cached_at >= self.stale_time
  }

  /// Fetch a single resource.
  ///
  /// 1. A persisted snapshot inside the stale window is returned as is
  ///    (unless `force`)
  /// 2. Otherwise fetch from network and persist the result
  /// 3. On a transient network failure, return the snapshot (offline mode)
  pub async fn fetch_one<F, Fut>(
    &self,
    id: &str,
    force: bool,
    fetcher: F,
  ) -> SyncResult<CacheResult<Resource>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SyncResult<Resource>>,
  {
    let cached = match self.storage.get_resource(&self.kind, id) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(kind = %self.kind, id, "failed to read cached resource: {}", e);
        None
      }
    };

    if let Some(cached) = &cached {
      if !force && !self.is_stale(cached.cached_at) {
        debug!(kind = %self.kind, id, "serving fresh snapshot");
        return Ok(CacheResult::from_cache(
          cached.entity.clone(),
          cached.cached_at,
        ));
      }
    }

    match fetcher().await {
      Ok(resource) => {
        self.store(&resource);
        Ok(CacheResult::from_network(resource))
      }
      Err(e) if e.is_retryable() => match cached {
        Some(cached) => {
          warn!(kind = %self.kind, id, error = %e, "network failed, serving offline snapshot");
          Ok(CacheResult::offline(cached.entity, cached.cached_at))
        }
        None => Err(e),
      },
      Err(e) => Err(e),
    }
  }

  pub fn store(&self, resource: &Resource) {
    if let Err(e) = self.storage.store_resource(&self.kind, resource) {
      warn!(kind = %self.kind, id = %resource.id, "failed to persist resource: {}", e);
    }
  }

  pub fn remove(&self, id: &str) {
    if let Err(e) = self.storage.remove_resource(&self.kind, id) {
      warn!(kind = %self.kind, id, "failed to remove cached resource: {}", e);
    }
  }

  /// Mirror the pending edit of `id`: store it, or clear it when `None`.
  pub fn store_pending(&self, id: &str, edit: Option<&PendingEdit>) {
    let result = match edit {
      Some(edit) => self.storage.store_pending(&self.kind, edit),
      None => self.storage.clear_pending(&self.kind, id),
    };
    if let Err(e) = result {
      warn!(kind = %self.kind, id, "failed to persist pending edit: {}", e);
    }
  }

  pub fn pending_edits(&self) -> Vec<PendingEdit> {
    self.storage.pending_edits(&self.kind).unwrap_or_else(|e| {
      warn!(kind = %self.kind, "failed to load pending edits: {}", e);
      Vec::new()
    })
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      kind: self.kind.clone(),
      stale_time: self.stale_time,
    }
  }
}
