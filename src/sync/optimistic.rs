//! Optimistic cache: confirmed server state plus unconfirmed local edits.
//!
//! All mutation goes through this type. Every method takes the single lock
//! for its whole duration, so readers see either the state before or after a
//! `confirm`, never a mix.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::resource::types::{Patch, PendingEdit, Resource};

/// Snapshot of an entry's epoch taken before an async operation.
///
/// Completions carrying an outdated ticket are discarded: `invalidate`
/// bumps the epoch so nothing started earlier can mutate the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Default)]
struct Entry {
  confirmed: Option<Resource>,
  pending: Option<PendingEdit>,
  epoch: u64,
}

#[derive(Debug, Default)]
pub struct OptimisticCache {
  entries: RwLock<HashMap<String, Entry>>,
  revisions: AtomicU64,
}

impl OptimisticCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn read_lock(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
    self.entries.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write_lock(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
    self.entries.write().unwrap_or_else(PoisonError::into_inner)
  }

  /// Merged view: confirmed state with the pending edit laid over it.
  ///
  /// A resource that was only edited locally is returned without `updated_at`.
  pub fn read(&self, id: &str) -> Option<Resource> {
    let entries = self.read_lock();
    let entry = entries.get(id)?;

    match (&entry.confirmed, &entry.pending) {
      (Some(confirmed), Some(pending)) => Some(confirmed.merged(&pending.patch)),
      (Some(confirmed), None) => Some(confirmed.clone()),
      (None, Some(pending)) => Some(Resource::new(id, pending.patch.as_map().clone())),
      (None, None) => None,
    }
  }

  pub fn confirmed(&self, id: &str) -> Option<Resource> {
    self.read_lock().get(id).and_then(|e| e.confirmed.clone())
  }

  pub fn pending(&self, id: &str) -> Option<PendingEdit> {
    self.read_lock().get(id).and_then(|e| e.pending.clone())
  }

  pub fn has_unsaved_changes(&self, id: &str) -> bool {
    self
      .read_lock()
      .get(id)
      .is_some_and(|e| e.pending.is_some())
  }

  /// Resource ids that currently hold a pending edit.
  pub fn unsaved_ids(&self) -> Vec<String> {
    self
      .read_lock()
      .iter()
      .filter(|(_, e)| e.pending.is_some())
      .map(|(id, _)| id.clone())
      .collect()
  }

  pub fn ticket(&self, id: &str) -> Ticket {
    if let Some(entry) = self.read_lock().get(id) {
      return Ticket(entry.epoch);
    }
    Ticket(self.write_lock().entry(id.to_string()).or_default().epoch)
  }

  /// Record a local edit, merging it into any pending edit for the same id.
  pub fn apply(&self, id: &str, patch: Patch) -> PendingEdit {
    let revision = self.revisions.fetch_add(1, Ordering::Relaxed) + 1;
    let mut entries = self.write_lock();
    let entry = entries.entry(id.to_string()).or_default();

    let pending = match entry.pending.take() {
      Some(mut pending) => {
        pending.patch.merge(patch);
        pending.revision = revision;
        pending
      }
      None => PendingEdit {
        resource_id: id.to_string(),
        patch,
        revision,
        created_at: Utc::now(),
      },
    };

    entry.pending = Some(pending.clone());
    pending
  }

  /// Bring back an edit persisted by an earlier session.
  pub fn restore(&self, edit: PendingEdit) {
    self
      .revisions
      .fetch_max(edit.revision, Ordering::Relaxed);
    let mut entries = self.write_lock();
    let entry = entries.entry(edit.resource_id.clone()).or_default();
    match &mut entry.pending {
      Some(existing) => {
        // Edits made in this session win over restored ones
        let mut restored = edit.patch;
        restored.merge(existing.patch.clone());
        existing.patch = restored;
      }
      None => entry.pending = Some(edit),
    }
  }

  /// Accept the server's answer to a write of `sent`.
  ///
  /// Replaces the confirmed state and drops the sent fields from the pending
  /// edit; fields edited again while the write was in flight stay pending.
  /// Returns false (and changes nothing) if the ticket is outdated.
  pub fn confirm(&self, id: &str, ticket: Ticket, resource: Resource, sent: &Patch) -> bool {
    let mut entries = self.write_lock();
    let entry = entries.entry(id.to_string()).or_default();
    if entry.epoch != ticket.0 {
      debug!(id, "dropping confirmation from cancelled write");
      return false;
    }

    entry.confirmed = Some(resource);
    entry.pending = entry.pending.take().and_then(|mut pending| {
      pending.patch = pending.patch.without_sent(sent);
      (!pending.patch.is_empty()).then_some(pending)
    });
    true
  }

  /// Accept freshly fetched server state, keeping pending edits.
  ///
  /// A resource older than the confirmed one is ignored. Returns true if the
  /// confirmed state changed.
  pub fn reconcile(&self, id: &str, ticket: Ticket, resource: Resource) -> bool {
    let mut entries = self.write_lock();
    let entry = entries.entry(id.to_string()).or_default();
    if entry.epoch != ticket.0 {
      debug!(id, "dropping refresh from cancelled request");
      return false;
    }

    if let Some(confirmed) = &entry.confirmed {
      if confirmed.is_newer_than(&resource) {
        debug!(id, "ignoring stale refresh");
        return false;
      }
      if *confirmed == resource {
        return false;
      }
    }

    entry.confirmed = Some(resource);
    true
  }

  /// Drop the pending edit (explicit user cancel).
  pub fn discard(&self, id: &str) -> Option<PendingEdit> {
    self.write_lock().get_mut(id).and_then(|e| e.pending.take())
  }

  /// Outdate every ticket handed out for `id`.
  pub fn invalidate(&self, id: &str) {
    self.write_lock().entry(id.to_string()).or_default().epoch += 1;
  }

  /// Forget the resource after it was deleted on the server.
  ///
  /// The entry keeps its (bumped) epoch so late completions stay rejected.
  pub fn forget(&self, id: &str, ticket: Ticket) -> bool {
    let mut entries = self.write_lock();
    let entry = entries.entry(id.to_string()).or_default();
    if entry.epoch != ticket.0 {
      return false;
    }
    entry.confirmed = None;
    entry.pending = None;
    entry.epoch += 1;
    true
  }
}
