//! In-memory backend for tests.

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

use super::client::{Backend, Operation, Reply};
use super::types::{Resource, ResourceKind};

#[derive(Default)]
struct State {
  resources: HashMap<String, Resource>,
  /// Logical clock driving `updated_at`
  clock: i64,
  next_id: u64,
  calls: Vec<Operation>,
  /// One-shot failures, matched by operation label
  scripted: VecDeque<(&'static str, SyncError)>,
  /// Failures returned until cleared
  persistent: HashMap<&'static str, SyncError>,
  latency: Duration,
}

/// Current and highest number of requests of one sort in flight.
#[derive(Default)]
struct Gauge {
  active: AtomicUsize,
  peak: AtomicUsize,
}

#[derive(Default)]
struct Inner {
  state: Mutex<State>,
  reads: Arc<Gauge>,
  writes: Arc<Gauge>,
}

/// Fake REST server: resources live in memory, failures and latency are scripted.
#[derive(Clone, Default)]
pub struct FakeBackend {
  inner: Arc<Inner>,
}

fn timestamp(clock: i64) -> DateTime<Utc> {
  Utc.timestamp_opt(1_700_000_000 + clock, 0).unwrap()
}

impl FakeBackend {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_latency(self, latency: Duration) -> Self {
    self.inner.state.lock().unwrap().latency = latency;
    self
  }

  /// Put a resource on the server.
  pub fn seed(&self, id: &str, payload: Value) -> Resource {
    let mut state = self.inner.state.lock().unwrap();
    state.clock += 1;
    let payload: Map<String, Value> = serde_json::from_value(payload).unwrap();
    let resource = Resource::new(id, payload).with_updated_at(timestamp(state.clock));
    state.resources.insert(id.to_string(), resource.clone());
    resource
  }

  /// Fail the next operation with this label once.
  pub fn fail_next(&self, label: &'static str, error: SyncError) {
    self.inner.state.lock().unwrap().scripted.push_back((label, error));
  }

  /// Fail every operation with this label until `clear_failures`.
  pub fn fail_always(&self, label: &'static str, error: SyncError) {
    self.inner.state.lock().unwrap().persistent.insert(label, error);
  }

  pub fn clear_failures(&self) {
    let mut state = self.inner.state.lock().unwrap();
    state.scripted.clear();
    state.persistent.clear();
  }

  pub fn resource(&self, id: &str) -> Option<Resource> {
    self.inner.state.lock().unwrap().resources.get(id).cloned()
  }

  pub fn calls(&self) -> Vec<Operation> {
    self.inner.state.lock().unwrap().calls.clone()
  }

  pub fn count(&self, label: &str) -> usize {
    self
      .calls()
      .iter()
      .filter(|operation| operation.label() == label)
      .count()
  }

  /// Highest number of writes that were ever in flight at once.
  pub fn peak_writes(&self) -> usize {
    self.inner.writes.peak.load(Ordering::SeqCst)
  }

  /// Highest number of GETs that were ever in flight at once.
  pub fn peak_reads(&self) -> usize {
    self.inner.reads.peak.load(Ordering::SeqCst)
  }
}

/// Counts a request as in flight until dropped (completion or abort).
struct Active(Arc<Gauge>);

impl Active {
  fn start(gauge: &Arc<Gauge>) -> Self {
    let active = gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
    gauge.peak.fetch_max(active, Ordering::SeqCst);
    Self(Arc::clone(gauge))
  }
}

impl Drop for Active {
  fn drop(&mut self) {
    self.0.active.fetch_sub(1, Ordering::SeqCst);
  }
}

impl Inner {
  fn take_failure(&self, label: &'static str) -> Option<SyncError> {
    let mut state = self.state.lock().unwrap();
    if let Some(error) = state.persistent.get(label) {
      return Some(error.clone());
    }
    let position = state.scripted.iter().position(|(l, _)| *l == label)?;
    state.scripted.remove(position).map(|(_, error)| error)
  }

  fn handle(&self, operation: Operation) -> SyncResult<Reply> {
    let mut state = self.state.lock().unwrap();
    match operation {
      Operation::Get { id } => state
        .resources
        .get(&id)
        .cloned()
        .map(Reply::Resource)
        .ok_or(SyncError::NotFound(id)),
      Operation::Create { payload } => {
        state.clock += 1;
        state.next_id += 1;
        let id = format!("new-{}", state.next_id);
        let resource = Resource::new(id.clone(), payload).with_updated_at(timestamp(state.clock));
        state.resources.insert(id, resource.clone());
        Ok(Reply::Resource(resource))
      }
      Operation::Update { id, patch } => {
        state.clock += 1;
        let clock = state.clock;
        let resource = state
          .resources
          .get_mut(&id)
          .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        patch.apply_to(&mut resource.payload);
        resource.updated_at = Some(timestamp(clock));
        Ok(Reply::Resource(resource.clone()))
      }
      Operation::Archive { id } => {
        state.clock += 1;
        let clock = state.clock;
        let resource = state
          .resources
          .get_mut(&id)
          .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        resource.payload.insert("archived".into(), json!(true));
        resource.updated_at = Some(timestamp(clock));
        Ok(Reply::Resource(resource.clone()))
      }
      Operation::Delete { id } => state
        .resources
        .remove(&id)
        .map(|_| Reply::Empty)
        .ok_or(SyncError::NotFound(id)),
    }
  }
}

impl Backend for FakeBackend {
  fn execute(&self, _kind: &ResourceKind, operation: Operation) -> BoxFuture<'static, SyncResult<Reply>> {
    let inner = Arc::clone(&self.inner);
    Box::pin(async move {
      let latency = {
        let mut state = inner.state.lock().unwrap();
        state.calls.push(operation.clone());
        state.latency
      };
      // Let a request this one superseded unwind before counting it
      tokio::task::yield_now().await;
      let gauge = if operation.is_write() { &inner.writes } else { &inner.reads };
      let _active = Active::start(gauge);

      tokio::time::sleep(latency).await;

      if let Some(error) = inner.take_failure(operation.label()) {
        return Err(error);
      }
      inner.handle(operation)
    })
  }
}
