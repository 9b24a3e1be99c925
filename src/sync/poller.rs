//! Polling supervisor: periodic refresh with write deferral, request spacing
//! and throttle backoff.
//!
//! Per resource the supervisor moves `Idle -> Scheduled -> Fetching ->
//! Scheduled ...`, and into `Paused` after too many consecutive throttled
//! fetches. Results are handed to the sink while holding the supervisor lock,
//! after checking the poller's generation, so nothing reaches the sink once
//! `stop_polling` has returned. Whatever the sink defers runs after the lock
//! is released.

use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::event::{EventBus, SyncEvent};

use super::debounce::WriteMonitor;

/// Produces the fresh value for a resource id.
pub type Fetcher<T> = Arc<dyn Fn(String) -> BoxFuture<'static, SyncResult<T>> + Send + Sync>;

/// Work a sink hands back to run once the supervisor lock is released.
pub type AfterSink = Box<dyn FnOnce() + Send>;

/// Receives successfully fetched values.
///
/// Called under the supervisor lock, so it must not block; slow follow-up
/// work (persistence) goes in the returned [`AfterSink`].
pub type Sink<T> = Arc<dyn Fn(&str, T) -> Option<AfterSink> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
  /// Default delay between polls
  pub interval: Duration,
  /// Minimum time between two fetch attempts for the same resource
  pub min_spacing: Duration,
  pub throttle_backoff_cap: Duration,
  /// Throttled fetches in a row before polling pauses
  pub max_consecutive_throttles: u32,
}

impl Default for PollOptions {
  fn default() -> Self {
    Self {
      interval: Duration::from_millis(10_000),
      min_spacing: Duration::from_millis(2_000),
      throttle_backoff_cap: Duration::from_millis(10_000),
      max_consecutive_throttles: 3,
    }
  }
}

impl PollOptions {
  /// Retry delay after the `consecutive`-th throttled fetch (1-based).
  ///
  /// Doubles from `min_spacing`, capped, and never below `min_spacing`.
  pub fn throttle_delay(&self, consecutive: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive.saturating_sub(1));
    self
      .min_spacing
      .saturating_mul(factor)
      .min(self.throttle_backoff_cap)
      .max(self.min_spacing)
  }
}

/// Tracks the last fetch attempt per resource.
///
/// Shared between the poller and on-demand refreshes so neither fetches a
/// resource more often than `min` allows.
#[derive(Debug)]
pub struct FetchSpacing {
  min: Duration,
  last: Mutex<HashMap<String, Instant>>,
}

impl FetchSpacing {
  pub fn new(min: Duration) -> Self {
    Self {
      min,
      last: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
    self.last.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn record(&self, id: &str) {
    self.lock().insert(id.to_string(), Instant::now());
  }

  /// Time left before another fetch of `id` is allowed.
  pub fn remaining(&self, id: &str) -> Option<Duration> {
    let last = *self.lock().get(id)?;
    let elapsed = last.elapsed();
    (elapsed < self.min).then(|| self.min - elapsed)
  }

  pub fn is_ready(&self, id: &str) -> bool {
    self.remaining(id).is_none()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
  Idle,
  Scheduled,
  Fetching,
  /// Stopped after repeated throttling; see `resume`
  Paused,
}

struct PollSlot<T> {
  generation: u64,
  phase: PollPhase,
  throttles: u32,
  interval: Duration,
  fetcher: Fetcher<T>,
  task: Option<JoinHandle<()>>,
}

struct Shared<T> {
  options: PollOptions,
  spacing: Arc<FetchSpacing>,
  monitor: Option<Arc<dyn WriteMonitor>>,
  sink: Sink<T>,
  events: EventBus,
  slots: Mutex<HashMap<String, PollSlot<T>>>,
  generations: AtomicU64,
}

pub struct PollingSupervisor<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for PollingSupervisor<T> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<T: Send + 'static> PollingSupervisor<T> {
  pub fn new(
    options: PollOptions,
    spacing: Arc<FetchSpacing>,
    sink: Sink<T>,
    events: EventBus,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        options,
        spacing,
        monitor: None,
        sink,
        events,
        slots: Mutex::new(HashMap::new()),
        generations: AtomicU64::new(0),
      }),
    }
  }

  /// Defer polls while a write for the same resource is in flight.
  ///
  /// Must be called before the supervisor is cloned or used.
  pub fn with_write_monitor(mut self, monitor: Arc<dyn WriteMonitor>) -> Self {
    if let Some(shared) = Arc::get_mut(&mut self.shared) {
      shared.monitor = Some(monitor);
    }
    self
  }

  pub fn options(&self) -> &PollOptions {
    &self.shared.options
  }

  /// Start (or restart) polling `id` every `interval`.
  pub fn start_polling(&self, id: &str, interval: Duration, fetcher: Fetcher<T>) {
    let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed) + 1;
    let mut slots = self.shared.lock();

    if let Some(previous) = slots.remove(id) {
      if let Some(task) = previous.task {
        task.abort();
      }
    }

    let task = tokio::spawn(Arc::clone(&self.shared).run(
      id.to_string(),
      generation,
      interval,
      Arc::clone(&fetcher),
    ));
    slots.insert(
      id.to_string(),
      PollSlot {
        generation,
        phase: PollPhase::Scheduled,
        throttles: 0,
        interval,
        fetcher,
        task: Some(task),
      },
    );
    debug!(id, ?interval, "polling started");
  }

  /// Stop polling `id`, cancelling the pending timer and any fetch in flight.
  ///
  /// Returns false if `id` was not being polled.
  pub fn stop_polling(&self, id: &str) -> bool {
    match self.shared.lock().remove(id) {
      Some(slot) => {
        if let Some(task) = slot.task {
          task.abort();
        }
        debug!(id, "polling stopped");
        true
      }
      None => false,
    }
  }

  pub fn stop_all(&self) {
    for (_, slot) in self.shared.lock().drain() {
      if let Some(task) = slot.task {
        task.abort();
      }
    }
  }

  /// Restart a poller paused by throttling. Returns false if it was not paused.
  pub fn resume(&self, id: &str) -> bool {
    let restart = {
      let slots = self.shared.lock();
      slots
        .get(id)
        .filter(|slot| slot.phase == PollPhase::Paused)
        .map(|slot| (slot.interval, Arc::clone(&slot.fetcher)))
    };

    match restart {
      Some((interval, fetcher)) => {
        self.start_polling(id, interval, fetcher);
        self.shared.events.emit(SyncEvent::PollingResumed { id: id.to_string() });
        true
      }
      None => false,
    }
  }

  pub fn phase(&self, id: &str) -> PollPhase {
    self
      .shared
      .lock()
      .get(id)
      .map_or(PollPhase::Idle, |slot| slot.phase)
  }

  pub fn consecutive_throttles(&self, id: &str) -> u32 {
    self.shared.lock().get(id).map_or(0, |slot| slot.throttles)
  }
}

impl<T: Send + 'static> Shared<T> {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, PollSlot<T>>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  async fn run(self: Arc<Self>, id: String, generation: u64, interval: Duration, fetcher: Fetcher<T>) {
    let mut delay = interval;

    loop {
      if !self.set_phase(&id, generation, PollPhase::Scheduled) {
        return;
      }
      tokio::time::sleep(delay).await;
      self.wait_until_clear(&id).await;

      if !self.set_phase(&id, generation, PollPhase::Fetching) {
        return;
      }
      self.spacing.record(&id);

      let result = fetcher(id.clone()).await;
      match self.finish_fetch(&id, generation, result) {
        Some(next) => delay = next,
        None => return,
      }
    }
  }

  /// Wait until no write for `id` is in flight and min spacing has passed.
  ///
  /// Both are checked again after every wait: a write can start while the
  /// spacing wait runs and a fetch can happen while a write settles.
  async fn wait_until_clear(&self, id: &str) {
    loop {
      if let Some(monitor) = &self.monitor {
        if monitor.is_writing(id) {
          debug!(id, "write in flight, deferring poll");
          monitor.settled(id).await;
          continue;
        }
      }
      if let Some(wait) = self.spacing.remaining(id) {
        debug!(id, ?wait, "last fetch too recent, deferring poll");
        tokio::time::sleep(wait).await;
        continue;
      }
      return;
    }
  }

  fn set_phase(&self, id: &str, generation: u64, phase: PollPhase) -> bool {
    match self.lock().get_mut(id) {
      Some(slot) if slot.generation == generation => {
        slot.phase = phase;
        true
      }
      _ => false,
    }
  }

  /// Apply a fetch outcome and pick the next delay; `None` ends the loop.
  fn finish_fetch(&self, id: &str, generation: u64, result: SyncResult<T>) -> Option<Duration> {
    let (next, after) = self.apply_result(id, generation, result)?;
    if let Some(after) = after {
      after();
    }
    next
  }

  /// The locked part of `finish_fetch`. `None` if the poller was stopped or
  /// restarted while fetching.
  fn apply_result(
    &self,
    id: &str,
    generation: u64,
    result: SyncResult<T>,
  ) -> Option<(Option<Duration>, Option<AfterSink>)> {
    let mut slots = self.lock();
    let slot = slots
      .get_mut(id)
      .filter(|slot| slot.generation == generation)?;

    let next = match result {
      Ok(value) => {
        slot.throttles = 0;
        let after = (self.sink)(id, value);
        return Some((Some(slot.interval), after));
      }
      Err(error) if error.is_throttled() => {
        slot.throttles += 1;
        let consecutive = slot.throttles;

        if consecutive >= self.options.max_consecutive_throttles {
          slot.phase = PollPhase::Paused;
          // The loop ends on its own; dropping the handle detaches it
          slot.task = None;
          warn!(id, consecutive, "server keeps throttling, polling paused");
          self.events.emit(SyncEvent::PollingPaused {
            id: id.to_string(),
            consecutive,
          });
          return Some((None, None));
        }

        let retry_in = self.options.throttle_delay(consecutive);
        warn!(id, consecutive, ?retry_in, "poll throttled, backing off");
        self.events.emit(SyncEvent::PollThrottled {
          id: id.to_string(),
          consecutive,
          retry_in,
        });
        Some(retry_in)
      }
      // Superseded by, or yielded to, an on-demand read of the same resource
      Err(SyncError::Cancelled) => Some(slot.interval),
      Err(error) => {
        debug!(id, %error, "poll failed");
        self.events.emit(SyncEvent::FetchFailed {
          id: id.to_string(),
          error,
        });
        Some(slot.interval)
      }
    };
    Some((next, None))
  }
}
