//! Request governor: timeout, bounded exponential backoff and keyed cancellation.

use futures::future::{AbortHandle, Abortable, Aborted};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Build the governor key for an operation on a resource.
///
/// Keys share the `"{resource_id}/"` prefix so a teardown can cancel them all.
pub fn request_key(resource_id: &str, purpose: &str) -> String {
  format!("{}/{}", resource_id, purpose)
}

/// Knobs for one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorOptions {
  /// Retries after the first attempt
  pub max_retries: u32,
  /// Budget for a single attempt
  pub timeout: Duration,
  /// Delay before the first retry; doubles on each further retry
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for GovernorOptions {
  fn default() -> Self {
    Self {
      max_retries: 3,
      timeout: Duration::from_millis(15_000),
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl GovernorOptions {
  /// Same budget, single attempt.
  pub fn without_retries(self) -> Self {
    Self {
      max_retries: 0,
      ..self
    }
  }

  /// Delay after the failed attempt number `attempt` (0-based):
  /// `2^attempt * base_delay`, capped, and never shorter than a server `Retry-After`.
  pub fn backoff(&self, attempt: u32, error: &SyncError) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

    match error {
      SyncError::ServerThrottled {
        retry_after: Some(retry_after),
      } => delay.max(*retry_after),
      _ => delay,
    }
  }
}

/// Bookkeeping for a request that is currently in flight.
#[derive(Debug, Clone)]
pub struct RequestState {
  pub started_at: Instant,
  pub last_attempt_at: Instant,
  /// 0 for the first attempt
  pub attempt: u32,
  pub last_error: Option<SyncError>,
}

struct InFlight {
  ticket: u64,
  abort: AbortHandle,
  state: RequestState,
}

/// Wraps outbound calls with a timeout, retry policy and cancellation handle.
#[derive(Clone)]
pub struct RequestGovernor {
  options: GovernorOptions,
  in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
  tickets: Arc<AtomicU64>,
}

impl RequestGovernor {
  pub fn new(options: GovernorOptions) -> Self {
    Self {
      options,
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      tickets: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Default options for this governor.
  pub fn options(&self) -> &GovernorOptions {
    &self.options
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run `operation` under the given options.
  ///
  /// Registers a cancellation handle under `request_id`; an earlier request still
  /// in flight under the same key is cancelled and resolves to `Cancelled`.
  pub async fn execute<T, F, Fut>(
    &self,
    request_id: &str,
    options: &GovernorOptions,
    operation: F,
  ) -> SyncResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
  {
    let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
    let (abort, registration) = AbortHandle::new_pair();

    {
      let now = Instant::now();
      let mut in_flight = self.lock();
      let previous = in_flight.insert(
        request_id.to_string(),
        InFlight {
          ticket,
          abort,
          state: RequestState {
            started_at: now,
            last_attempt_at: now,
            attempt: 0,
            last_error: None,
          },
        },
      );
      if let Some(previous) = previous {
        debug!(request_id, "cancelling superseded request");
        previous.abort.abort();
      }
    }

    let _guard = Registration {
      governor: self,
      request_id,
      ticket,
    };

    let attempts = self.run_attempts(request_id, ticket, options, operation);
    match Abortable::new(attempts, registration).await {
      Ok(result) => result,
      Err(Aborted) => Err(SyncError::Cancelled),
    }
  }

  async fn run_attempts<T, F, Fut>(
    &self,
    request_id: &str,
    ticket: u64,
    options: &GovernorOptions,
    mut operation: F,
  ) -> SyncResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
  {
    let mut attempt = 0;

    loop {
      self.record_attempt(request_id, ticket, attempt);

      let outcome = match tokio::time::timeout(options.timeout, operation()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(SyncError::Timeout(options.timeout)),
      };

      let error = match outcome {
        Ok(value) => return Ok(value),
        Err(error) => error,
      };

      if !error.is_retryable() {
        return Err(error);
      }
      if attempt >= options.max_retries {
        warn!(request_id, attempts = attempt + 1, %error, "giving up after retries");
        return Err(error);
      }

      let delay = options.backoff(attempt, &error);
      warn!(request_id, attempt, ?delay, %error, "retrying request");
      self.record_error(request_id, ticket, error);
      tokio::time::sleep(delay).await;
      attempt += 1;
    }
  }

  fn record_attempt(&self, request_id: &str, ticket: u64, attempt: u32) {
    if let Some(entry) = self.lock().get_mut(request_id) {
      if entry.ticket == ticket {
        entry.state.attempt = attempt;
        entry.state.last_attempt_at = Instant::now();
      }
    }
  }

  fn record_error(&self, request_id: &str, ticket: u64, error: SyncError) {
    if let Some(entry) = self.lock().get_mut(request_id) {
      if entry.ticket == ticket {
        entry.state.last_error = Some(error);
      }
    }
  }

  /// Cancel the request registered under `request_id`, if any.
  pub fn cancel(&self, request_id: &str) -> bool {
    match self.lock().remove(request_id) {
      Some(entry) => {
        entry.abort.abort();
        true
      }
      None => false,
    }
  }

  /// Cancel every request keyed under `resource_id`. Returns how many were cancelled.
  pub fn cancel_resource(&self, resource_id: &str) -> usize {
    let prefix = request_key(resource_id, "");
    let mut in_flight = self.lock();
    let keys: Vec<String> = in_flight
      .keys()
      .filter(|key| key.starts_with(&prefix))
      .cloned()
      .collect();

    for key in &keys {
      if let Some(entry) = in_flight.remove(key) {
        entry.abort.abort();
      }
    }
    keys.len()
  }

  pub fn cancel_all(&self) {
    for (_, entry) in self.lock().drain() {
      entry.abort.abort();
    }
  }

  pub fn is_in_flight(&self, request_id: &str) -> bool {
    self.lock().contains_key(request_id)
  }

  pub fn state(&self, request_id: &str) -> Option<RequestState> {
    self.lock().get(request_id).map(|entry| entry.state.clone())
  }
}

/// Removes the in-flight entry when `execute` resolves or is dropped.
struct Registration<'a> {
  governor: &'a RequestGovernor,
  request_id: &'a str,
  ticket: u64,
}

impl Drop for Registration<'_> {
  fn drop(&mut self) {
    let mut in_flight = self.governor.lock();
    if in_flight
      .get(self.request_id)
      .is_some_and(|entry| entry.ticket == self.ticket)
    {
      in_flight.remove(self.request_id);
    }
  }
}
