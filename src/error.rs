//! Error types for synchronized resource operations.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the sync error taxonomy.
pub type SyncResult<T> = Result<T, SyncError>;

/// Field name -> validation messages reported by the backend.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Errors surfaced by the governor, the persistence queue and the facade.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
  /// A single attempt exceeded its time budget
  #[error("Request timed out after {}ms", .0.as_millis())]
  Timeout(Duration),

  /// The request was cancelled by a later request or by teardown
  #[error("Request was cancelled")]
  Cancelled,

  /// Server-side rate limiting (429 or an explicit `{"error": "throttled"}` body)
  #[error("Server throttled the request")]
  ServerThrottled { retry_after: Option<Duration> },

  #[error("Resource not found: {0}")]
  NotFound(String),

  #[error("Permission denied: {0}")]
  PermissionDenied(String),

  /// Rejected payload, with per-field detail when the backend provides it
  #[error("Validation failed: {message}")]
  Validation {
    message: String,
    field_errors: FieldErrors,
  },

  /// The edit was based on a stale version of the resource
  #[error("Conflict: {0}")]
  Conflict(String),

  /// Any other 4xx response
  #[error("Client error ({status}): {message}")]
  Client { status: u16, message: String },

  /// 5xx response
  #[error("Server error ({status}): {message}")]
  Server { status: u16, message: String },

  /// DNS, connection or transport failure
  #[error("Network error: {0}")]
  Network(String),

  #[error("Unknown error: {0}")]
  Unknown(String),
}

/// Fieldless discriminant of [`SyncError`], used for matching and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Timeout,
  Cancelled,
  ServerThrottled,
  NotFound,
  PermissionDenied,
  ValidationError,
  Conflict,
  ClientError,
  ServerError,
  NetworkError,
  Unknown,
}

impl SyncError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Timeout(_) => ErrorKind::Timeout,
      Self::Cancelled => ErrorKind::Cancelled,
      Self::ServerThrottled { .. } => ErrorKind::ServerThrottled,
      Self::NotFound(_) => ErrorKind::NotFound,
      Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
      Self::Validation { .. } => ErrorKind::ValidationError,
      Self::Conflict(_) => ErrorKind::Conflict,
      Self::Client { .. } => ErrorKind::ClientError,
      Self::Server { .. } => ErrorKind::ServerError,
      Self::Network(_) => ErrorKind::NetworkError,
      Self::Unknown(_) => ErrorKind::Unknown,
    }
  }

  /// Transient failures that the governor may retry.
  ///
  /// Client-side rejections (4xx family) and cancellation are never retried.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::Timeout(_) | Self::ServerThrottled { .. } | Self::Server { .. } | Self::Network(_)
    )
  }

  pub fn is_throttled(&self) -> bool {
    matches!(self, Self::ServerThrottled { .. })
  }

  /// Structured form handed to the view layer.
  pub fn to_view(&self) -> ViewError {
    let field_errors = match self {
      Self::Validation { field_errors, .. } if !field_errors.is_empty() => {
        Some(field_errors.clone())
      }
      _ => None,
    };

    ViewError {
      kind: self.kind(),
      message: self.to_string(),
      field_errors,
    }
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      // reqwest does not expose the configured budget
      Self::Timeout(Duration::ZERO)
    } else if e.is_connect() || e.is_request() {
      Self::Network(e.to_string())
    } else if e.is_decode() || e.is_body() {
      Self::Unknown(format!("Failed to read response: {}", e))
    } else {
      Self::Network(e.to_string())
    }
  }
}

/// Terminal error as presented to the view layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewError {
  pub kind: ErrorKind,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub field_errors: Option<FieldErrors>,
}
