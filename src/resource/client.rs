use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::{SyncError, SyncResult};

use super::api_types::ApiErrorBody;
use super::types::{Patch, Resource, ResourceKind};

/// One backend call. Matched exhaustively when building requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
  Get { id: String },
  Create { payload: Map<String, Value> },
  Update { id: String, patch: Patch },
  Archive { id: String },
  Delete { id: String },
}

impl Operation {
  pub fn method(&self) -> Method {
    match self {
      Self::Get { .. } => Method::GET,
      Self::Create { .. } | Self::Archive { .. } => Method::POST,
      Self::Update { .. } => Method::PATCH,
      Self::Delete { .. } => Method::DELETE,
    }
  }

  /// Path relative to the API base URL.
  pub fn path(&self, kind: &ResourceKind) -> String {
    match self {
      Self::Create { .. } => kind.name().to_string(),
      Self::Get { id } | Self::Update { id, .. } | Self::Delete { id } => {
        format!("{}/{}", kind.name(), id)
      }
      Self::Archive { id } => format!("{}/{}/archive", kind.name(), id),
    }
  }

  pub fn resource_id(&self) -> Option<&str> {
    match self {
      Self::Create { .. } => None,
      Self::Get { id } | Self::Update { id, .. } | Self::Archive { id } | Self::Delete { id } => {
        Some(id)
      }
    }
  }

  pub fn label(&self) -> &'static str {
    match self {
      Self::Get { .. } => "get",
      Self::Create { .. } => "create",
      Self::Update { .. } => "update",
      Self::Archive { .. } => "archive",
      Self::Delete { .. } => "delete",
    }
  }

  pub fn is_write(&self) -> bool {
    !matches!(self, Self::Get { .. })
  }
}

/// Successful backend reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
  Resource(Resource),
  /// 2xx without a body (e.g. 204 after delete)
  Empty,
}

impl Reply {
  pub fn into_resource(self) -> SyncResult<Resource> {
    match self {
      Self::Resource(resource) => Ok(resource),
      Self::Empty => Err(SyncError::Unknown(
        "Expected a resource in the response body".to_string(),
      )),
    }
  }
}

/// Transport seam between the facade and the REST backend.
///
/// Returned futures are `'static` so the governor can re-issue and cancel them.
pub trait Backend: Send + Sync + 'static {
  fn execute(&self, kind: &ResourceKind, operation: Operation) -> BoxFuture<'static, SyncResult<Reply>>;
}

/// reqwest-based backend speaking JSON over HTTPS with a bearer credential.
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
  base_url: Url,
  token: String,
}

impl HttpBackend {
  pub fn new(base_url: &str, token: impl Into<String>) -> SyncResult<Self> {
    let mut base_url = Url::parse(base_url)
      .map_err(|e| SyncError::Unknown(format!("Invalid backend URL {}: {}", base_url, e)))?;

    // Url::join replaces the last segment unless the base ends with '/'
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| SyncError::Unknown(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      token: token.into(),
    })
  }

  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    let token = Config::get_api_token()?;
    Ok(Self::new(&config.backend.url, token)?)
  }

  pub fn endpoint(&self, kind: &ResourceKind, operation: &Operation) -> SyncResult<Url> {
    self
      .base_url
      .join(&operation.path(kind))
      .map_err(|e| SyncError::Unknown(format!("Invalid resource path: {}", e)))
  }
}

impl Backend for HttpBackend {
  fn execute(&self, kind: &ResourceKind, operation: Operation) -> BoxFuture<'static, SyncResult<Reply>> {
    let client = self.client.clone();
    let token = self.token.clone();
    let endpoint = self.endpoint(kind, &operation);

    Box::pin(async move {
      let endpoint = endpoint?;
      debug!(method = %operation.method(), url = %endpoint, "sending request");

      let request = client
        .request(operation.method(), endpoint)
        .bearer_auth(&token)
        .header("Accept", "application/json");

      let request = match &operation {
        Operation::Create { payload } => request.json(payload),
        Operation::Update { patch, .. } => request.json(patch),
        Operation::Get { .. } | Operation::Archive { .. } | Operation::Delete { .. } => request,
      };

      let response = request.send().await?;
      let status = response.status();
      let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()));
      let body = response.text().await?;

      classify_response(status, retry_after, &body, operation.resource_id())
    })
  }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// A date in the past means "retry now".
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
  let value = value.trim();
  if let Ok(seconds) = value.parse::<u64>() {
    return Some(Duration::from_secs(seconds));
  }
  let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
  Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Map an HTTP status and body onto a reply or the error taxonomy.
pub fn classify_response(
  status: StatusCode,
  retry_after: Option<Duration>,
  body: &str,
  resource_id: Option<&str>,
) -> SyncResult<Reply> {
  let error_body = ApiErrorBody::parse(body);

  if status == StatusCode::TOO_MANY_REQUESTS
    || error_body.as_ref().is_some_and(ApiErrorBody::is_throttled)
  {
    return Err(SyncError::ServerThrottled { retry_after });
  }

  if status.is_success() {
    if body.trim().is_empty() {
      return Ok(Reply::Empty);
    }
    return serde_json::from_str::<Resource>(body)
      .map(Reply::Resource)
      .map_err(|e| SyncError::Unknown(format!("Failed to parse resource: {}", e)));
  }

  let error_body = error_body.unwrap_or_default();
  let message = error_body.message().unwrap_or_else(|| {
    let trimmed = body.trim();
    if trimmed.is_empty() {
      format!("HTTP {}", status.as_u16())
    } else {
      trimmed.to_string()
    }
  });

  let error = match status {
    StatusCode::NOT_FOUND => SyncError::NotFound(resource_id.unwrap_or(&message).to_string()),
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::PermissionDenied(message),
    StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => SyncError::Conflict(message),
    StatusCode::UNPROCESSABLE_ENTITY => SyncError::Validation {
      message,
      field_errors: error_body.field_errors(),
    },
    StatusCode::BAD_REQUEST if error_body.errors.is_some() => SyncError::Validation {
      message,
      field_errors: error_body.field_errors(),
    },
    s if s.is_client_error() => SyncError::Client {
      status: s.as_u16(),
      message,
    },
    s if s.is_server_error() => SyncError::Server {
      status: s.as_u16(),
      message,
    },
    s => SyncError::Unknown(format!("Unexpected status {}: {}", s.as_u16(), message)),
  };

  Err(error)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_operation_routes() {
    let kind = ResourceKind::new("documents");
    let cases = [
      (Operation::Get { id: "d1".into() }, Method::GET, "documents/d1"),
      (
        Operation::Create {
          payload: Map::new(),
        },
        Method::POST,
        "documents",
      ),
      (
        Operation::Update {
          id: "d1".into(),
          patch: Patch::new(),
        },
        Method::PATCH,
        "documents/d1",
      ),
      (
        Operation::Archive { id: "d1".into() },
        Method::POST,
        "documents/d1/archive",
      ),
      (
        Operation::Delete { id: "d1".into() },
        Method::DELETE,
        "documents/d1",
      ),
    ];

    for (op, method, path) in cases {
      assert_eq!(op.method(), method, "{}", op.label());
      assert_eq!(op.path(&kind), path);
    }
  }

  #[test]
  fn test_endpoint_keeps_base_path() {
    let backend = HttpBackend::new("https://api.example.org/v2", "token").unwrap();
    let url = backend
      .endpoint(
        &ResourceKind::new("cases"),
        &Operation::Archive { id: "c9".into() },
      )
      .unwrap();
    assert_eq!(url.as_str(), "https://api.example.org/v2/cases/c9/archive");
  }

  #[test]
  fn test_classify_success() {
    let reply = classify_response(
      StatusCode::OK,
      None,
      r#"{"id": "d1", "title": "A"}"#,
      Some("d1"),
    )
    .unwrap();
    assert!(matches!(reply, Reply::Resource(r) if r.id == "d1"));

    let reply = classify_response(StatusCode::NO_CONTENT, None, "", Some("d1")).unwrap();
    assert_eq!(reply, Reply::Empty);
  }

  #[test]
  fn test_classify_throttling() {
    let err = classify_response(
      StatusCode::TOO_MANY_REQUESTS,
      Some(Duration::from_secs(3)),
      "",
      None,
    )
    .unwrap_err();
    assert_eq!(
      err,
      SyncError::ServerThrottled {
        retry_after: Some(Duration::from_secs(3))
      }
    );

    // Throttle marker in an otherwise successful response
    let err = classify_response(StatusCode::OK, None, r#"{"error":"throttled"}"#, None).unwrap_err();
    assert!(err.is_throttled());
  }

  #[test]
  fn test_retry_after_forms() {
    let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
      .unwrap()
      .with_timezone(&Utc);

    assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
    assert_eq!(
      parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
      Some(Duration::from_secs(30))
    );
    assert_eq!(
      parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
      Some(Duration::ZERO)
    );
    assert_eq!(parse_retry_after("soon", now), None);
  }

  #[test]
  fn test_classify_client_errors() {
    let err = classify_response(
      StatusCode::UNPROCESSABLE_ENTITY,
      None,
      r#"{"message": "invalid", "errors": {"title": ["required"]}}"#,
      Some("d1"),
    )
    .unwrap_err();
    match err {
      SyncError::Validation { field_errors, .. } => {
        assert_eq!(field_errors["title"], vec!["required".to_string()])
      }
      other => panic!("expected validation error, got {:?}", other),
    }

    let err = classify_response(StatusCode::NOT_FOUND, None, "", Some("d1")).unwrap_err();
    assert_eq!(err, SyncError::NotFound("d1".into()));

    let err = classify_response(StatusCode::FORBIDDEN, None, "", Some("d1")).unwrap_err();
    assert!(matches!(err, SyncError::PermissionDenied(_)));

    let err = classify_response(StatusCode::CONFLICT, None, r#"{"error":"stale"}"#, Some("d1"))
      .unwrap_err();
    assert_eq!(err, SyncError::Conflict("stale".into()));

    let err = classify_response(StatusCode::BAD_GATEWAY, None, "upstream", None).unwrap_err();
    assert!(err.is_retryable());
  }
}
