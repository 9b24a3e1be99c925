//! Serde-deserializable types matching backend error responses.
//!
//! Success bodies deserialize straight into [`Resource`](super::types::Resource);
//! these types cover the error shapes the backend is known to produce.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::FieldErrors;

// ============================================================================
// Error body
// ============================================================================

/// `{"error": "...", "message": "...", "errors": {"field": [...]}}`
///
/// Every member is optional; field errors may be keyed `errors`,
/// `field_errors` or `fieldErrors` and each entry may be a string or a list.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
  pub error: Option<String>,
  pub message: Option<String>,
  pub detail: Option<String>,
  #[serde(default, alias = "field_errors", alias = "fieldErrors")]
  pub errors: Option<BTreeMap<String, ApiFieldMessages>>,
  /// Present on resource bodies; used to tell a resource apart from an error
  pub id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiFieldMessages {
  One(String),
  Many(Vec<String>),
}

impl ApiErrorBody {
  /// Parse a body leniently; non-JSON and non-object bodies yield `None`.
  pub fn parse(body: &str) -> Option<Self> {
    serde_json::from_str(body).ok()
  }

  /// Explicit throttle marker, independent of the HTTP status.
  pub fn is_throttled(&self) -> bool {
    self.id.is_none()
      && self
        .error
        .as_deref()
        .is_some_and(|e| e.eq_ignore_ascii_case("throttled"))
  }

  /// Most specific human-readable message available.
  pub fn message(&self) -> Option<String> {
    self
      .message
      .as_deref()
      .or(self.detail.as_deref())
      .or(self.error.as_deref())
      .map(|m| m.trim().to_string())
      .filter(|m| !m.is_empty())
  }

  pub fn field_errors(&self) -> FieldErrors {
    self
      .errors
      .as_ref()
      .map(|errors| {
        errors
          .iter()
          .map(|(field, messages)| {
            let messages = match messages {
              ApiFieldMessages::One(m) => vec![m.clone()],
              ApiFieldMessages::Many(ms) => ms.clone(),
            };
            (field.clone(), messages)
          })
          .collect()
      })
      .unwrap_or_default()
  }
}
