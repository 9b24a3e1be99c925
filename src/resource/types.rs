use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Logical resource type served under one collection path (e.g. "documents").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
  name: String,
}

impl ResourceKind {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into().trim_matches('/').to_string(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl std::fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.name)
  }
}

/// Server-owned entity as cached by the client.
///
/// Everything except `id` and `updated_at` is kept as an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
  #[serde(deserialize_with = "string_or_number")]
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub payload: Map<String, Value>,
}

impl Resource {
  pub fn new(id: impl Into<String>, payload: Map<String, Value>) -> Self {
    Self {
      id: id.into(),
      updated_at: None,
      payload,
    }
  }

  pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
    self.updated_at = Some(updated_at);
    self
  }

  /// Copy of this resource with the patch laid over it, field by field.
  pub fn merged(&self, patch: &Patch) -> Self {
    let mut merged = self.clone();
    patch.apply_to(&mut merged.payload);
    merged
  }

  /// True when `other` carries an older version than this resource.
  pub fn is_newer_than(&self, other: &Resource) -> bool {
    match (self.updated_at, other.updated_at) {
      (Some(mine), Some(theirs)) => mine > theirs,
      _ => false,
    }
  }

  /// SHA-256 over the serialized payload, used to detect no-op refreshes.
  pub fn fingerprint(&self) -> String {
    // serde_json::Map is ordered, so serialization is stable
    let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
  }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

/// Partial resource: top-level fields to overwrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Map<String, Value>);

/// Fields owned by the server that a patch never touches.
const RESERVED_FIELDS: &[&str] = &["id", "updated_at"];

impl Patch {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style field assignment.
  pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.insert(field, value);
    self
  }

  pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
    let field = field.into();
    if !RESERVED_FIELDS.contains(&field.as_str()) {
      self.0.insert(field, value.into());
    }
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn fields(&self) -> impl Iterator<Item = &str> {
    self.0.keys().map(String::as_str)
  }

  /// Field-wise merge; fields from `newer` win.
  pub fn merge(&mut self, newer: Patch) {
    for (field, value) in newer.0 {
      self.0.insert(field, value);
    }
  }

  pub fn apply_to(&self, payload: &mut Map<String, Value>) {
    for (field, value) in &self.0 {
      payload.insert(field.clone(), value.clone());
    }
  }

  /// Fields whose value differs from what was already sent.
  pub fn without_sent(&self, sent: &Patch) -> Patch {
    Patch(
      self
        .0
        .iter()
        .filter(|(field, value)| sent.0.get(*field) != Some(*value))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect(),
    )
  }

  pub fn as_map(&self) -> &Map<String, Value> {
    &self.0
  }

  pub fn into_map(self) -> Map<String, Value> {
    self.0
  }
}

impl From<Map<String, Value>> for Patch {
  fn from(map: Map<String, Value>) -> Self {
    map.into_iter().collect()
  }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Patch {
  fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
    let mut patch = Patch::new();
    for (field, value) in iter {
      patch.insert(field, value);
    }
    patch
  }
}

/// Local mutation not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEdit {
  pub resource_id: String,
  pub patch: Patch,
  /// Bumped on every `apply`; lets a confirm tell old edits from new ones
  pub revision: u64,
  pub created_at: DateTime<Utc>,
}
