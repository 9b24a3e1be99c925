/// Available commands and argument parsing helpers
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};

use orgsync::Patch;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
  /// Fetch a resource and print it as JSON
  Get {
    id: String,
    /// Skip a fresh local snapshot and go to the server
    #[arg(long)]
    force: bool,
  },
  /// Create a resource from a JSON object
  Create {
    #[arg(long, value_name = "JSON")]
    data: String,
  },
  /// Update fields of a resource right away
  Update {
    id: String,
    /// Field assignment, repeatable
    #[arg(long = "set", value_name = "FIELD=VALUE", required_unless_present = "data")]
    set: Vec<String>,
    /// Patch as a JSON object
    #[arg(long, value_name = "JSON", conflicts_with = "set")]
    data: Option<String>,
  },
  /// Archive (soft-delete) a resource
  Archive { id: String },
  /// Delete a resource
  Delete { id: String },
  /// Poll a resource and print every state change until Ctrl-C
  Watch {
    id: String,
    #[arg(long)]
    interval_ms: Option<u64>,
  },
  /// Read FIELD=VALUE lines from stdin as debounced edits; save on EOF
  Edit { id: String },
}

/// Parse a JSON object argument.
pub fn parse_object(json: &str) -> Result<Map<String, Value>> {
  match serde_json::from_str(json) {
    Ok(Value::Object(map)) => Ok(map),
    Ok(_) => Err(eyre!("Expected a JSON object, got: {}", json)),
    Err(e) => Err(eyre!("Invalid JSON: {}", e)),
  }
}

/// Parse `field=value`. The value is read as JSON when it parses as JSON
/// (`count=3`, `done=true`), as a plain string otherwise (`title=Q3 report`).
pub fn parse_assignment(input: &str) -> Result<(String, Value)> {
  let (field, raw) = input
    .split_once('=')
    .ok_or_else(|| eyre!("Expected FIELD=VALUE, got: {}", input))?;

  let field = field.trim();
  if field.is_empty() {
    return Err(eyre!("Missing field name in: {}", input));
  }

  let raw = raw.trim();
  let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
  Ok((field.to_string(), value))
}

/// Build a patch from `--set` assignments or a `--data` object.
pub fn patch_from(set: &[String], data: Option<&str>) -> Result<Patch> {
  if let Some(data) = data {
    return Ok(Patch::from(parse_object(data)?));
  }

  set
    .iter()
    .map(|assignment| parse_assignment(assignment))
    .collect::<Result<Vec<_>>>()
    .map(|fields| fields.into_iter().collect())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_assignment_values() {
    assert_eq!(parse_assignment("count=3").unwrap(), ("count".into(), json!(3)));
    assert_eq!(parse_assignment("done = true").unwrap(), ("done".into(), json!(true)));
    assert_eq!(
      parse_assignment("title=Q3 report").unwrap(),
      ("title".into(), json!("Q3 report"))
    );
    assert_eq!(parse_assignment("note=").unwrap(), ("note".into(), json!("")));
    assert_eq!(
      parse_assignment("expr=a=b").unwrap(),
      ("expr".into(), json!("a=b"))
    );
  }

  #[test]
  fn test_invalid_assignments() {
    assert!(parse_assignment("title").is_err());
    assert!(parse_assignment("=value").is_err());
  }

  #[test]
  fn test_patch_from_set_and_data() {
    let patch = patch_from(&["title=A".to_string(), "count=2".to_string()], None).unwrap();
    assert_eq!(patch, Patch::new().set("title", "A").set("count", 2));

    let patch = patch_from(&[], Some(r#"{"title": "B"}"#)).unwrap();
    assert_eq!(patch, Patch::new().set("title", "B"));

    assert!(patch_from(&[], Some("[1, 2]")).is_err());
  }
}
