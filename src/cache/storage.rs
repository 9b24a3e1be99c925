//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::resource::types::{PendingEdit, Resource};

/// A single cached entity.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  /// The cached entity
  pub entity: T,
  /// When the entity was cached
  pub cached_at: DateTime<Utc>,
}

/// Durable local copy of confirmed resources and unsaved edits.
///
/// Injected into the facade; `kind` namespaces each resource type.
pub trait CacheStorage: Send + Sync {
  /// Store (or refresh) the confirmed snapshot of a resource.
  fn store_resource(&self, kind: &str, resource: &Resource) -> Result<()>;

  /// Get the confirmed snapshot of a resource.
  fn get_resource(&self, kind: &str, id: &str) -> Result<Option<CachedEntity<Resource>>>;

  fn remove_resource(&self, kind: &str, id: &str) -> Result<()>;

  /// Store the current pending edit of a resource, replacing any earlier one.
  fn store_pending(&self, kind: &str, edit: &PendingEdit) -> Result<()>;

  fn clear_pending(&self, kind: &str, id: &str) -> Result<()>;

  /// All pending edits of a kind, oldest first.
  fn pending_edits(&self, kind: &str) -> Result<Vec<PendingEdit>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn store_resource(&self, _kind: &str, _resource: &Resource) -> Result<()> {
    Ok(()) // Discard
  }

  fn get_resource(&self, _kind: &str, _id: &str) -> Result<Option<CachedEntity<Resource>>> {
    Ok(None) // Always miss
  }

  fn remove_resource(&self, _kind: &str, _id: &str) -> Result<()> {
    Ok(())
  }

  fn store_pending(&self, _kind: &str, _edit: &PendingEdit) -> Result<()> {
    Ok(()) // Discard
  }

  fn clear_pending(&self, _kind: &str, _id: &str) -> Result<()> {
    Ok(())
  }

  fn pending_edits(&self, _kind: &str) -> Result<Vec<PendingEdit>> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Private, non-persistent database (tests, ephemeral sessions).
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("orgsync").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Confirmed server state (serialized JSON)
CREATE TABLE IF NOT EXISTS resource_cache (
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    data BLOB NOT NULL,
    fingerprint TEXT NOT NULL,
    updated_at TEXT,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (kind, id)
);

-- Unsaved local edits, one merged patch per resource
CREATE TABLE IF NOT EXISTS pending_edits (
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    patch BLOB NOT NULL,
    revision INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (kind, id)
);
"#;

impl CacheStorage for SqliteStorage {
  fn store_resource(&self, kind: &str, resource: &Resource) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let fingerprint = resource.fingerprint();
    let updated_at = resource.updated_at.map(|t| t.to_rfc3339());

    // Unchanged snapshots only get their cached_at refreshed
    let touched = conn
      .execute(
        "UPDATE resource_cache SET cached_at = datetime('now')
         WHERE kind = ? AND id = ? AND fingerprint = ? AND updated_at IS ?",
        params![kind, resource.id, fingerprint, updated_at],
      )
      .map_err(|e| eyre!("Failed to refresh cached resource: {}", e))?;
    if touched > 0 {
      return Ok(());
    }

    let data =
      serde_json::to_vec(resource).map_err(|e| eyre!("Failed to serialize resource: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO resource_cache (kind, id, data, fingerprint, updated_at, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![kind, resource.id, data, fingerprint, updated_at],
      )
      .map_err(|e| eyre!("Failed to store resource: {}", e))?;

    Ok(())
  }

  fn get_resource(&self, kind: &str, id: &str) -> Result<Option<CachedEntity<Resource>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let result: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM resource_cache WHERE kind = ? AND id = ?",
        params![kind, id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query resource cache: {}", e))?;

    match result {
      Some((data, cached_at_str)) => {
        let entity: Resource = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize resource: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntity { entity, cached_at }))
      }
      None => Ok(None),
    }
  }

  fn remove_resource(&self, kind: &str, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM resource_cache WHERE kind = ? AND id = ?",
        params![kind, id],
      )
      .map_err(|e| eyre!("Failed to remove cached resource: {}", e))?;

    Ok(())
  }

  fn store_pending(&self, kind: &str, edit: &PendingEdit) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let patch =
      serde_json::to_vec(&edit.patch).map_err(|e| eyre!("Failed to serialize patch: {}", e))?;
    let revision = i64::try_from(edit.revision).unwrap_or(i64::MAX);

    conn
      .execute(
        "INSERT OR REPLACE INTO pending_edits (kind, id, patch, revision, created_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          kind,
          edit.resource_id,
          patch,
          revision,
          edit.created_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store pending edit: {}", e))?;

    Ok(())
  }

  fn clear_pending(&self, kind: &str, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM pending_edits WHERE kind = ? AND id = ?",
        params![kind, id],
      )
      .map_err(|e| eyre!("Failed to clear pending edit: {}", e))?;

    Ok(())
  }

  fn pending_edits(&self, kind: &str) -> Result<Vec<PendingEdit>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, patch, revision, created_at FROM pending_edits
         WHERE kind = ?
         ORDER BY created_at",
      )
      .map_err(|e| eyre!("Failed to prepare pending edit query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, i64, String)> = stmt
      .query_map(params![kind], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query pending edits: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut edits = Vec::with_capacity(rows.len());
    for (id, patch, revision, created_at) in rows {
      let patch =
        serde_json::from_slice(&patch).map_err(|e| eyre!("Failed to parse pending edit: {}", e))?;
      let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| eyre!("Failed to parse datetime '{}': {}", created_at, e))?
        .with_timezone(&Utc);
      edits.push(PendingEdit {
        resource_id: id,
        patch,
        revision: u64::try_from(revision).unwrap_or_default(),
        created_at,
      });
    }

    Ok(edits)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
