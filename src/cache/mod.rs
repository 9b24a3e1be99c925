//! Local snapshot cache for data persistence and offline support.
//!
//! This module provides a resource-agnostic persistence adapter that:
//! - Stores the last confirmed server state per (kind, id)
//! - Stores unsaved pending edits so they survive restarts
//! - Provides basic offline mode (serve the snapshot when the network is unavailable)

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, CachedEntity, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
