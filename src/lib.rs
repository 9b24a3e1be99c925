//! Synchronized resource client: optimistic edits, debounced persistence,
//! throttle-aware polling and request governance over a REST backend.

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod query;
pub mod resource;
pub mod sync;

pub use error::{SyncError, SyncResult, ViewError};
pub use query::{ResourceQuery, ResourceState};
pub use resource::{FacadeOptions, Patch, Resource, ResourceFacade, ResourceKind};
