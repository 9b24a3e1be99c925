pub mod api_types;
pub mod client;
pub mod facade;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use client::{Backend, HttpBackend, Operation, Reply};
pub use facade::{FacadeOptions, ResourceFacade};
pub use types::{Patch, PendingEdit, Resource, ResourceKind};
