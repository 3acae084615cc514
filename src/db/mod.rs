//! Database module for linkwatch.
//!
//! Provides the repository seam the monitor consumes and its SQLite
//! implementation.

mod models;
mod repository;
mod store;

pub use models::*;
pub use repository::*;
pub use store::*;

#[cfg(test)]
pub(crate) use repository::faults::FaultyRepository;
