//! Persistence layer for the orchestrator: a `Repository` trait plus a
//! Postgres-backed implementation for production and an in-memory one for
//! tests and local development.

pub mod memory;
pub mod postgres;
pub mod repository;

pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;
pub use repository::{Pagination, Repository, WorkFailOutcome, WorkSuccessOutcome};

use std::sync::Arc;

/// The two backends share one dynamic-dispatch handle so the rest of the
/// workspace never needs to know which one it's talking to.
pub type SharedRepository = Arc<dyn Repository>;
