//! Infrastructure layer: durable job storage and store configuration.

pub mod config;
pub mod store;

pub use config::{DATABASE_URL_ENV, PostgresConfig, StoreConfig, connect};
pub use store::{ClaimRequest, InMemoryJobStore, JobStore, PostgresJobStore};
