//! One-way mirror of calendars, appointments and service assignments from a
//! church management platform into a local Postgres database.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod images;
pub mod rate_limiter;
pub mod scheduler;
pub mod sync;

pub use api::{ApiClient, RemoteSource};
pub use auth::AuthManager;
pub use config::SyncConfig;
pub use db::{MemoryStore, PgStore, Store};
pub use error::{StoreError, SyncError, SyncResult};
pub use images::ImageImporter;
pub use rate_limiter::RateLimiter;
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use sync::Synchronizer;
