//! Domain types shared between the sync engine and anything that reads the
//! local store.

pub mod api;
pub mod models;

pub use api::{LastSyncStatus, SyncRequest, SyncSummary};
pub use models::{
    latest, Address, Asset, Calendar, EventRecord, EventService, Service, ServiceGroup,
    SyncHistory, SyncStats, SyncStatus, SyncType,
};
