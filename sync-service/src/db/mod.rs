//! Local store for mirrored calendars, events, services and run history.
//!
//! `Store` is the seam the orchestrator writes through. `PgStore` is the
//! production implementation; `MemoryStore` backs tests and dry runs.

mod memory;
pub mod migrations;
pub mod models;
mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    Asset, Calendar, EventRecord, EventService, Service, ServiceGroup, SyncHistory, SyncType,
};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

pub use memory::MemoryStore;
pub use postgres::{establish_connection, establish_connection_pool, DbPool, PgStore};

/// Remote calendar fields written on every calendar sync.
/// The local selection flag is not part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarUpsert {
    pub remote_id: i64,
    pub name: String,
    pub name_translated: Option<String>,
    pub color: Option<String>,
    pub image_asset_id: Option<Uuid>,
    pub image_url: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Calendars

    /// Insert or refresh a calendar by remote id; existing selection is kept
    async fn upsert_calendar(&self, calendar: &CalendarUpsert) -> StoreResult<Calendar>;
    async fn list_calendars(&self) -> StoreResult<Vec<Calendar>>;
    async fn selected_calendar_ids(&self) -> StoreResult<Vec<i64>>;
    async fn set_calendar_selected(&self, remote_id: i64, selected: bool) -> StoreResult<()>;

    // Events

    /// Lookup by the upsert key
    async fn find_event(
        &self,
        appointment_id: i64,
        start_at: DateTime<Utc>,
    ) -> StoreResult<Option<EventRecord>>;
    async fn insert_event(&self, event: &EventRecord) -> StoreResult<()>;
    /// Rewrite every mutable column of the row with `event.id`
    async fn update_event(&self, event: &EventRecord) -> StoreResult<()>;
    async fn list_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EventRecord>>;
    async fn count_events(&self) -> StoreResult<i64>;

    // Event services

    /// Drop the event's assignments and write `services` in their place
    async fn replace_event_services(
        &self,
        event_id: Uuid,
        services: &[EventService],
    ) -> StoreResult<()>;
    async fn list_event_services(&self, event_id: Uuid) -> StoreResult<Vec<EventService>>;

    // Service catalogue

    async fn upsert_service_group(&self, group: &ServiceGroup) -> StoreResult<()>;
    /// Insert or refresh a service; existing selection is kept
    async fn upsert_service(&self, service: &Service) -> StoreResult<()>;
    async fn list_services(&self) -> StoreResult<Vec<Service>>;
    async fn list_service_groups(&self) -> StoreResult<Vec<ServiceGroup>>;

    // Sync history

    /// Create the pending row for a new run
    async fn start_sync(
        &self,
        sync_type: SyncType,
        started_at: DateTime<Utc>,
    ) -> StoreResult<SyncHistory>;
    /// Write the terminal state of a run
    async fn finish_sync(&self, history: &SyncHistory) -> StoreResult<()>;
    async fn latest_sync(&self) -> StoreResult<Option<SyncHistory>>;
    async fn list_sync_history(&self, limit: i64) -> StoreResult<Vec<SyncHistory>>;
    /// Delete all but the newest `keep` rows; returns how many went
    async fn prune_sync_history(&self, keep: i64) -> StoreResult<usize>;

    // Assets

    async fn find_asset_by_source(&self, source_url: &str) -> StoreResult<Option<Asset>>;
    async fn asset_file_name_taken(&self, file_name: &str) -> StoreResult<bool>;
    async fn insert_asset(&self, asset: &Asset) -> StoreResult<()>;
}

/// A run can only be finished with a terminal status
fn ensure_terminal(history: &SyncHistory) -> StoreResult<()> {
    if history.status.is_terminal() {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!(
            "sync history {} cannot finish as {}",
            history.id,
            history.status.as_str()
        )))
    }
}
