//! Remote API access.

mod client;
pub mod query;
pub mod types;

use async_trait::async_trait;

pub use client::{ApiClient, API_PREFIX, API_TIMEOUT, MAX_REAUTH_RETRIES};
pub use query::QueryParams;
pub use types::{
    RemoteAppointment, RemoteAppointmentItem, RemoteCalendar, RemoteEvent, RemoteEventService,
    RemoteService, RemoteServiceGroup, RemoteUser, SyncWindow,
};

use crate::error::SyncResult;

/// Read-only view of the remote platform used by the orchestrator
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn calendars(&self) -> SyncResult<Vec<RemoteCalendar>>;

    /// Occurrences of one calendar's appointments inside the window
    async fn appointments(
        &self,
        calendar_id: i64,
        window: &SyncWindow,
    ) -> SyncResult<Vec<RemoteAppointmentItem>>;

    /// Events in the window, with their service assignments
    async fn events(&self, window: &SyncWindow) -> SyncResult<Vec<RemoteEvent>>;

    async fn services(&self) -> SyncResult<Vec<RemoteService>>;

    async fn service_groups(&self) -> SyncResult<Vec<RemoteServiceGroup>>;
}
