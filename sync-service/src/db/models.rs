// Database models for Diesel
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::{
    Address, Asset, Calendar, EventRecord, EventService, Service, ServiceGroup, SyncHistory,
    SyncStats, SyncStatus, SyncType,
};
use uuid::Uuid;

use crate::db::schema::{
    assets, calendars, event_services, events, service_groups, services, sync_history,
};
use crate::error::StoreError;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = calendars)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CalendarRow {
    pub id: Uuid,
    pub remote_id: i64,
    pub name: String,
    pub name_translated: Option<String>,
    pub color: Option<String>,
    pub is_selected: bool,
    pub image_asset_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<CalendarRow> for Calendar {
    fn from(row: CalendarRow) -> Self {
        Calendar {
            id: row.id,
            remote_id: row.remote_id,
            name: row.name,
            name_translated: row.name_translated,
            color: row.color,
            is_selected: row.is_selected,
            image_asset_id: row.image_asset_id,
            image_url: row.image_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Insertable calendar; new calendars start unselected
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = calendars)]
pub struct NewCalendar {
    pub id: Uuid,
    pub remote_id: i64,
    pub name: String,
    pub name_translated: Option<String>,
    pub color: Option<String>,
    pub is_selected: bool,
    pub image_asset_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Database representation of events.
/// Tags and the raw payload are JSON stored as TEXT.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct EventRow {
    pub id: Uuid,
    pub event_id: Option<i64>,
    pub appointment_id: i64,
    pub calendar_id: i64,
    pub title: String,
    pub series_description: Option<String>,
    pub occurrence_description: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_all_day: bool,
    pub address_name: Option<String>,
    pub address_street: Option<String>,
    pub address_zip: Option<String>,
    pub address_city: Option<String>,
    pub address_latitude: Option<String>,
    pub address_longitude: Option<String>,
    pub tags: String,
    pub status: Option<String>,
    pub image_asset_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub series_modified_at: Option<DateTime<Utc>>,
    pub occurrence_modified_at: Option<DateTime<Utc>>,
    pub raw_payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(EventRecord {
            id: row.id,
            event_id: row.event_id,
            appointment_id: row.appointment_id,
            calendar_id: row.calendar_id,
            title: row.title,
            series_description: row.series_description,
            occurrence_description: row.occurrence_description,
            start_at: row.start_at,
            end_at: row.end_at,
            is_all_day: row.is_all_day,
            address: Address {
                name: row.address_name,
                street: row.address_street,
                zip: row.address_zip,
                city: row.address_city,
                latitude: row.address_latitude,
                longitude: row.address_longitude,
            },
            tags: serde_json::from_str(&row.tags)?,
            status: row.status,
            image_asset_id: row.image_asset_id,
            image_url: row.image_url,
            series_modified_at: row.series_modified_at,
            occurrence_modified_at: row.occurrence_modified_at,
            raw_payload: serde_json::from_str(&row.raw_payload)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Insertable struct for new events
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = events)]
pub struct NewEvent {
    pub id: Uuid,
    pub event_id: Option<i64>,
    pub appointment_id: i64,
    pub calendar_id: i64,
    pub title: String,
    pub series_description: Option<String>,
    pub occurrence_description: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_all_day: bool,
    pub address_name: Option<String>,
    pub address_street: Option<String>,
    pub address_zip: Option<String>,
    pub address_city: Option<String>,
    pub address_latitude: Option<String>,
    pub address_longitude: Option<String>,
    pub tags: String,
    pub status: Option<String>,
    pub image_asset_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub series_modified_at: Option<DateTime<Utc>>,
    pub occurrence_modified_at: Option<DateTime<Utc>>,
    pub raw_payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<&EventRecord> for NewEvent {
    type Error = StoreError;

    fn try_from(event: &EventRecord) -> Result<Self, Self::Error> {
        let changes = EventChanges::try_from(event)?;
        Ok(NewEvent {
            id: event.id,
            event_id: changes.event_id,
            appointment_id: event.appointment_id,
            calendar_id: changes.calendar_id,
            title: changes.title,
            series_description: changes.series_description,
            occurrence_description: changes.occurrence_description,
            start_at: event.start_at,
            end_at: changes.end_at,
            is_all_day: changes.is_all_day,
            address_name: changes.address_name,
            address_street: changes.address_street,
            address_zip: changes.address_zip,
            address_city: changes.address_city,
            address_latitude: changes.address_latitude,
            address_longitude: changes.address_longitude,
            tags: changes.tags,
            status: changes.status,
            image_asset_id: changes.image_asset_id,
            image_url: changes.image_url,
            series_modified_at: changes.series_modified_at,
            occurrence_modified_at: changes.occurrence_modified_at,
            raw_payload: changes.raw_payload,
            created_at: event.created_at,
            updated_at: changes.updated_at,
        })
    }
}

/// Columns rewritten when a newer remote version arrives.
/// Identity columns and `created_at` never change.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = events)]
#[diesel(treat_none_as_null = true)]
pub struct EventChanges {
    pub event_id: Option<i64>,
    pub calendar_id: i64,
    pub title: String,
    pub series_description: Option<String>,
    pub occurrence_description: Option<String>,
    pub end_at: DateTime<Utc>,
    pub is_all_day: bool,
    pub address_name: Option<String>,
    pub address_street: Option<String>,
    pub address_zip: Option<String>,
    pub address_city: Option<String>,
    pub address_latitude: Option<String>,
    pub address_longitude: Option<String>,
    pub tags: String,
    pub status: Option<String>,
    pub image_asset_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub series_modified_at: Option<DateTime<Utc>>,
    pub occurrence_modified_at: Option<DateTime<Utc>>,
    pub raw_payload: String,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<&EventRecord> for EventChanges {
    type Error = StoreError;

    fn try_from(event: &EventRecord) -> Result<Self, Self::Error> {
        let address = event.address.clone();
        Ok(EventChanges {
            event_id: event.event_id,
            calendar_id: event.calendar_id,
            title: event.title.clone(),
            series_description: event.series_description.clone(),
            occurrence_description: event.occurrence_description.clone(),
            end_at: event.end_at,
            is_all_day: event.is_all_day,
            address_name: address.name,
            address_street: address.street,
            address_zip: address.zip,
            address_city: address.city,
            address_latitude: address.latitude,
            address_longitude: address.longitude,
            tags: serde_json::to_string(&event.tags)?,
            status: event.status.clone(),
            image_asset_id: event.image_asset_id,
            image_url: event.image_url.clone(),
            series_modified_at: event.series_modified_at,
            occurrence_modified_at: event.occurrence_modified_at,
            raw_payload: serde_json::to_string(&event.raw_payload)?,
            updated_at: event.updated_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = event_services)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct EventServiceRow {
    pub id: Uuid,
    pub event_id: Uuid,
    pub service_id: i64,
    pub service_name: String,
    pub person_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<EventServiceRow> for EventService {
    fn from(row: EventServiceRow) -> Self {
        EventService {
            id: row.id,
            event_id: row.event_id,
            service_id: row.service_id,
            service_name: row.service_name,
            person_name: row.person_name,
            created_at: row.created_at,
        }
    }
}

impl From<&EventService> for EventServiceRow {
    fn from(service: &EventService) -> Self {
        EventServiceRow {
            id: service.id,
            event_id: service.event_id,
            service_id: service.service_id,
            service_name: service.service_name.clone(),
            person_name: service.person_name.clone(),
            created_at: service.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = services)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ServiceRow {
    pub remote_id: i64,
    pub name: String,
    pub service_group_id: Option<i64>,
    pub is_selected: bool,
    pub sort_key: i32,
    pub updated_at: DateTime<Utc>,
}

impl From<ServiceRow> for Service {
    fn from(row: ServiceRow) -> Self {
        Service {
            remote_id: row.remote_id,
            name: row.name,
            service_group_id: row.service_group_id,
            is_selected: row.is_selected,
            sort_key: row.sort_key,
            updated_at: row.updated_at,
        }
    }
}

impl From<&Service> for ServiceRow {
    fn from(service: &Service) -> Self {
        ServiceRow {
            remote_id: service.remote_id,
            name: service.name.clone(),
            service_group_id: service.service_group_id,
            is_selected: service.is_selected,
            sort_key: service.sort_key,
            updated_at: service.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = service_groups)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ServiceGroupRow {
    pub remote_id: i64,
    pub name: String,
    pub sort_key: i32,
    pub updated_at: DateTime<Utc>,
}

impl From<ServiceGroupRow> for ServiceGroup {
    fn from(row: ServiceGroupRow) -> Self {
        ServiceGroup {
            remote_id: row.remote_id,
            name: row.name,
            sort_key: row.sort_key,
            updated_at: row.updated_at,
        }
    }
}

impl From<&ServiceGroup> for ServiceGroupRow {
    fn from(group: &ServiceGroup) -> Self {
        ServiceGroupRow {
            remote_id: group.remote_id,
            name: group.name.clone(),
            sort_key: group.sort_key,
            updated_at: group.updated_at,
        }
    }
}

/// Database representation of sync_history.
/// Type and status are stored as their lowercase names.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = sync_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SyncHistoryRow {
    pub id: Uuid,
    pub sync_type: String,
    pub status: String,
    pub calendars_processed: i32,
    pub events_found: i32,
    pub events_inserted: i32,
    pub events_updated: i32,
    pub events_skipped: i32,
    pub services_imported: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

impl From<SyncHistoryRow> for SyncHistory {
    fn from(row: SyncHistoryRow) -> Self {
        SyncHistory {
            id: row.id,
            sync_type: SyncType::parse(&row.sync_type).unwrap_or(SyncType::Manual),
            // Unknown statuses come from a newer writer; treat them as failed runs
            status: SyncStatus::parse(&row.status).unwrap_or(SyncStatus::Error),
            stats: SyncStats {
                calendars_processed: to_count(row.calendars_processed),
                events_found: to_count(row.events_found),
                events_inserted: to_count(row.events_inserted),
                events_updated: to_count(row.events_updated),
                events_skipped: to_count(row.events_skipped),
                services_imported: to_count(row.services_imported),
            },
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            error_message: row.error_message,
        }
    }
}

impl From<&SyncHistory> for SyncHistoryRow {
    fn from(history: &SyncHistory) -> Self {
        let changes = SyncHistoryChanges::from(history);
        SyncHistoryRow {
            id: history.id,
            sync_type: history.sync_type.as_str().to_string(),
            status: changes.status,
            calendars_processed: changes.calendars_processed,
            events_found: changes.events_found,
            events_inserted: changes.events_inserted,
            events_updated: changes.events_updated,
            events_skipped: changes.events_skipped,
            services_imported: changes.services_imported,
            started_at: history.started_at,
            completed_at: changes.completed_at,
            duration_ms: changes.duration_ms,
            error_message: changes.error_message,
        }
    }
}

/// Columns written when a run is finalized
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = sync_history)]
#[diesel(treat_none_as_null = true)]
pub struct SyncHistoryChanges {
    pub status: String,
    pub calendars_processed: i32,
    pub events_found: i32,
    pub events_inserted: i32,
    pub events_updated: i32,
    pub events_skipped: i32,
    pub services_imported: i32,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

impl From<&SyncHistory> for SyncHistoryChanges {
    fn from(history: &SyncHistory) -> Self {
        SyncHistoryChanges {
            status: history.status.as_str().to_string(),
            calendars_processed: to_column(history.stats.calendars_processed),
            events_found: to_column(history.stats.events_found),
            events_inserted: to_column(history.stats.events_inserted),
            events_updated: to_column(history.stats.events_updated),
            events_skipped: to_column(history.stats.events_skipped),
            services_imported: to_column(history.stats.services_imported),
            completed_at: history.completed_at,
            duration_ms: history.duration_ms,
            error_message: history.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = assets)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AssetRow {
    pub id: Uuid,
    pub file_name: String,
    pub local_path: String,
    pub source_url: String,
    pub content_type: String,
    pub byte_size: i64,
    pub created_at: DateTime<Utc>,
}

impl From<AssetRow> for Asset {
    fn from(row: AssetRow) -> Self {
        Asset {
            id: row.id,
            file_name: row.file_name,
            local_path: row.local_path,
            source_url: row.source_url,
            content_type: row.content_type,
            byte_size: row.byte_size,
            created_at: row.created_at,
        }
    }
}

impl From<&Asset> for AssetRow {
    fn from(asset: &Asset) -> Self {
        AssetRow {
            id: asset.id,
            file_name: asset.file_name.clone(),
            local_path: asset.local_path.clone(),
            source_url: asset.source_url.clone(),
            content_type: asset.content_type.clone(),
            byte_size: asset.byte_size,
            created_at: asset.created_at,
        }
    }
}

fn to_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_column(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
