use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    Asset, Calendar, EventRecord, EventService, Service, ServiceGroup, SyncHistory, SyncStats,
    SyncStatus, SyncType,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{CalendarUpsert, Store};
use crate::error::{StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    calendars: HashMap<i64, Calendar>,
    events: HashMap<Uuid, EventRecord>,
    event_keys: HashMap<(i64, DateTime<Utc>), Uuid>,
    event_services: HashMap<Uuid, Vec<EventService>>,
    services: HashMap<i64, Service>,
    service_groups: HashMap<i64, ServiceGroup>,
    history: Vec<SyncHistory>,
    assets: Vec<Asset>,
    event_writes: usize,
    history_offline: bool,
}

/// In-process store with the same semantics as `PgStore`.
///
/// Used by tests and by `churchsync sync --dry-run`.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of event inserts and updates performed so far
    pub fn event_writes(&self) -> usize {
        self.lock().event_writes
    }

    /// Make `start_sync` fail, as a database that lost the history table would
    #[cfg(test)]
    pub(crate) fn take_history_offline(&self) {
        self.lock().history_offline = true;
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_calendar(&self, input: &CalendarUpsert) -> StoreResult<Calendar> {
        let now = Utc::now();
        let mut tables = self.lock();
        let calendar = tables
            .calendars
            .entry(input.remote_id)
            .and_modify(|existing| {
                existing.name = input.name.clone();
                existing.name_translated = input.name_translated.clone();
                existing.color = input.color.clone();
                existing.image_asset_id = input.image_asset_id;
                existing.image_url = input.image_url.clone();
                existing.updated_at = now;
            })
            .or_insert_with(|| Calendar {
                id: Uuid::new_v4(),
                remote_id: input.remote_id,
                name: input.name.clone(),
                name_translated: input.name_translated.clone(),
                color: input.color.clone(),
                is_selected: false,
                image_asset_id: input.image_asset_id,
                image_url: input.image_url.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(calendar.clone())
    }

    async fn list_calendars(&self) -> StoreResult<Vec<Calendar>> {
        let mut calendars: Vec<Calendar> = self.lock().calendars.values().cloned().collect();
        calendars.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(calendars)
    }

    async fn selected_calendar_ids(&self) -> StoreResult<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .lock()
            .calendars
            .values()
            .filter(|c| c.is_selected)
            .map(|c| c.remote_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn set_calendar_selected(&self, remote_id: i64, selected: bool) -> StoreResult<()> {
        let mut tables = self.lock();
        let calendar = tables
            .calendars
            .get_mut(&remote_id)
            .ok_or_else(|| StoreError::NotFound(format!("Calendar {}", remote_id)))?;
        calendar.is_selected = selected;
        calendar.updated_at = Utc::now();
        Ok(())
    }

    async fn find_event(
        &self,
        appointment_id: i64,
        start_at: DateTime<Utc>,
    ) -> StoreResult<Option<EventRecord>> {
        let tables = self.lock();
        Ok(tables
            .event_keys
            .get(&(appointment_id, start_at))
            .and_then(|id| tables.events.get(id))
            .cloned())
    }

    async fn insert_event(&self, event: &EventRecord) -> StoreResult<()> {
        let mut tables = self.lock();
        let key = (event.appointment_id, event.start_at);
        if tables.event_keys.contains_key(&key) {
            // Mirrors the unique index on (appointment_id, start_at)
            return Err(StoreError::Database(
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    Box::new(format!(
                        "duplicate event key ({}, {})",
                        event.appointment_id, event.start_at
                    )),
                ),
            ));
        }
        tables.event_keys.insert(key, event.id);
        tables.events.insert(event.id, event.clone());
        tables.event_writes += 1;
        Ok(())
    }

    async fn update_event(&self, event: &EventRecord) -> StoreResult<()> {
        let mut tables = self.lock();
        let stored = tables
            .events
            .get_mut(&event.id)
            .ok_or_else(|| StoreError::NotFound(format!("Event {}", event.id)))?;
        let created_at = stored.created_at;
        *stored = EventRecord {
            // Identity columns are not rewritten
            appointment_id: stored.appointment_id,
            start_at: stored.start_at,
            created_at,
            ..event.clone()
        };
        tables.event_writes += 1;
        Ok(())
    }

    async fn list_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EventRecord>> {
        let mut events: Vec<EventRecord> = self
            .lock()
            .events
            .values()
            .filter(|e| e.start_at >= from && e.start_at < to)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.start_at);
        Ok(events)
    }

    async fn count_events(&self) -> StoreResult<i64> {
        Ok(self.lock().events.len() as i64)
    }

    async fn replace_event_services(
        &self,
        event_id: Uuid,
        services: &[EventService],
    ) -> StoreResult<()> {
        self.lock()
            .event_services
            .insert(event_id, services.to_vec());
        Ok(())
    }

    async fn list_event_services(&self, event_id: Uuid) -> StoreResult<Vec<EventService>> {
        let mut services = self
            .lock()
            .event_services
            .get(&event_id)
            .cloned()
            .unwrap_or_default();
        services.sort_by_key(|s| (s.service_id, s.created_at));
        Ok(services)
    }

    async fn upsert_service_group(&self, group: &ServiceGroup) -> StoreResult<()> {
        self.lock()
            .service_groups
            .insert(group.remote_id, group.clone());
        Ok(())
    }

    async fn upsert_service(&self, service: &Service) -> StoreResult<()> {
        let mut tables = self.lock();
        let is_selected = tables
            .services
            .get(&service.remote_id)
            .map(|existing| existing.is_selected)
            .unwrap_or(service.is_selected);
        tables.services.insert(
            service.remote_id,
            Service {
                is_selected,
                ..service.clone()
            },
        );
        Ok(())
    }

    async fn list_services(&self) -> StoreResult<Vec<Service>> {
        let mut services: Vec<Service> = self.lock().services.values().cloned().collect();
        services.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then_with(|| a.name.cmp(&b.name)));
        Ok(services)
    }

    async fn list_service_groups(&self) -> StoreResult<Vec<ServiceGroup>> {
        let mut groups: Vec<ServiceGroup> = self.lock().service_groups.values().cloned().collect();
        groups.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then_with(|| a.name.cmp(&b.name)));
        Ok(groups)
    }

    async fn start_sync(
        &self,
        sync_type: SyncType,
        started_at: DateTime<Utc>,
    ) -> StoreResult<SyncHistory> {
        let mut tables = self.lock();
        if tables.history_offline {
            return Err(StoreError::Pool("sync_history is unavailable".to_string()));
        }

        let history = SyncHistory {
            id: Uuid::new_v4(),
            sync_type,
            status: SyncStatus::Pending,
            stats: SyncStats::default(),
            started_at,
            completed_at: None,
            duration_ms: None,
            error_message: None,
        };
        tables.history.push(history.clone());
        Ok(history)
    }

    async fn finish_sync(&self, history: &SyncHistory) -> StoreResult<()> {
        super::ensure_terminal(history)?;
        let mut tables = self.lock();
        let stored = tables
            .history
            .iter_mut()
            .find(|h| h.id == history.id)
            .ok_or_else(|| StoreError::NotFound(format!("Sync history {}", history.id)))?;
        *stored = history.clone();
        Ok(())
    }

    async fn latest_sync(&self) -> StoreResult<Option<SyncHistory>> {
        Ok(self
            .lock()
            .history
            .iter()
            .max_by_key(|h| h.started_at)
            .cloned())
    }

    async fn list_sync_history(&self, limit: i64) -> StoreResult<Vec<SyncHistory>> {
        let mut history = self.lock().history.clone();
        history.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        history.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(history)
    }

    async fn prune_sync_history(&self, keep: i64) -> StoreResult<usize> {
        if keep <= 0 {
            return Ok(0);
        }
        let mut tables = self.lock();
        tables
            .history
            .sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let keep = usize::try_from(keep).unwrap_or(usize::MAX);
        let before = tables.history.len();
        tables.history.truncate(keep);
        Ok(before - tables.history.len())
    }

    async fn find_asset_by_source(&self, source_url: &str) -> StoreResult<Option<Asset>> {
        Ok(self
            .lock()
            .assets
            .iter()
            .find(|a| a.source_url == source_url)
            .cloned())
    }

    async fn asset_file_name_taken(&self, file_name: &str) -> StoreResult<bool> {
        Ok(self.lock().assets.iter().any(|a| a.file_name == file_name))
    }

    async fn insert_asset(&self, asset: &Asset) -> StoreResult<()> {
        self.lock().assets.push(asset.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calendar(remote_id: i64, name: &str) -> CalendarUpsert {
        CalendarUpsert {
            remote_id,
            name: name.to_string(),
            name_translated: None,
            color: Some("#336699".to_string()),
            image_asset_id: None,
            image_url: None,
        }
    }

    fn event(appointment_id: i64, start: DateTime<Utc>) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4(),
            event_id: None,
            appointment_id,
            calendar_id: 1,
            title: "Youth Night".to_string(),
            series_description: None,
            occurrence_description: None,
            start_at: start,
            end_at: start,
            is_all_day: false,
            address: Default::default(),
            tags: vec![],
            status: None,
            image_asset_id: None,
            image_url: None,
            series_modified_at: None,
            occurrence_modified_at: None,
            raw_payload: serde_json::json!({}),
            created_at: start,
            updated_at: start,
        }
    }

    #[tokio::test]
    async fn test_calendar_upsert_keeps_selection() {
        let store = MemoryStore::new();
        store.upsert_calendar(&calendar(1, "Main")).await.unwrap();
        store.set_calendar_selected(1, true).await.unwrap();

        let refreshed = store.upsert_calendar(&calendar(1, "Main (renamed)")).await.unwrap();
        assert!(refreshed.is_selected);
        assert_eq!(refreshed.name, "Main (renamed)");
        assert_eq!(store.selected_calendar_ids().await.unwrap(), vec![1]);

        assert!(matches!(
            store.set_calendar_selected(99, true).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_event_key_is_unique() {
        let store = MemoryStore::new();
        let start = Utc.with_ymd_and_hms(2024, 6, 2, 10, 0, 0).unwrap();
        store.insert_event(&event(5, start)).await.unwrap();
        assert!(store.insert_event(&event(5, start)).await.is_err());

        // Same appointment, other occurrence
        store
            .insert_event(&event(5, start + chrono::Duration::days(7)))
            .await
            .unwrap();
        assert_eq!(store.count_events().await.unwrap(), 2);
        assert!(store.find_event(5, start).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_history_prune_keeps_newest() {
        let store = MemoryStore::new();
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        for hour in 0..5 {
            store
                .start_sync(SyncType::Scheduled, base + chrono::Duration::hours(hour))
                .await
                .unwrap();
        }

        assert_eq!(store.prune_sync_history(2).await.unwrap(), 3);
        let remaining = store.list_sync_history(10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].started_at, base + chrono::Duration::hours(4));
        assert_eq!(store.prune_sync_history(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_finishes_only_as_terminal() {
        let store = MemoryStore::new();
        let mut history = store
            .start_sync(SyncType::Manual, Utc::now())
            .await
            .unwrap();

        assert!(matches!(
            store.finish_sync(&history).await,
            Err(StoreError::Rejected(_))
        ));

        history.status = SyncStatus::Success;
        store.finish_sync(&history).await.unwrap();
        let latest = store.latest_sync().await.unwrap().unwrap();
        assert_eq!(latest.status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn test_service_upsert_keeps_selection() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut service = Service {
            remote_id: 3,
            name: "Sound".to_string(),
            service_group_id: Some(1),
            is_selected: true,
            sort_key: 1,
            updated_at: now,
        };
        store.upsert_service(&service).await.unwrap();

        service.is_selected = false;
        service.name = "Sound desk".to_string();
        store.upsert_service(&service).await.unwrap();

        let services = store.list_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert!(services[0].is_selected);
        assert_eq!(services[0].name, "Sound desk");
    }
}
