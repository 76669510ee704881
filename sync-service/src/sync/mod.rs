//! Sync orchestrator.
//!
//! A run refreshes the calendar and service catalogues, then walks every
//! selected calendar's occurrences in the configured window, inserting new
//! keys, updating rows whose remote timestamp advanced and skipping the
//! rest. Runs are exclusive per process and each one leaves exactly one
//! terminal `sync_history` row.
//!
//! The first unrecoverable error aborts the run. Rows written before it
//! stay written; image failures are never fatal.

pub mod mapping;

use chrono::Utc;
use shared::{
    Calendar, EventRecord, Service, ServiceGroup, SyncHistory, SyncRequest, SyncStats,
    SyncStatus, SyncSummary,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::{RemoteAppointmentItem, RemoteEvent, RemoteSource, SyncWindow};
use crate::config::{SyncSettings, DEFAULT_INSTALLATION_ID};
use crate::db::{CalendarUpsert, Store};
use crate::error::{SyncError, SyncResult};
use crate::images::ImageImporter;
use mapping::{OccurrenceKey, RemoteTimestamps, UpsertAction};

/// A finished attempt and the history row it wrote, if it got that far
struct RunOutcome {
    recorded: Option<(Uuid, SyncStats)>,
    result: SyncResult<SyncSummary>,
}

impl RunOutcome {
    fn unrecorded(error: SyncError) -> Self {
        Self {
            recorded: None,
            result: Err(error),
        }
    }
}

pub struct Synchronizer {
    remote: Arc<dyn RemoteSource>,
    store: Arc<dyn Store>,
    images: Option<Arc<ImageImporter>>,
    settings: SyncSettings,
    installation_id: String,
    run_lock: Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        store: Arc<dyn Store>,
        images: Option<Arc<ImageImporter>>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            remote,
            store,
            images,
            settings,
            installation_id: DEFAULT_INSTALLATION_ID.to_string(),
            run_lock: Mutex::new(()),
        }
    }

    /// Name the installation in run logs
    pub fn with_installation_id(mut self, installation_id: impl Into<String>) -> Self {
        self.installation_id = installation_id.into();
        self
    }

    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Run a sync and record it in the history table.
    ///
    /// Returns `AlreadyRunning` without touching the history when another
    /// run holds the lock. Any other failure is recorded on the run's
    /// history row before being returned.
    pub async fn run(&self, request: SyncRequest) -> SyncResult<SyncSummary> {
        self.run_recorded(request).await.result
    }

    /// Like `run`, but folds every failure into the summary.
    ///
    /// A failed summary carries this run's history id and stats, or neither
    /// when the run never got as far as writing its history row.
    pub async fn trigger(&self, request: SyncRequest) -> SyncSummary {
        let outcome = self.run_recorded(request).await;
        match outcome.result {
            Ok(summary) => summary,
            Err(e) => match outcome.recorded {
                Some((history_id, stats)) => {
                    SyncSummary::failed(e.user_message(), stats, Some(history_id))
                }
                None => SyncSummary::failed(e.user_message(), SyncStats::default(), None),
            },
        }
    }

    async fn run_recorded(&self, request: SyncRequest) -> RunOutcome {
        let Ok(_guard) = self.run_lock.try_lock() else {
            tracing::info!("Sync requested while another run is active");
            return RunOutcome::unrecorded(SyncError::AlreadyRunning);
        };

        let started = Instant::now();
        let mut history = match self.store.start_sync(request.sync_type, Utc::now()).await {
            Ok(history) => history,
            Err(e) => {
                tracing::error!("Could not record sync run start: {}", e);
                return RunOutcome::unrecorded(e.into());
            }
        };

        tracing::info!(
            installation = %self.installation_id,
            history_id = %history.id,
            sync_type = request.sync_type.as_str(),
            force_full = request.force_full,
            "Sync run started"
        );

        let mut stats = SyncStats::default();
        let result = self.execute(&request, &mut stats).await;

        history.stats = stats;
        history.completed_at = Some(Utc::now());
        history.duration_ms = Some(started.elapsed().as_millis() as i64);
        match &result {
            Ok(()) => {
                history.status = SyncStatus::Success;
                tracing::info!(
                    history_id = %history.id,
                    calendars = stats.calendars_processed,
                    found = stats.events_found,
                    inserted = stats.events_inserted,
                    updated = stats.events_updated,
                    skipped = stats.events_skipped,
                    services = stats.services_imported,
                    "Sync run finished"
                );
            }
            Err(e) => {
                history.status = SyncStatus::Error;
                history.error_message = Some(e.user_message());
                tracing::error!(history_id = %history.id, "Sync run failed: {}", e);
            }
        }

        let result = match self.store.finish_sync(&history).await {
            Ok(()) => {
                self.prune_history().await;
                result.map(|()| SyncSummary::succeeded(stats, history.id))
            }
            Err(e) => Err(e.into()),
        };

        RunOutcome {
            recorded: Some((history.id, stats)),
            result,
        }
    }

    async fn execute(&self, request: &SyncRequest, stats: &mut SyncStats) -> SyncResult<()> {
        if self.settings.refresh_calendars {
            self.sync_calendars().await?;
            self.sync_services().await?;
        }

        let calendar_ids = self.calendar_ids().await?;
        if calendar_ids.is_empty() {
            tracing::info!("No calendars selected, nothing to sync");
            return Ok(());
        }

        let window = SyncWindow::around(
            Utc::now().date_naive(),
            self.settings.days_past,
            self.settings.days_future,
        );
        tracing::debug!(
            from = %window.from,
            to = %window.to,
            calendars = calendar_ids.len(),
            "Syncing events"
        );

        let service_names: HashMap<i64, String> = self
            .store
            .list_services()
            .await?
            .into_iter()
            .map(|s| (s.remote_id, s.name))
            .collect();

        let events = mapping::index_events(self.remote.events(&window).await?);

        for calendar_id in calendar_ids {
            let items = self.remote.appointments(calendar_id, &window).await?;
            stats.calendars_processed += 1;
            tracing::debug!(calendar_id, occurrences = items.len(), "Fetched appointments");

            for item in &items {
                stats.events_found += 1;
                let key: OccurrenceKey = (item.base.id, item.calculated.start_date);
                self.upsert_occurrence(
                    item,
                    events.get(&key),
                    request.force_full,
                    &service_names,
                    stats,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Configured calendars win; otherwise whatever is selected in the store
    async fn calendar_ids(&self) -> SyncResult<Vec<i64>> {
        if !self.settings.selected_calendar_ids.is_empty() {
            return Ok(self.settings.selected_calendar_ids.clone());
        }
        Ok(self.store.selected_calendar_ids().await?)
    }

    async fn upsert_occurrence(
        &self,
        item: &RemoteAppointmentItem,
        event: Option<&RemoteEvent>,
        force_full: bool,
        service_names: &HashMap<i64, String>,
        stats: &mut SyncStats,
    ) -> SyncResult<()> {
        let existing = self
            .store
            .find_event(item.base.id, item.calculated.start_date)
            .await?;
        let remote = RemoteTimestamps::of(item, event);

        let action = mapping::decide(existing.as_ref(), remote, force_full);
        if action == UpsertAction::Skip {
            stats.events_skipped += 1;
            return Ok(());
        }

        let now = Utc::now();
        let mut record = mapping::build_event_record(item, event, existing.as_ref(), now);
        record.image_asset_id = self.import_image(record.image_url.as_deref()).await;

        if action == UpsertAction::Insert {
            self.store.insert_event(&record).await?;
            stats.events_inserted += 1;
        } else {
            self.store.update_event(&record).await?;
            stats.events_updated += 1;
        }

        let services = mapping::build_event_services(
            event,
            record.id,
            &self.settings.selected_service_ids,
            service_names,
            now,
        );
        self.store.replace_event_services(record.id, &services).await?;
        stats.services_imported += services.len() as u32;

        log_write(action, &record);
        Ok(())
    }

    /// Local asset for `url`, or `None` when there is no image or the import fails
    async fn import_image(&self, url: Option<&str>) -> Option<Uuid> {
        let (Some(url), Some(images)) = (url, self.images.as_ref()) else {
            return None;
        };

        match images.import(url).await {
            Ok(asset) => Some(asset.id),
            Err(e) => {
                tracing::warn!(url, "Keeping external image URL: {}", e);
                None
            }
        }
    }

    /// Refresh the local calendar list from the remote platform.
    ///
    /// Calendars are never deleted here and keep their selection flag.
    pub async fn sync_calendars(&self) -> SyncResult<Vec<Calendar>> {
        let remote = self.remote.calendars().await?;
        let mut calendars = Vec::with_capacity(remote.len());

        for calendar in remote {
            let image_url = calendar
                .image
                .as_ref()
                .and_then(|i| i.url())
                .map(str::to_string);
            let image_asset_id = self.import_image(image_url.as_deref()).await;

            let stored = self
                .store
                .upsert_calendar(&CalendarUpsert {
                    remote_id: calendar.id,
                    name: calendar.name,
                    name_translated: calendar.name_translated,
                    color: calendar.color,
                    image_asset_id,
                    image_url,
                })
                .await?;
            calendars.push(stored);
        }

        tracing::info!("Refreshed {} calendars", calendars.len());
        Ok(calendars)
    }

    /// Refresh the service and service group catalogues. Returns the number
    /// of services written.
    pub async fn sync_services(&self) -> SyncResult<usize> {
        let now = Utc::now();

        for group in self.remote.service_groups().await? {
            self.store
                .upsert_service_group(&ServiceGroup {
                    remote_id: group.id,
                    name: group.name,
                    sort_key: group.sort_key,
                    updated_at: now,
                })
                .await?;
        }

        let services = self.remote.services().await?;
        let count = services.len();
        let selected = &self.settings.selected_service_ids;
        for service in services {
            self.store
                .upsert_service(&Service {
                    remote_id: service.id,
                    name: service.name,
                    service_group_id: service.service_group_id,
                    is_selected: selected.is_empty() || selected.contains(&service.id),
                    sort_key: service.sort_key,
                    updated_at: now,
                })
                .await?;
        }

        tracing::info!("Refreshed {} services", count);
        Ok(count)
    }

    /// Most recent run, if any
    pub async fn last_run(&self) -> SyncResult<Option<SyncHistory>> {
        Ok(self.store.latest_sync().await?)
    }

    async fn prune_history(&self) {
        match self
            .store
            .prune_sync_history(self.settings.history_retention)
            .await
        {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!("Pruned {} old sync history rows", pruned),
            Err(e) => tracing::warn!("Failed to prune sync history: {}", e),
        }
    }
}

fn log_write(action: UpsertAction, record: &EventRecord) {
    tracing::debug!(
        appointment_id = record.appointment_id,
        start = %record.start_at,
        ?action,
        modified = ?record.modified_at(),
        "Event written"
    );
}
