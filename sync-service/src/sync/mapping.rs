//! Pure mapping from remote payloads to local records.

use chrono::{DateTime, Utc};
use shared::{Address, EventRecord, EventService};
use std::collections::HashMap;
use uuid::Uuid;

use crate::api::types::RemoteAddress;
use crate::api::{RemoteAppointmentItem, RemoteEvent};

/// What to do with one remote occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Insert,
    Update,
    Skip,
}

/// Remote last-modified timestamps of one occurrence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteTimestamps {
    /// From the appointment series
    pub series: Option<DateTime<Utc>>,
    /// From the matched event, if any
    pub occurrence: Option<DateTime<Utc>>,
}

impl RemoteTimestamps {
    pub fn of(item: &RemoteAppointmentItem, event: Option<&RemoteEvent>) -> Self {
        Self {
            series: item.base.meta.modified_date,
            occurrence: event.and_then(|e| e.meta.modified_date),
        }
    }

    /// True when either level moved strictly past the stored one.
    /// `None < Some(_)`, so a remote timestamp beats a stored row without one.
    pub fn newer_than(&self, stored: &EventRecord) -> bool {
        self.series > stored.series_modified_at
            || self.occurrence > stored.occurrence_modified_at
    }
}

/// Insert unseen keys; update when forced or either remote timestamp is strictly newer.
pub fn decide(
    stored: Option<&EventRecord>,
    remote: RemoteTimestamps,
    force_full: bool,
) -> UpsertAction {
    match stored {
        None => UpsertAction::Insert,
        Some(_) if force_full => UpsertAction::Update,
        Some(existing) if remote.newer_than(existing) => UpsertAction::Update,
        Some(_) => UpsertAction::Skip,
    }
}

/// Key used to pair appointment occurrences with events
pub type OccurrenceKey = (i64, DateTime<Utc>);

/// Index events by the occurrence they belong to. Events without an
/// appointment link cannot be matched and are dropped.
pub fn index_events(events: Vec<RemoteEvent>) -> HashMap<OccurrenceKey, RemoteEvent> {
    events
        .into_iter()
        .filter_map(|event| {
            event
                .appointment_id
                .map(|appointment_id| ((appointment_id, event.start_date), event))
        })
        .collect()
}

/// Build the local record for an occurrence. `existing` supplies the local
/// id and creation time on updates.
pub fn build_event_record(
    item: &RemoteAppointmentItem,
    event: Option<&RemoteEvent>,
    existing: Option<&EventRecord>,
    now: DateTime<Utc>,
) -> EventRecord {
    let appointment = &item.base;

    EventRecord {
        id: existing.map(|e| e.id).unwrap_or_else(Uuid::new_v4),
        event_id: event.map(|e| e.id),
        appointment_id: appointment.id,
        calendar_id: appointment.calendar.id,
        title: appointment.caption.clone(),
        series_description: appointment.description().map(str::to_string),
        occurrence_description: event
            .and_then(|e| e.description.as_deref())
            .filter(|d| !d.trim().is_empty())
            .map(str::to_string),
        start_at: item.calculated.start_date,
        end_at: item.calculated.end_date,
        is_all_day: appointment.all_day,
        address: appointment
            .address
            .as_ref()
            .map(map_address)
            .unwrap_or_default(),
        tags: appointment.tags.iter().map(|t| t.name.clone()).collect(),
        status: appointment.status.clone(),
        image_asset_id: None,
        image_url: appointment
            .image
            .as_ref()
            .and_then(|i| i.url())
            .map(str::to_string),
        series_modified_at: appointment.meta.modified_date,
        occurrence_modified_at: event.and_then(|e| e.meta.modified_date),
        raw_payload: serde_json::json!({
            "appointment": item.raw,
            "event": event.map(|e| e.raw.clone()).unwrap_or(serde_json::Value::Null),
        }),
        created_at: existing.map(|e| e.created_at).unwrap_or(now),
        updated_at: now,
    }
}

fn map_address(remote: &RemoteAddress) -> Address {
    let clean = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());
    Address {
        name: clean(&remote.meeting_at),
        street: clean(&remote.street),
        zip: clean(&remote.zip),
        city: clean(&remote.city),
        latitude: clean(&remote.latitude),
        longitude: clean(&remote.longitude),
    }
}

/// Service assignments of `event` for the local record `event_id`.
///
/// An empty `selected` list keeps every service. Names come from the
/// catalogue, falling back to `Service {id}`.
pub fn build_event_services(
    event: Option<&RemoteEvent>,
    event_id: Uuid,
    selected: &[i64],
    names: &HashMap<i64, String>,
    now: DateTime<Utc>,
) -> Vec<EventService> {
    let Some(event) = event else {
        return Vec::new();
    };

    event
        .event_services
        .iter()
        .filter(|s| selected.is_empty() || selected.contains(&s.service_id))
        .map(|s| EventService {
            id: Uuid::new_v4(),
            event_id,
            service_id: s.service_id,
            service_name: names
                .get(&s.service_id)
                .cloned()
                .unwrap_or_else(|| format!("Service {}", s.service_id)),
            person_name: s.person_name(),
            created_at: now,
        })
        .collect()
}
