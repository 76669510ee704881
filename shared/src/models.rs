use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What started a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Scheduled,
    Manual,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Scheduled => "scheduled",
            SyncType::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(SyncType::Scheduled),
            "manual" => Some(SyncType::Manual),
            _ => None,
        }
    }
}

/// Status of a sync run. `Success` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SyncStatus::Pending),
            "success" => Some(SyncStatus::Success),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Pending)
    }
}

/// Calendar mirrored from the remote platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: Uuid,
    pub remote_id: i64,
    pub name: String,
    pub name_translated: Option<String>,
    pub color: Option<String>,
    /// Only selected calendars have their events synced
    pub is_selected: bool,
    pub image_asset_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Postal address attached to an appointment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub street: Option<String>,
    pub zip: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

/// One concrete occurrence of a calendar entry.
///
/// `(appointment_id, start_at)` is unique: a recurring series produces one
/// row per occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub event_id: Option<i64>,
    pub appointment_id: i64,
    pub calendar_id: i64,
    pub title: String,
    /// Description shared by every occurrence of the series
    pub series_description: Option<String>,
    /// Description specific to this occurrence
    pub occurrence_description: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_all_day: bool,
    pub address: Address,
    pub tags: Vec<String>,
    pub status: Option<String>,
    pub image_asset_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub series_modified_at: Option<DateTime<Utc>>,
    pub occurrence_modified_at: Option<DateTime<Utc>>,
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// Occurrence text wins over series text when both are present.
    pub fn display_description(&self) -> Option<&str> {
        non_blank(self.occurrence_description.as_deref())
            .or_else(|| non_blank(self.series_description.as_deref()))
    }

    /// The later of the series and occurrence modification timestamps
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        latest(self.series_modified_at, self.occurrence_modified_at)
    }
}

/// Returns the later of two optional timestamps.
pub fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Person assigned to a service for one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventService {
    pub id: Uuid,
    pub event_id: Uuid,
    pub service_id: i64,
    pub service_name: String,
    pub person_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub remote_id: i64,
    pub name: String,
    pub service_group_id: Option<i64>,
    pub is_selected: bool,
    pub sort_key: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub remote_id: i64,
    pub name: String,
    pub sort_key: i32,
    pub updated_at: DateTime<Utc>,
}

/// Counters collected during a sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub calendars_processed: u32,
    pub events_found: u32,
    pub events_inserted: u32,
    pub events_updated: u32,
    pub events_skipped: u32,
    pub services_imported: u32,
}

impl SyncStats {
    pub fn events_written(&self) -> u32 {
        self.events_inserted + self.events_updated
    }
}

/// One row per sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistory {
    pub id: Uuid,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub stats: SyncStats,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

/// Image imported into the local media library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub file_name: String,
    pub local_path: String,
    pub source_url: String,
    pub content_type: String,
    pub byte_size: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(series: Option<&str>, occurrence: Option<&str>) -> EventRecord {
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 10, 0, 0).unwrap();
        EventRecord {
            id: Uuid::new_v4(),
            event_id: None,
            appointment_id: 1,
            calendar_id: 1,
            title: "Service".to_string(),
            series_description: series.map(str::to_string),
            occurrence_description: occurrence.map(str::to_string),
            start_at: start,
            end_at: start,
            is_all_day: false,
            address: Address::default(),
            tags: vec![],
            status: None,
            image_asset_id: None,
            image_url: None,
            series_modified_at: None,
            occurrence_modified_at: None,
            raw_payload: serde_json::Value::Null,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn test_occurrence_description_wins() {
        let e = event(Some("series"), Some("occurrence"));
        assert_eq!(e.display_description(), Some("occurrence"));
    }

    #[test]
    fn test_blank_occurrence_falls_back_to_series() {
        let e = event(Some("series"), Some("   "));
        assert_eq!(e.display_description(), Some("series"));

        let e = event(None, None);
        assert_eq!(e.display_description(), None);
    }

    #[test]
    fn test_latest_timestamp() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(latest(Some(a), Some(b)), Some(b));
        assert_eq!(latest(None, Some(a)), Some(a));
        assert_eq!(latest(None, None), None);
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [SyncStatus::Pending, SyncStatus::Success, SyncStatus::Error] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert!(!SyncStatus::Pending.is_terminal());
        assert!(SyncStatus::Error.is_terminal());
        assert_eq!(SyncType::parse("manual"), Some(SyncType::Manual));
    }

    #[test]
    fn test_events_written() {
        let stats = SyncStats {
            events_inserted: 2,
            events_updated: 3,
            events_skipped: 7,
            ..Default::default()
        };
        assert_eq!(stats.events_written(), 5);
    }
}
