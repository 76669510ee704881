//! Remote payload types.
//!
//! Only fields the sync engine consumes are modelled; every item also keeps
//! its raw JSON so later releases can extract more without a resync.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer};

/// Date range sent to the listing endpoints, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl SyncWindow {
    pub fn around(today: NaiveDate, days_past: u32, days_future: u32) -> Self {
        Self {
            from: today - chrono::Duration::days(i64::from(days_past)),
            to: today + chrono::Duration::days(i64::from(days_future)),
        }
    }

    pub fn from_param(&self) -> String {
        self.from.format("%Y-%m-%d").to_string()
    }

    pub fn to_param(&self) -> String {
        self.to.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdRef {
    pub id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMeta {
    #[serde(default, deserialize_with = "optional_datetime")]
    pub modified_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteImage {
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl RemoteImage {
    pub fn url(&self) -> Option<&str> {
        self.file_url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCalendar {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub name_translated: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub image: Option<RemoteImage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAddress {
    #[serde(default)]
    pub meeting_at: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub latitude: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub longitude: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTag {
    pub name: String,
}

/// Series-level data of an appointment
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAppointment {
    pub id: i64,
    pub caption: String,
    #[serde(default)]
    pub information: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub all_day: bool,
    pub calendar: IdRef,
    #[serde(default)]
    pub address: Option<RemoteAddress>,
    #[serde(default)]
    pub image: Option<RemoteImage>,
    #[serde(default)]
    pub tags: Vec<RemoteTag>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub meta: RemoteMeta,
}

impl RemoteAppointment {
    /// Series-level description; `information` is the long text, `note` the short one
    pub fn description(&self) -> Option<&str> {
        self.information
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.note.as_deref().filter(|s| !s.trim().is_empty()))
    }
}

/// Start and end of one concrete occurrence
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatedDates {
    #[serde(deserialize_with = "flexible_datetime")]
    pub start_date: DateTime<Utc>,
    #[serde(deserialize_with = "flexible_datetime")]
    pub end_date: DateTime<Utc>,
}

/// One occurrence as returned by the appointment listing
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAppointmentItem {
    pub base: RemoteAppointment,
    pub calculated: CalculatedDates,
    #[serde(skip)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePerson {
    #[serde(default)]
    pub title: Option<String>,
}

/// The account behind the current credentials, from `/whoami`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl RemoteUser {
    pub fn display_name(&self) -> Option<String> {
        let name = [&self.first_name, &self.last_name]
            .into_iter()
            .flatten()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (!name.is_empty()).then_some(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEventService {
    pub service_id: i64,
    /// Free-text name, used when no person is linked
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub person: Option<RemotePerson>,
}

impl RemoteEventService {
    pub fn person_name(&self) -> Option<String> {
        self.person
            .as_ref()
            .and_then(|p| p.title.clone())
            .or_else(|| self.name.clone())
            .filter(|n| !n.trim().is_empty())
    }
}

/// Occurrence-level record carrying service assignments
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(deserialize_with = "flexible_datetime")]
    pub start_date: DateTime<Utc>,
    #[serde(deserialize_with = "flexible_datetime")]
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub appointment_id: Option<i64>,
    #[serde(default)]
    pub event_services: Vec<RemoteEventService>,
    #[serde(default)]
    pub meta: RemoteMeta,
    #[serde(skip)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteService {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub service_group_id: Option<i64>,
    #[serde(default)]
    pub sort_key: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServiceGroup {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub sort_key: i32,
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (all-day items).
fn flexible_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_remote_datetime(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("unrecognised date/time: {}", raw))
    })
}

fn optional_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_remote_datetime))
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

pub fn parse_remote_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
