use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{SyncHistory, SyncStats, SyncStatus, SyncType};

// ============================================================================
// Sync Trigger Types
// ============================================================================

/// Parameters for one sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub sync_type: SyncType,
    /// Re-write every fetched item even when its timestamp has not advanced
    #[serde(default)]
    pub force_full: bool,
}

impl SyncRequest {
    pub fn scheduled() -> Self {
        Self {
            sync_type: SyncType::Scheduled,
            force_full: false,
        }
    }

    pub fn manual(force_full: bool) -> Self {
        Self {
            sync_type: SyncType::Manual,
            force_full,
        }
    }
}

/// Result handed back to whoever triggered a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub success: bool,
    pub message: String,
    pub stats: SyncStats,
    pub history_id: Option<Uuid>,
}

impl SyncSummary {
    pub fn succeeded(stats: SyncStats, history_id: Uuid) -> Self {
        Self {
            success: true,
            message: format!(
                "Synced {} calendars: {} events found, {} inserted, {} updated, {} skipped, {} services",
                stats.calendars_processed,
                stats.events_found,
                stats.events_inserted,
                stats.events_updated,
                stats.events_skipped,
                stats.services_imported
            ),
            stats,
            history_id: Some(history_id),
        }
    }

    pub fn failed(message: impl Into<String>, stats: SyncStats, history_id: Option<Uuid>) -> Self {
        Self {
            success: false,
            message: message.into(),
            stats,
            history_id,
        }
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Latest run as shown to an operator, without technical detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastSyncStatus {
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub stats: SyncStats,
}

impl From<&SyncHistory> for LastSyncStatus {
    fn from(history: &SyncHistory) -> Self {
        Self {
            sync_type: history.sync_type,
            status: history.status,
            started_at: history.started_at,
            completed_at: history.completed_at,
            message: history.error_message.clone(),
            stats: history.stats,
        }
    }
}
