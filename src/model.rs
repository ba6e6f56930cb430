use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
}

/// A sub-object of a reading state that carries its own `LastModified`.
pub trait Timestamped {
    fn last_modified(&self) -> Option<&str>;
    fn set_last_modified(&mut self, ts: String);
}

/// Device-visible reading state for one entitlement, in Kobo wire casing.
///
/// Fields the engine does not interpret are kept in the `extra` maps so a
/// round trip through the server never drops what the device sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReadingState {
    #[serde(default)]
    pub entitlement_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_bookmark: Option<Bookmark>,
}

impl ReadingState {
    pub fn new(entitlement_id: impl Into<String>) -> Self {
        Self {
            entitlement_id: entitlement_id.into(),
            ..Default::default()
        }
    }

    /// The four timestamps that feed the priority timestamp.
    pub fn sub_timestamps(&self) -> [Option<&str>; 4] {
        [
            self.last_modified.as_deref(),
            self.status_info.as_ref().and_then(|s| s.last_modified()),
            self.statistics.as_ref().and_then(|s| s.last_modified()),
            self.current_bookmark.as_ref().and_then(|b| b.last_modified()),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statistics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Bookmark {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_source_progress_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

macro_rules! impl_timestamped {
    ($($ty:ty),*) => {
        $(
            impl Timestamped for $ty {
                fn last_modified(&self) -> Option<&str> {
                    self.last_modified.as_deref()
                }

                fn set_last_modified(&mut self, ts: String) {
                    self.last_modified = Some(ts);
                }
            }
        )*
    };
}

impl_timestamped!(StatusInfo, Statistics, Bookmark);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadStatus {
    #[default]
    Unset,
    Unread,
    Reading,
    Read,
}

impl ReadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStatus::Unset => "UNSET",
            ReadStatus::Unread => "UNREAD",
            ReadStatus::Reading => "READING",
            ReadStatus::Read => "READ",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "UNSET" => Some(ReadStatus::Unset),
            "UNREAD" => Some(ReadStatus::Unread),
            "READING" => Some(ReadStatus::Reading),
            "READ" => Some(ReadStatus::Read),
            _ => None,
        }
    }

    /// Status name used in the device's `StatusInfo.Status` field.
    pub fn kobo_status(&self) -> Option<&'static str> {
        match self {
            ReadStatus::Unset => None,
            ReadStatus::Unread => Some("ReadyToRead"),
            ReadStatus::Reading => Some("Reading"),
            ReadStatus::Read => Some("Finished"),
        }
    }
}

/// Per user+book progress shared by the device path and the web reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedProgress {
    pub user_id: i64,
    pub book_id: i64,
    pub kobo_progress_percent: Option<f64>,
    pub kobo_location: Option<Location>,
    pub kobo_progress_received_time: Option<DateTime<Utc>>,
    pub kobo_progress_sent_time: Option<DateTime<Utc>>,
    pub kobo_status_sent_time: Option<DateTime<Utc>>,
    pub epub_progress: Option<String>,
    pub epub_progress_percent: Option<f64>,
    pub epub_progress_href: Option<String>,
    pub read_status: ReadStatus,
    pub read_status_modified_time: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
    pub last_read_time: Option<DateTime<Utc>>,
}

impl UnifiedProgress {
    pub fn new(user_id: i64, book_id: i64) -> Self {
        Self {
            user_id,
            book_id,
            kobo_progress_percent: None,
            kobo_location: None,
            kobo_progress_received_time: None,
            kobo_progress_sent_time: None,
            kobo_status_sent_time: None,
            epub_progress: None,
            epub_progress_percent: None,
            epub_progress_href: None,
            read_status: ReadStatus::Unset,
            read_status_modified_time: None,
            date_finished: None,
            last_read_time: None,
        }
    }

    /// A status change made on the server that the device has not been sent yet.
    pub fn has_pending_status(&self) -> bool {
        match (self.read_status_modified_time, self.kobo_status_sent_time) {
            (Some(_), None) => true,
            (Some(modified), Some(sent)) => modified > sent,
            _ => false,
        }
    }
}

/// Web-reader cursor for a single file of a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProgress {
    pub user_id: i64,
    pub book_id: i64,
    pub file_id: i64,
    pub progress_percent: Option<f64>,
    pub position_href: Option<String>,
    pub position_data: Option<String>,
    pub last_read_time: Option<DateTime<Utc>>,
}

impl FileProgress {
    pub fn new(user_id: i64, book_id: i64, file_id: i64) -> Self {
        Self {
            user_id,
            book_id,
            file_id,
            progress_percent: None,
            position_href: None,
            position_data: None,
            last_read_time: None,
        }
    }
}

pub const DEFAULT_FINISHED_THRESHOLD: f64 = 99.0;
pub const DEFAULT_READING_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub two_way_progress_sync: bool,
    pub progress_mark_as_finished_threshold: f64,
    pub progress_mark_as_reading_threshold: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            two_way_progress_sync: false,
            progress_mark_as_finished_threshold: DEFAULT_FINISHED_THRESHOLD,
            progress_mark_as_reading_threshold: DEFAULT_READING_THRESHOLD,
        }
    }
}
