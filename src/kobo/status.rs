//! Read-status derivation from a progress percentage.
//!
//! The device echoes back whatever the server last pushed to it, usually
//! within a second or two. A status change made on the server is therefore
//! held until it has been sent and the debounce window after the send has
//! passed; only then may device progress re-derive it.

use chrono::{DateTime, TimeDelta, Utc};

use crate::kobo::timestamp::is_strictly_after;
use crate::model::{ReadStatus, SyncSettings, UnifiedProgress};

pub const DEFAULT_STATUS_DEBOUNCE_SECONDS: i64 = 10;

pub fn derive_status(percent: f64, settings: &SyncSettings) -> ReadStatus {
    if percent >= settings.progress_mark_as_finished_threshold {
        ReadStatus::Read
    } else if percent >= settings.progress_mark_as_reading_threshold {
        ReadStatus::Reading
    } else {
        ReadStatus::Unread
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusMachine {
    debounce: TimeDelta,
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new(TimeDelta::seconds(DEFAULT_STATUS_DEBOUNCE_SECONDS))
    }
}

impl StatusMachine {
    pub fn new(debounce: TimeDelta) -> Self {
        Self { debounce }
    }

    pub fn should_preserve_current_status(&self, progress: &UnifiedProgress, now: DateTime<Utc>) -> bool {
        let Some(modified) = progress.read_status_modified_time else {
            return false;
        };

        match progress.kobo_status_sent_time {
            None => true,
            Some(sent) => is_strictly_after(Some(modified), Some(sent)) || now - sent < self.debounce,
        }
    }

    /// Re-derive the status from device progress unless a server-side change
    /// has to be preserved. Returns the new progress and whether the status
    /// changed.
    pub fn apply_device_progress(
        &self,
        mut progress: UnifiedProgress,
        percent: f64,
        settings: &SyncSettings,
        now: DateTime<Utc>,
    ) -> (UnifiedProgress, bool) {
        if self.should_preserve_current_status(&progress, now) {
            tracing::debug!(
                book_id = progress.book_id,
                user_id = progress.user_id,
                status = progress.read_status.as_str(),
                "keeping server-side read status"
            );
            return (progress, false);
        }

        let derived = derive_status(percent, settings);
        if derived == progress.read_status {
            return (progress, false);
        }

        progress.read_status = derived;
        stamp_finished(&mut progress, now);
        (progress, true)
    }

    /// Derive the status from web-reader progress. This is a server-side
    /// change, so it is recorded as pending for the device.
    pub fn apply_local_progress(
        &self,
        progress: UnifiedProgress,
        percent: f64,
        settings: &SyncSettings,
        now: DateTime<Utc>,
    ) -> (UnifiedProgress, bool) {
        let derived = derive_status(percent, settings);
        if derived == progress.read_status {
            return (progress, false);
        }
        (self.set_status(progress, derived, now), true)
    }

    pub fn set_status(&self, mut progress: UnifiedProgress, status: ReadStatus, now: DateTime<Utc>) -> UnifiedProgress {
        progress.read_status = status;
        progress.read_status_modified_time = Some(now);
        stamp_finished(&mut progress, now);
        progress
    }
}

// dateFinished is only ever set, never cleared.
fn stamp_finished(progress: &mut UnifiedProgress, now: DateTime<Utc>) {
    if progress.read_status == ReadStatus::Read && progress.date_finished.is_none() {
        progress.date_finished = Some(now);
    }
}
