//! Entry points of the reading-state sync engine.
//!
//! Every save is lookup, pure merge, then one write, scoped to a single
//! `(entitlement, user)` key. Saves for the same key are serialized through
//! a striped async mutex, which covers a single server process; a second
//! process writing the same database would reintroduce the lost-update race.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::api::{UpdateResponse, WebProgressRequest};
use crate::error::SyncError;
use crate::kobo::bridge::{self, parse_book_id};
use crate::kobo::clock::Clock;
use crate::kobo::merge;
use crate::kobo::notifier::ProgressNotifier;
use crate::kobo::status::{DEFAULT_STATUS_DEBOUNCE_SECONDS, StatusMachine};
use crate::kobo::store::SyncStore;
use crate::kobo::timestamp;
use crate::model::{FileProgress, ReadStatus, ReadingState, SyncSettings, UnifiedProgress, User};

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Used for users without stored settings.
    pub defaults: SyncSettings,
    pub status_debounce: TimeDelta,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            defaults: SyncSettings::default(),
            status_debounce: TimeDelta::seconds(DEFAULT_STATUS_DEBOUNCE_SECONDS),
        }
    }
}

struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, entitlement_id: &str, user_id: i64) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        (entitlement_id.trim(), user_id).hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index].lock().await
    }
}

pub struct SyncService {
    store: Arc<dyn SyncStore>,
    clock: Arc<dyn Clock>,
    notifier: ProgressNotifier,
    defaults: SyncSettings,
    status: StatusMachine,
    locks: KeyLocks,
}

impl SyncService {
    pub fn new(store: Arc<dyn SyncStore>, clock: Arc<dyn Clock>, notifier: ProgressNotifier, options: SyncOptions) -> Self {
        Self {
            store,
            clock,
            notifier,
            defaults: options.defaults,
            status: StatusMachine::new(options.status_debounce),
            locks: KeyLocks::new(),
        }
    }

    pub async fn authenticate(&self, token: &str) -> Result<User, SyncError> {
        self.store
            .user_for_token(token)
            .await
            .context("failed to resolve token")?
            .ok_or(SyncError::UnknownToken)
    }

    pub async fn settings(&self, user_id: i64) -> Result<SyncSettings, SyncError> {
        let stored = self
            .store
            .sync_settings(user_id)
            .await
            .context("failed to load sync settings")?;
        Ok(stored.unwrap_or_else(|| self.defaults.clone()))
    }

    pub async fn update_settings(&self, user_id: i64, settings: SyncSettings) -> Result<SyncSettings, SyncError> {
        for threshold in [
            settings.progress_mark_as_reading_threshold,
            settings.progress_mark_as_finished_threshold,
        ] {
            check_percent(threshold)?;
        }
        if settings.progress_mark_as_reading_threshold > settings.progress_mark_as_finished_threshold {
            return Err(SyncError::InvalidThresholds {
                reading: settings.progress_mark_as_reading_threshold,
                finished: settings.progress_mark_as_finished_threshold,
            });
        }
        self.store
            .save_sync_settings(user_id, &settings)
            .await
            .context("failed to save sync settings")?;
        Ok(settings)
    }

    /// Device PUT. Every item is acknowledged; items whose entitlement is
    /// not a book id are acknowledged without being stored.
    pub async fn save_reading_states(
        &self,
        user: &User,
        states: Vec<ReadingState>,
        path_entitlement_id: Option<&str>,
    ) -> Result<UpdateResponse, SyncError> {
        let now = self.clock.now();
        let request_ts = timestamp::format(now);
        let mut acknowledged = Vec::with_capacity(states.len());

        for mut state in states {
            if state.entitlement_id.trim().is_empty() {
                if let Some(id) = path_entitlement_id {
                    state.entitlement_id = id.to_string();
                }
            }
            acknowledged.push(state.entitlement_id.clone());
            self.save_one(user, state, &request_ts, now).await?;
        }

        Ok(UpdateResponse::success_for(acknowledged))
    }

    async fn save_one(&self, user: &User, mut state: ReadingState, request_ts: &str, now: DateTime<Utc>) -> Result<(), SyncError> {
        let Some(book_id) = parse_book_id(&state.entitlement_id) else {
            tracing::warn!(
                entitlement_id = %state.entitlement_id,
                user_id = user.id,
                "ignoring reading state for non-numeric entitlement"
            );
            return Ok(());
        };
        // "05" and "5" are the same book.
        state.entitlement_id = book_id.to_string();

        let _guard = self.locks.lock(&state.entitlement_id, user.id).await;

        let incoming = merge::prepare_incoming(state, request_ts);
        let existing = self
            .store
            .find_reading_state(&incoming.entitlement_id, user.id)
            .await
            .context("failed to load reading state")?;

        // On first insert the incoming bookmark is stored as sent, whatever
        // its timestamp.
        let accepted_bookmark = match &existing {
            None => incoming.current_bookmark.clone(),
            Some(existing) => merge::sub_supersedes(incoming.current_bookmark.as_ref(), existing.current_bookmark.as_ref())
                .then(|| incoming.current_bookmark.clone())
                .flatten(),
        };

        let merged = match &existing {
            Some(existing) => merge::merge(existing, &incoming),
            None => merge::initial(incoming, request_ts),
        };

        let settings = self.settings(user.id).await?;
        let prior = self
            .store
            .find_progress(user.id, book_id)
            .await
            .context("failed to load progress")?;
        let file = self.load_file_progress(user.id, book_id, None).await?;

        let mut progress = prior.clone().unwrap_or_else(|| UnifiedProgress::new(user.id, book_id));
        progress.kobo_progress_received_time = Some(now);
        if let Some(bookmark) = &merged.current_bookmark {
            if bookmark.progress_percent.is_some() {
                progress.kobo_progress_percent = bookmark.progress_percent;
            }
            if bookmark.location.is_some() {
                progress.kobo_location = bookmark.location.clone();
            }
        }

        let (progress, file, status_changed) = match &accepted_bookmark {
            Some(bookmark) => {
                let (progress, file) = bridge::mirror_device_progress(bookmark, progress, file, &settings, now);
                match bookmark.progress_percent {
                    Some(percent) => {
                        let (progress, changed) = self.status.apply_device_progress(progress, percent, &settings, now);
                        (progress, file, changed)
                    }
                    None => (progress, file, false),
                }
            }
            None => (progress, file, false),
        };

        self.store
            .commit_device_sync(user.id, &merged, &progress, file.as_ref())
            .await
            .context("failed to save reading state")?;

        let percent_changed = prior.as_ref().and_then(|p| p.kobo_progress_percent) != progress.kobo_progress_percent;
        tracing::info!(
            entitlement_id = %merged.entitlement_id,
            user_id = user.id,
            percent = ?progress.kobo_progress_percent,
            status = progress.read_status.as_str(),
            "reading state saved"
        );

        if percent_changed || status_changed {
            self.notifier.notify(book_id, progress.kobo_progress_percent, user.id);
        }
        Ok(())
    }

    /// Device GET: device row, then the newest anonymous row, then a state
    /// synthesized from stored progress. Empty when none exist.
    pub async fn get_reading_state(&self, user: &User, entitlement_id: &str) -> Result<Vec<ReadingState>, SyncError> {
        let Some(book_id) = parse_book_id(entitlement_id) else {
            tracing::debug!(entitlement_id, "no progress for non-numeric entitlement");
            return Ok(vec![]);
        };
        let entitlement_id: &str = &book_id.to_string();

        let _guard = self.locks.lock(entitlement_id, user.id).await;
        let now = self.clock.now();

        let settings = self.settings(user.id).await?;
        let progress = self
            .store
            .find_progress(user.id, book_id)
            .await
            .context("failed to load progress")?;
        let file = self.load_file_progress(user.id, book_id, None).await?;

        let base = match self
            .store
            .find_reading_state(entitlement_id, user.id)
            .await
            .context("failed to load reading state")?
        {
            Some(state) => Some(state),
            None => match self
                .store
                .find_anonymous_reading_state(entitlement_id)
                .await
                .context("failed to load anonymous reading state")?
            {
                Some(state) => Some(state),
                None => progress
                    .as_ref()
                    .and_then(|p| bridge::synthesize(entitlement_id, p, &settings)),
            },
        };

        let Some(state) = base else {
            return Ok(vec![]);
        };

        let state = bridge::overlay(state, progress.as_ref(), file.as_ref(), &settings);
        let state = bridge::overlay_status(state, progress.as_ref());
        let state = merge::normalize_state(state);

        if let Some(mut progress) = progress {
            progress.kobo_progress_sent_time = Some(now);
            if progress.has_pending_status() {
                progress.kobo_status_sent_time = Some(now);
            }
            self.store
                .save_progress(&progress, None)
                .await
                .context("failed to record progress push")?;
        }

        Ok(vec![state])
    }

    /// Device DELETE: the book was removed from the device.
    pub async fn delete_reading_state(&self, user: &User, entitlement_id: &str) -> Result<bool, SyncError> {
        let Some(book_id) = parse_book_id(entitlement_id) else {
            return Ok(false);
        };
        let entitlement_id: &str = &book_id.to_string();

        let _guard = self.locks.lock(entitlement_id, user.id).await;
        let deleted = self
            .store
            .delete_reading_state(entitlement_id, user.id)
            .await
            .context("failed to delete reading state")?;
        tracing::info!(entitlement_id, user_id = user.id, deleted, "reading state removed");
        Ok(deleted)
    }

    /// Progress reported by the web reader.
    pub async fn record_web_progress(
        &self,
        user: &User,
        book_id: i64,
        update: WebProgressRequest,
    ) -> Result<UnifiedProgress, SyncError> {
        check_percent(update.percent)?;

        let _guard = self.locks.lock(&book_id.to_string(), user.id).await;
        let now = self.clock.now();

        let settings = self.settings(user.id).await?;
        let prior = self
            .store
            .find_progress(user.id, book_id)
            .await
            .context("failed to load progress")?;
        let mut file = self.load_file_progress(user.id, book_id, update.file_id).await?;

        let mut progress = prior.clone().unwrap_or_else(|| UnifiedProgress::new(user.id, book_id));
        progress.epub_progress = update.position.clone();
        progress.epub_progress_percent = Some(update.percent);
        if update.href.is_some() {
            progress.epub_progress_href = update.href.clone();
        }
        progress.last_read_time = Some(now);

        if let Some(file) = file.as_mut() {
            file.progress_percent = Some(update.percent);
            if update.href.is_some() {
                file.position_href = update.href.clone();
            }
            file.position_data = update.position;
            file.last_read_time = Some(now);
        }

        let (progress, status_changed) = self.status.apply_local_progress(progress, update.percent, &settings, now);
        self.store
            .save_progress(&progress, file.as_ref())
            .await
            .context("failed to save progress")?;

        let percent_changed = prior.and_then(|p| p.epub_progress_percent) != Some(update.percent);
        if percent_changed || status_changed {
            self.notifier.notify(book_id, Some(update.percent), user.id);
        }
        Ok(progress)
    }

    /// Manual status change from the web UI; held from device re-derivation
    /// until it has been pushed.
    pub async fn set_read_status(&self, user: &User, book_id: i64, status: ReadStatus) -> Result<UnifiedProgress, SyncError> {
        let _guard = self.locks.lock(&book_id.to_string(), user.id).await;
        let now = self.clock.now();

        let prior = self
            .store
            .find_progress(user.id, book_id)
            .await
            .context("failed to load progress")?
            .unwrap_or_else(|| UnifiedProgress::new(user.id, book_id));
        let changed = prior.read_status != status;

        let progress = self.status.set_status(prior, status, now);
        self.store
            .save_progress(&progress, None)
            .await
            .context("failed to save read status")?;

        if changed {
            let percent = progress.kobo_progress_percent.or(progress.epub_progress_percent);
            self.notifier.notify(book_id, percent, user.id);
        }
        Ok(progress)
    }

    pub async fn progress(&self, user: &User, book_id: i64) -> Result<Option<UnifiedProgress>, SyncError> {
        Ok(self
            .store
            .find_progress(user.id, book_id)
            .await
            .context("failed to load progress")?)
    }

    async fn load_file_progress(&self, user_id: i64, book_id: i64, file_id: Option<i64>) -> Result<Option<FileProgress>, SyncError> {
        let file_id = match file_id {
            Some(id) => Some(id),
            None => self
                .store
                .primary_file_id(book_id)
                .await
                .context("failed to resolve book file")?,
        };
        let Some(file_id) = file_id else {
            return Ok(None);
        };

        let stored = self
            .store
            .find_file_progress(user_id, file_id)
            .await
            .context("failed to load file progress")?;
        Ok(Some(stored.unwrap_or_else(|| FileProgress::new(user_id, book_id, file_id))))
    }
}

fn check_percent(percent: f64) -> Result<(), SyncError> {
    if (0.0..=100.0).contains(&percent) {
        Ok(())
    } else {
        Err(SyncError::InvalidProgress(percent))
    }
}
