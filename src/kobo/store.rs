//! Collaborators of the sync engine.
//!
//! Persistence is reduced to "look up by key, upsert". `crate::db::Database`
//! implements these traits on libsql; tests use [`MemoryStore`].

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{FileProgress, ReadingState, SyncSettings, UnifiedProgress, User};

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a device or web token. `None` means the token is unknown.
    async fn user_for_token(&self, token: &str) -> Result<Option<User>>;
}

#[async_trait]
pub trait ReadingStateRepository: Send + Sync {
    async fn find_reading_state(&self, entitlement_id: &str, user_id: i64) -> Result<Option<ReadingState>>;
    /// Newest row without an owning user, ordered by priority timestamp,
    /// then last modified, then insertion.
    async fn find_anonymous_reading_state(&self, entitlement_id: &str) -> Result<Option<ReadingState>>;
    async fn delete_reading_state(&self, entitlement_id: &str, user_id: i64) -> Result<bool>;
    /// Write the merged state and the progress derived from it in one
    /// transaction.
    async fn commit_device_sync(
        &self,
        user_id: i64,
        state: &ReadingState,
        progress: &UnifiedProgress,
        file: Option<&FileProgress>,
    ) -> Result<()>;
}

#[async_trait]
pub trait ProgressRepository: Send + Sync {
    async fn find_progress(&self, user_id: i64, book_id: i64) -> Result<Option<UnifiedProgress>>;
    async fn find_file_progress(&self, user_id: i64, file_id: i64) -> Result<Option<FileProgress>>;
    /// The file the web reader opens by default for a book.
    async fn primary_file_id(&self, book_id: i64) -> Result<Option<i64>>;
    async fn save_progress(&self, progress: &UnifiedProgress, file: Option<&FileProgress>) -> Result<()>;
}

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn sync_settings(&self, user_id: i64) -> Result<Option<SyncSettings>>;
    async fn save_sync_settings(&self, user_id: i64, settings: &SyncSettings) -> Result<()>;
}

pub trait SyncStore: UserDirectory + ReadingStateRepository + ProgressRepository + SettingsProvider {}

impl<T> SyncStore for T where T: UserDirectory + ReadingStateRepository + ProgressRepository + SettingsProvider {}

#[cfg(test)]
pub use memory::MemoryStore;
