//! SQL for reading states, progress, sync settings and device tokens.
//!
//! Statements run on whatever connection they are given; transactions are
//! the caller's business (`crate::db::Database`).

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Row};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::kobo::merge::recency_key;
use crate::model::{FileProgress, ReadStatus, ReadingState, SyncSettings, UnifiedProgress, User};

pub struct KoboRepository<'a> {
    conn: &'a Connection,
}

fn to_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

fn from_json<T: DeserializeOwned>(text: Option<String>) -> Result<Option<T>> {
    Ok(text.map(|t| serde_json::from_str(&t)).transpose()?)
}

fn time_to_sql(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn time_from_sql(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    Ok(value
        .map(|t| DateTime::parse_from_rfc3339(&t))
        .transpose()?
        .map(|t| t.with_timezone(&Utc)))
}

const STATE_COLUMNS: &str =
    "id, entitlement_id, created, last_modified, priority_timestamp, status_info, statistics, current_bookmark";

fn row_to_state(row: &Row) -> Result<(i64, ReadingState)> {
    let id: i64 = row.get(0)?;
    let state = ReadingState {
        entitlement_id: row.get(1)?,
        created: row.get(2)?,
        last_modified: row.get(3)?,
        priority_timestamp: row.get(4)?,
        status_info: from_json(row.get(5)?)?,
        statistics: from_json(row.get(6)?)?,
        current_bookmark: from_json(row.get(7)?)?,
    };
    Ok((id, state))
}

const PROGRESS_COLUMNS: &str = r#"
    user_id, book_id, kobo_progress_percent, kobo_location, kobo_progress_received_time,
    kobo_progress_sent_time, kobo_status_sent_time, epub_progress, epub_progress_percent,
    epub_progress_href, read_status, read_status_modified_time, date_finished, last_read_time
"#;

fn row_to_progress(row: &Row) -> Result<UnifiedProgress> {
    let status: String = row.get(10)?;
    let read_status = ReadStatus::from_str(&status).unwrap_or_else(|| {
        tracing::warn!(status = %status, "unknown read status in database, treating as unset");
        ReadStatus::Unset
    });

    Ok(UnifiedProgress {
        user_id: row.get(0)?,
        book_id: row.get(1)?,
        kobo_progress_percent: row.get(2)?,
        kobo_location: from_json(row.get(3)?)?,
        kobo_progress_received_time: time_from_sql(row.get(4)?)?,
        kobo_progress_sent_time: time_from_sql(row.get(5)?)?,
        kobo_status_sent_time: time_from_sql(row.get(6)?)?,
        epub_progress: row.get(7)?,
        epub_progress_percent: row.get(8)?,
        epub_progress_href: row.get(9)?,
        read_status,
        read_status_modified_time: time_from_sql(row.get(11)?)?,
        date_finished: time_from_sql(row.get(12)?)?,
        last_read_time: time_from_sql(row.get(13)?)?,
    })
}

fn row_to_file_progress(row: &Row) -> Result<FileProgress> {
    Ok(FileProgress {
        user_id: row.get(0)?,
        file_id: row.get(1)?,
        book_id: row.get(2)?,
        progress_percent: row.get(3)?,
        position_href: row.get(4)?,
        position_data: row.get(5)?,
        last_read_time: time_from_sql(row.get(6)?)?,
    })
}

impl<'a> KoboRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ========================================================================
    // Users and tokens
    // ========================================================================

    pub async fn create_user(&self, name: &str) -> Result<User> {
        let mut rows = self
            .conn
            .query("INSERT INTO users (name) VALUES (?) RETURNING id, name", libsql::params![name])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(User {
                id: row.get(0)?,
                name: row.get(1)?,
            }),
            None => anyhow::bail!("failed to create user {name}"),
        }
    }

    pub async fn find_user_by_name(&self, name: &str) -> Result<Option<User>> {
        let mut rows = self
            .conn
            .query("SELECT id, name FROM users WHERE name = ?", libsql::params![name])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(User {
                id: row.get(0)?,
                name: row.get(1)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn create_token(&self, user_id: i64, token: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO kobo_tokens (token, user_id) VALUES (?, ?)",
                libsql::params![token, user_id],
            )
            .await?;
        Ok(())
    }

    pub async fn user_for_token(&self, token: &str) -> Result<Option<User>> {
        let query = r#"
            SELECT users.id, users.name
            FROM kobo_tokens
            JOIN users ON users.id = kobo_tokens.user_id
            WHERE kobo_tokens.token = ?
        "#;
        let mut rows = self.conn.query(query, libsql::params![token]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(User {
                id: row.get(0)?,
                name: row.get(1)?,
            })),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Reading states
    // ========================================================================

    pub async fn find_reading_state(&self, entitlement_id: &str, user_id: i64) -> Result<Option<ReadingState>> {
        let query = format!("SELECT {STATE_COLUMNS} FROM kobo_reading_states WHERE entitlement_id = ? AND user_id = ?");
        let mut rows = self.conn.query(&query, libsql::params![entitlement_id, user_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_state(&row)?.1)),
            None => Ok(None),
        }
    }

    /// Legacy rows may carry timestamps in older layouts, so ranking happens
    /// on parsed instants rather than in SQL.
    pub async fn find_anonymous_reading_state(&self, entitlement_id: &str) -> Result<Option<ReadingState>> {
        let query = format!("SELECT {STATE_COLUMNS} FROM kobo_reading_states WHERE entitlement_id = ? AND user_id IS NULL");
        let mut rows = self.conn.query(&query, libsql::params![entitlement_id]).await?;

        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await? {
            candidates.push(row_to_state(&row)?);
        }

        Ok(candidates
            .into_iter()
            .max_by_key(|(id, state)| (recency_key(state), *id))
            .map(|(_, state)| state))
    }

    pub async fn insert_anonymous_reading_state(&self, state: &ReadingState) -> Result<()> {
        let query = r#"
            INSERT INTO kobo_reading_states
                (entitlement_id, user_id, created, last_modified, priority_timestamp, status_info, statistics, current_bookmark)
            VALUES (?, NULL, ?, ?, ?, ?, ?, ?)
        "#;
        self.conn
            .execute(
                query,
                libsql::params![
                    state.entitlement_id.as_str(),
                    state.created.clone(),
                    state.last_modified.clone(),
                    state.priority_timestamp.clone(),
                    to_json(state.status_info.as_ref())?,
                    to_json(state.statistics.as_ref())?,
                    to_json(state.current_bookmark.as_ref())?
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn upsert_reading_state(&self, user_id: i64, state: &ReadingState) -> Result<()> {
        let status_info = to_json(state.status_info.as_ref())?;
        let statistics = to_json(state.statistics.as_ref())?;
        let bookmark = to_json(state.current_bookmark.as_ref())?;

        let update = r#"
            UPDATE kobo_reading_states
            SET created = ?, last_modified = ?, priority_timestamp = ?,
                status_info = ?, statistics = ?, current_bookmark = ?
            WHERE entitlement_id = ? AND user_id = ?
        "#;
        let updated = self
            .conn
            .execute(
                update,
                libsql::params![
                    state.created.clone(),
                    state.last_modified.clone(),
                    state.priority_timestamp.clone(),
                    status_info.clone(),
                    statistics.clone(),
                    bookmark.clone(),
                    state.entitlement_id.as_str(),
                    user_id
                ],
            )
            .await?;
        if updated > 0 {
            return Ok(());
        }

        let insert = r#"
            INSERT INTO kobo_reading_states
                (entitlement_id, user_id, created, last_modified, priority_timestamp, status_info, statistics, current_bookmark)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#;
        self.conn
            .execute(
                insert,
                libsql::params![
                    state.entitlement_id.as_str(),
                    user_id,
                    state.created.clone(),
                    state.last_modified.clone(),
                    state.priority_timestamp.clone(),
                    status_info,
                    statistics,
                    bookmark
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn delete_reading_state(&self, entitlement_id: &str, user_id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM kobo_reading_states WHERE entitlement_id = ? AND user_id = ?",
                libsql::params![entitlement_id, user_id],
            )
            .await?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Progress
    // ========================================================================

    pub async fn find_progress(&self, user_id: i64, book_id: i64) -> Result<Option<UnifiedProgress>> {
        let query = format!("SELECT {PROGRESS_COLUMNS} FROM user_book_progress WHERE user_id = ? AND book_id = ?");
        let mut rows = self.conn.query(&query, libsql::params![user_id, book_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_progress(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn upsert_progress(&self, progress: &UnifiedProgress) -> Result<()> {
        let query = format!(
            r#"
            INSERT INTO user_book_progress ({PROGRESS_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, book_id) DO UPDATE SET
                kobo_progress_percent = excluded.kobo_progress_percent,
                kobo_location = excluded.kobo_location,
                kobo_progress_received_time = excluded.kobo_progress_received_time,
                kobo_progress_sent_time = excluded.kobo_progress_sent_time,
                kobo_status_sent_time = excluded.kobo_status_sent_time,
                epub_progress = excluded.epub_progress,
                epub_progress_percent = excluded.epub_progress_percent,
                epub_progress_href = excluded.epub_progress_href,
                read_status = excluded.read_status,
                read_status_modified_time = excluded.read_status_modified_time,
                date_finished = excluded.date_finished,
                last_read_time = excluded.last_read_time
            "#
        );
        self.conn
            .execute(
                &query,
                libsql::params![
                    progress.user_id,
                    progress.book_id,
                    progress.kobo_progress_percent,
                    to_json(progress.kobo_location.as_ref())?,
                    time_to_sql(progress.kobo_progress_received_time),
                    time_to_sql(progress.kobo_progress_sent_time),
                    time_to_sql(progress.kobo_status_sent_time),
                    progress.epub_progress.clone(),
                    progress.epub_progress_percent,
                    progress.epub_progress_href.clone(),
                    progress.read_status.as_str(),
                    time_to_sql(progress.read_status_modified_time),
                    time_to_sql(progress.date_finished),
                    time_to_sql(progress.last_read_time)
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn find_file_progress(&self, user_id: i64, file_id: i64) -> Result<Option<FileProgress>> {
        let query = r#"
            SELECT user_id, file_id, book_id, progress_percent, position_href, position_data, last_read_time
            FROM user_file_progress
            WHERE user_id = ? AND file_id = ?
        "#;
        let mut rows = self.conn.query(query, libsql::params![user_id, file_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_file_progress(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn upsert_file_progress(&self, file: &FileProgress) -> Result<()> {
        let query = r#"
            INSERT INTO user_file_progress
                (user_id, file_id, book_id, progress_percent, position_href, position_data, last_read_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, file_id) DO UPDATE SET
                book_id = excluded.book_id,
                progress_percent = excluded.progress_percent,
                position_href = excluded.position_href,
                position_data = excluded.position_data,
                last_read_time = excluded.last_read_time
        "#;
        self.conn
            .execute(
                query,
                libsql::params![
                    file.user_id,
                    file.file_id,
                    file.book_id,
                    file.progress_percent,
                    file.position_href.clone(),
                    file.position_data.clone(),
                    time_to_sql(file.last_read_time)
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn add_book_file(&self, book_id: i64, path: &str, primary: bool) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO book_files (book_id, path, is_primary) VALUES (?, ?, ?) RETURNING id",
                libsql::params![book_id, path, primary as i64],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => anyhow::bail!("failed to add file for book {book_id}"),
        }
    }

    pub async fn primary_file_id(&self, book_id: i64) -> Result<Option<i64>> {
        let query = "SELECT id FROM book_files WHERE book_id = ? ORDER BY is_primary DESC, id LIMIT 1";
        let mut rows = self.conn.query(query, libsql::params![book_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub async fn sync_settings(&self, user_id: i64) -> Result<Option<SyncSettings>> {
        let query = r#"
            SELECT two_way_progress_sync, progress_mark_as_finished_threshold, progress_mark_as_reading_threshold
            FROM user_sync_settings
            WHERE user_id = ?
        "#;
        let mut rows = self.conn.query(query, libsql::params![user_id]).await?;
        match rows.next().await? {
            Some(row) => {
                let two_way: i64 = row.get(0)?;
                Ok(Some(SyncSettings {
                    two_way_progress_sync: two_way != 0,
                    progress_mark_as_finished_threshold: row.get(1)?,
                    progress_mark_as_reading_threshold: row.get(2)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn save_sync_settings(&self, user_id: i64, settings: &SyncSettings) -> Result<()> {
        let query = r#"
            INSERT INTO user_sync_settings
                (user_id, two_way_progress_sync, progress_mark_as_finished_threshold, progress_mark_as_reading_threshold)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                two_way_progress_sync = excluded.two_way_progress_sync,
                progress_mark_as_finished_threshold = excluded.progress_mark_as_finished_threshold,
                progress_mark_as_reading_threshold = excluded.progress_mark_as_reading_threshold,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        "#;
        self.conn
            .execute(
                query,
                libsql::params![
                    user_id,
                    settings.two_way_progress_sync as i64,
                    settings.progress_mark_as_finished_threshold,
                    settings.progress_mark_as_reading_threshold
                ],
            )
            .await?;
        Ok(())
    }
}
