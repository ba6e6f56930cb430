use crate::config::Config;
use crate::kobo::repository::KoboRepository;
use crate::kobo::store::{ProgressRepository, ReadingStateRepository, SettingsProvider, UserDirectory};
use crate::model::*;
use anyhow::Result;
use async_trait::async_trait;
use libsql::{Builder, Connection, Database as LibsqlDatabase};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

const SYSTEM_MIGRATIONS: &[(&str, &str)] =
    &[("system/000_migrations_table.sql", include_str!("migrations/system/000_migrations_table.sql"))];

const MIGRATIONS: &[(&str, &str)] = &[("001_schema.sql", include_str!("migrations/001_schema.sql"))];

pub struct Database {
    db: LibsqlDatabase,
    conn: Connection,
    tx_lock: Mutex<()>,
    turso_url: Option<String>,
    turso_auth_token: Option<String>,
}

impl Database {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn kobo(&self) -> KoboRepository<'_> {
        KoboRepository::new(&self.conn)
    }

    pub fn is_replica(turso_url: &Option<String>, turso_auth_token: &Option<String>) -> bool {
        turso_url.is_some() && turso_auth_token.is_some()
    }

    pub async fn sync(&self) -> Result<()> {
        if Self::is_replica(&self.turso_url, &self.turso_auth_token) {
            self.db
                .sync()
                .await
                .map_err(|e| anyhow::anyhow!("sync failed: {}", e))?;
        }
        Ok(())
    }

    async fn is_migration_applied(conn: &Connection, name: &str) -> Result<bool> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn record_migration(conn: &Connection, name: &str) -> Result<()> {
        let query = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(query, libsql::params![name]).await?;
        Ok(())
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql)
            .await
            .map_err(|e| anyhow::anyhow!("failed to execute migration {name}: {e}"))?;

        Self::record_migration(conn, name).await?;
        Ok(())
    }

    /// Opens the configured database under `data_dir`. With both Turso
    /// settings present the file is an embedded replica synced in the
    /// background.
    pub async fn new(cfg: &Config, data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(cfg.app.get_db());
        let turso_url = cfg.app.turso_url.clone();
        let turso_auth_token = cfg.app.turso_auth_token.clone();

        let db = match (&turso_url, &turso_auth_token) {
            (Some(url), Some(token)) => {
                tracing::info!("[db] running in synced database mode (offline writes)");
                let sync_interval = Duration::from_secs(cfg.app.sync_interval_seconds);
                Builder::new_synced_database(&path, url.clone(), token.clone())
                    .sync_interval(sync_interval)
                    .build()
                    .await?
            }
            _ => Builder::new_local(&path).build().await?,
        };

        Self::setup(db, turso_url, turso_auth_token).await
    }

    /// A local database without replication, `":memory:"` included.
    pub async fn open_local(path: &str) -> Result<Self> {
        let db = Builder::new_local(path).build().await?;
        Self::setup(db, None, None).await
    }

    async fn setup(db: LibsqlDatabase, turso_url: Option<String>, turso_auth_token: Option<String>) -> Result<Self> {
        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        for (filename, sql) in SYSTEM_MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        for (filename, sql) in MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        for (filename, sql) in crate::kobo::migrations() {
            Self::run_migration(&conn, filename, sql).await?;
        }

        Ok(Database {
            db,
            conn,
            tx_lock: Mutex::new(()),
            turso_url,
            turso_auth_token,
        })
    }

    pub async fn create_user(&self, name: &str) -> Result<User> {
        let _guard = self.tx_lock.lock().await;
        self.kobo().create_user(name).await
    }

    pub async fn find_user_by_name(&self, name: &str) -> Result<Option<User>> {
        self.kobo().find_user_by_name(name).await
    }

    pub async fn create_token(&self, user_id: i64, token: &str) -> Result<()> {
        let _guard = self.tx_lock.lock().await;
        self.kobo().create_token(user_id, token).await
    }

    pub async fn add_book_file(&self, book_id: i64, path: &str, primary: bool) -> Result<i64> {
        let _guard = self.tx_lock.lock().await;
        self.kobo().add_book_file(book_id, path, primary).await
    }

    pub async fn insert_anonymous_reading_state(&self, state: &ReadingState) -> Result<()> {
        let _guard = self.tx_lock.lock().await;
        self.kobo().insert_anonymous_reading_state(state).await
    }

    async fn commit_device_sync_internal(
        &self,
        user_id: i64,
        state: &ReadingState,
        progress: &UnifiedProgress,
        file: Option<&FileProgress>,
    ) -> Result<()> {
        let repo = self.kobo();
        repo.upsert_reading_state(user_id, state).await?;
        repo.upsert_progress(progress).await?;
        if let Some(file) = file {
            repo.upsert_file_progress(file).await?;
        }
        Ok(())
    }

    async fn save_progress_internal(&self, progress: &UnifiedProgress, file: Option<&FileProgress>) -> Result<()> {
        let repo = self.kobo();
        repo.upsert_progress(progress).await?;
        if let Some(file) = file {
            repo.upsert_file_progress(file).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for Database {
    async fn user_for_token(&self, token: &str) -> Result<Option<User>> {
        self.kobo().user_for_token(token).await
    }
}

#[async_trait]
impl ReadingStateRepository for Database {
    async fn find_reading_state(&self, entitlement_id: &str, user_id: i64) -> Result<Option<ReadingState>> {
        self.kobo().find_reading_state(entitlement_id, user_id).await
    }

    async fn find_anonymous_reading_state(&self, entitlement_id: &str) -> Result<Option<ReadingState>> {
        self.kobo().find_anonymous_reading_state(entitlement_id).await
    }

    async fn delete_reading_state(&self, entitlement_id: &str, user_id: i64) -> Result<bool> {
        let _guard = self.tx_lock.lock().await;
        self.kobo().delete_reading_state(entitlement_id, user_id).await
    }

    async fn commit_device_sync(
        &self,
        user_id: i64,
        state: &ReadingState,
        progress: &UnifiedProgress,
        file: Option<&FileProgress>,
    ) -> Result<()> {
        let _guard = self.tx_lock.lock().await;

        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let result = self.commit_device_sync_internal(user_id, state, progress, file).await;

        match result {
            Ok(()) => {
                self.conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ProgressRepository for Database {
    async fn find_progress(&self, user_id: i64, book_id: i64) -> Result<Option<UnifiedProgress>> {
        self.kobo().find_progress(user_id, book_id).await
    }

    async fn find_file_progress(&self, user_id: i64, file_id: i64) -> Result<Option<FileProgress>> {
        self.kobo().find_file_progress(user_id, file_id).await
    }

    async fn primary_file_id(&self, book_id: i64) -> Result<Option<i64>> {
        self.kobo().primary_file_id(book_id).await
    }

    async fn save_progress(&self, progress: &UnifiedProgress, file: Option<&FileProgress>) -> Result<()> {
        let _guard = self.tx_lock.lock().await;

        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        match self.save_progress_internal(progress, file).await {
            Ok(()) => {
                self.conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl SettingsProvider for Database {
    async fn sync_settings(&self, user_id: i64) -> Result<Option<SyncSettings>> {
        self.kobo().sync_settings(user_id).await
    }

    async fn save_sync_settings(&self, user_id: i64, settings: &SyncSettings) -> Result<()> {
        let _guard = self.tx_lock.lock().await;
        self.kobo().save_sync_settings(user_id, settings).await
    }
}
