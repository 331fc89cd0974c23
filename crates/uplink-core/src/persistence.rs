//! SQLite persistence for the monitored folder lists

use crate::error::Result;
use crate::types::FolderSet;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

const KIND_UPLOAD: &str = "upload";
const KIND_PURGE: &str = "purge";

pub struct FolderStore {
    pool: SqlitePool,
}

impl FolderStore {
    pub async fn open(database_path: &Path) -> Result<Self> {
        tracing::info!("Opening SQLite database at: {}", database_path.display());

        if let Some(parent) = database_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_monitor (
                kind TEXT PRIMARY KEY,
                paths TEXT NOT NULL DEFAULT '[]',
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Stored folder lists, `None` when nothing was ever saved. A saved
    /// empty set comes back as `Some`.
    pub async fn load(&self) -> Result<Option<FolderSet>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT kind, paths FROM upload_monitor
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut folders = FolderSet::default();
        for (kind, paths) in rows {
            let parsed: Vec<PathBuf> = serde_json::from_str(&paths)?;
            match kind.as_str() {
                KIND_UPLOAD => folders.upload_folders = parsed,
                KIND_PURGE => folders.purge_folders = parsed,
                other => tracing::warn!("Ignoring unknown folder kind: {}", other),
            }
        }
        Ok(Some(folders))
    }

    /// Replace both lists in one transaction
    pub async fn save(&self, folders: &FolderSet) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (kind, paths) in [
            (KIND_UPLOAD, &folders.upload_folders),
            (KIND_PURGE, &folders.purge_folders),
        ] {
            sqlx::query(
                r#"
                INSERT INTO upload_monitor (kind, paths, updated_at)
                VALUES (?1, ?2, datetime('now'))
                ON CONFLICT(kind) DO UPDATE SET paths = excluded.paths, updated_at = excluded.updated_at
                "#,
            )
            .bind(kind)
            .bind(serde_json::to_string(paths)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!("Saved folder configuration");
        Ok(())
    }
}
