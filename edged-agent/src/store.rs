//! SQLite-backed state snapshots.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use edged_reconciler::{ResourceKind, StateSnapshot, StateStore, StoreError};

/// Durable store keeping one snapshot row per resource kind.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("edged.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                kind TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                saved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self, kind: ResourceKind) -> Result<Option<StateSnapshot>, StoreError> {
        let row = sqlx::query("SELECT payload FROM snapshots WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Load(e.to_string()))?;

        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                let snapshot = serde_json::from_str(&payload)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, kind: ResourceKind, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(snapshot).map_err(|e| StoreError::Save(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO snapshots (kind, payload, saved_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(kind.as_str())
        .bind(&payload)
        .bind(snapshot.saved_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Save(e.to_string()))?;

        Ok(())
    }
}
