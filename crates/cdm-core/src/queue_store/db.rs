//! SQLite-backed queue store: connection, migrations and row CRUD.

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::download::{DownloadId, DownloadSnapshot};

/// Percent-encode a path for use in a sqlite:// URI so spaces and special chars don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

/// One stored queue entry.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub id: DownloadId,
    pub position: i64,
    pub snapshot: DownloadSnapshot,
}

/// Handle to the queue database.
///
/// The default file lives under the XDG state directory:
/// `~/.local/state/cdm/queue.db` on Debian.
#[derive(Clone)]
pub struct QueueStore {
    pub(crate) pool: Pool<Sqlite>,
}

impl QueueStore {
    /// Open (or create) the default queue database and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("cdm")?;
        let state_dir = xdg_dirs.get_state_home().join("cdm");
        Self::open_at(state_dir.join("queue.db")).await
    }

    /// Open (or create) the database at a specific path. Creates parent dirs if needed.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = path_to_sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await
            .with_context(|| format!("opening queue database {}", path.display()))?;
        let store = QueueStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // `item` holds the serialized DownloadSnapshot; `pos` orders the queue.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pos INTEGER NOT NULL,
                item TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append a download to the end of the queue. Returns its row id.
    pub async fn queue_download(&self, snapshot: &DownloadSnapshot) -> Result<DownloadId> {
        let now = unix_timestamp();
        let item = serde_json::to_string(snapshot)?;
        let row_id = sqlx::query(
            r#"
            INSERT INTO queue (pos, item, created_at, updated_at)
            VALUES ((SELECT COALESCE(MAX(pos), -1) + 1 FROM queue), ?1, ?2, ?3)
            "#,
        )
        .bind(item)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(row_id)
    }

    /// Overwrite the stored snapshot of a download.
    pub async fn save_download(&self, id: DownloadId, snapshot: &DownloadSnapshot) -> Result<()> {
        let item = serde_json::to_string(snapshot)?;
        let res = sqlx::query("UPDATE queue SET item = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(item)
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            anyhow::bail!("download {} not found in queue", id);
        }
        Ok(())
    }

    /// Remove a download from the queue. Missing ids are not an error.
    pub async fn delete_download(&self, id: DownloadId) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a download to `position`; later rows shift by one.
    pub async fn set_position(&self, id: DownloadId, position: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT pos FROM queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            anyhow::bail!("download {} not found in queue", id);
        };
        let old: i64 = row.get("pos");
        let position = position.max(0);
        if position < old {
            sqlx::query("UPDATE queue SET pos = pos + 1 WHERE pos >= ?1 AND pos < ?2")
                .bind(position)
                .bind(old)
                .execute(&mut *tx)
                .await?;
        } else if position > old {
            sqlx::query("UPDATE queue SET pos = pos - 1 WHERE pos > ?1 AND pos <= ?2")
                .bind(old)
                .bind(position)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE queue SET pos = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(position)
            .bind(unix_timestamp())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// All stored downloads in queue order. Rows whose JSON no longer parses are
    /// logged and skipped.
    pub async fn load_all(&self) -> Result<Vec<QueueRecord>> {
        let rows = sqlx::query("SELECT id, pos, item FROM queue ORDER BY pos ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: DownloadId = row.get("id");
            let position: i64 = row.get("pos");
            let item: String = row.get("item");
            match serde_json::from_str::<DownloadSnapshot>(&item) {
                Ok(snapshot) => out.push(QueueRecord {
                    id,
                    position,
                    snapshot,
                }),
                Err(e) => tracing::warn!(id, "skipping unreadable queue row: {e}"),
            }
        }
        Ok(out)
    }

    /// Load a single record by id.
    pub async fn get(&self, id: DownloadId) -> Result<Option<QueueRecord>> {
        let row = sqlx::query("SELECT id, pos, item FROM queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let item: String = row.get("item");
        Ok(Some(QueueRecord {
            id: row.get("id"),
            position: row.get("pos"),
            snapshot: serde_json::from_str(&item)
                .with_context(|| format!("parsing queue row {}", id))?,
        }))
    }
}

/// Current time as Unix seconds.
pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
/// Open an in-memory database for tests (no disk I/O).
pub(crate) async fn open_memory() -> Result<QueueStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let store = QueueStore { pool };
    store.migrate().await?;
    Ok(store)
}
