//! SQLite storage via `sqlx`.
//!
//! Every collection shares one `documents` table keyed by
//! `(collection, id)`; the body is the record's JSON text. Secondary indexes
//! are SQLite expression indexes over `json_extract(body, '$.<field>')`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::{StorageBackend, WriteBatch, WriteOp, SYSTEM_INDEXES};
use crate::error::{Error, Result};
use crate::schema::Schema;

/// On-device document storage backed by a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a database file and bring its tables up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| Error::Storage(format!("cannot create {}: {err}", parent.display())))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        tracing::info!(path = %path.display(), "opened sqlite storage");
        Self::migrate(pool).await
    }

    /// Private in-memory database, gone when the storage is closed.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // One connection that never idles out: every new connection to
        // `:memory:` is a different, empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_index(&self, collection: &str, field: &str) -> Result<()> {
        let name = index_name(collection, field);
        let statement = format!(
            r#"CREATE INDEX IF NOT EXISTS "{name}"
               ON documents (collection, json_extract(body, '$.{field}'))"#
        );
        sqlx::query(&statement).execute(&self.pool).await?;
        Ok(())
    }
}

/// Index name for a `(collection, field)` pair. The length prefix keeps
/// `("a_b", "c")` and `("a", "b_c")` apart.
fn index_name(collection: &str, field: &str) -> String {
    format!("idx_{}_{collection}_{field}", collection.len())
}

fn parse_body(body: &str) -> Result<Value> {
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn prepare(&self, schema: &Schema) -> Result<()> {
        for (collection, field) in SYSTEM_INDEXES {
            self.create_index(collection, field).await?;
        }
        for collection in schema.collections.values() {
            for field in &collection.indexes {
                self.create_index(&collection.name, field).await?;
            }
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| parse_body(row.try_get::<&str, _>("body")?))
            .transpose()
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        let rows = sqlx::query("SELECT body FROM documents WHERE collection = ? ORDER BY rowid")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| parse_body(row.try_get::<&str, _>("body")?))
            .collect()
    }

    async fn scan_index(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Value>> {
        if !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || field.is_empty() {
            return Err(Error::InvalidSchema(format!("'{field}' is not a valid index field")));
        }
        let statement = format!(
            "SELECT body FROM documents \
             WHERE collection = ? AND json_extract(body, '$.{field}') = ? \
             ORDER BY rowid"
        );
        let query = sqlx::query(&statement).bind(collection);

        // json_extract yields SQL scalars: booleans as 0/1, containers as JSON text.
        let query = match value {
            Value::Null => return Ok(Vec::new()),
            Value::Bool(b) => query.bind(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| parse_body(row.try_get::<&str, _>("body")?))
            .collect()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    collection,
                    id,
                    value,
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (collection, id, body)
                        VALUES (?, ?, ?)
                        ON CONFLICT (collection, id) DO UPDATE SET body = excluded.body
                        "#,
                    )
                    .bind(collection)
                    .bind(id)
                    .bind(serde_json::to_string(&value)?)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::Delete { collection, id } => {
                    sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                        .bind(collection)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
