//! PostgreSQL-backed [`RecordStore`].

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{RecordStore, StoredRecord};

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            collection: row.try_get("collection")?,
            record_id: row.try_get("record_id")?,
            version: row.try_get("version")?,
            body: row.try_get("body")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Records table in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgRecords {
    pool: PgPool,
}

impl PgRecords {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecords {
    async fn get(&self, collection: &str, record_id: &str) -> Result<Option<StoredRecord>, sqlx::Error> {
        sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT collection, record_id, version, body, updated_at
            FROM records
            WHERE collection = $1 AND record_id = $2
            "#,
        )
        .bind(collection)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>, sqlx::Error> {
        sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT collection, record_id, version, body, updated_at
            FROM records
            WHERE collection = $1
            ORDER BY updated_at, record_id
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
    }

    async fn put(&self, record: &StoredRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO records (collection, record_id, version, body, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (collection, record_id) DO UPDATE SET
                version = EXCLUDED.version,
                body = EXCLUDED.body,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.collection)
        .bind(&record.record_id)
        .bind(record.version)
        .bind(&record.body)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, collection: &str, record_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM records WHERE collection = $1 AND record_id = $2")
            .bind(collection)
            .bind(record_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
