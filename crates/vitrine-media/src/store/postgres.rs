//! PostgreSQL-backed ledger store.
//!
//! Production implementation of [`LedgerStore`] over sqlx. Reorder and
//! delete run as `SERIALIZABLE` transactions; the `(model_id, sort_order)`
//! uniqueness constraint is `DEFERRABLE INITIALLY DEFERRED` so the ranged
//! shift updates may transiently duplicate positions inside a transaction.
//! Serialization failures (SQLSTATE 40001) surface as
//! [`MediaError::TransactionConflict`] and the caller retries the whole
//! operation.
//!
//! The insert-next path does NOT rely on isolation: two concurrent
//! transactions can both read the same `MAX(sort_order)` before either
//! commits, which is exactly the race the upload coordinator's per-model
//! distributed lock exists to close.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use vitrine_core::{Error as CoreError, ImageId, ModelId, RenditionId};

use crate::error::{MediaError, Result};
use crate::ledger::{plan, LedgerStore};
use crate::types::{Attachment, ImageMime, ImageRecord, ImageWithRenditions, RenditionRecord};

/// Embedded relational schema.
const SCHEMA: &str = include_str!("schema.sql");

/// SQLSTATE for serialization failures under `SERIALIZABLE`.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE for unique constraint violations.
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

/// Splits the embedded schema into executable statements.
fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Maps a sqlx error to the pipeline taxonomy.
fn map_sqlx(e: sqlx::Error) -> MediaError {
    if let sqlx::Error::Database(ref db) = e {
        match db.code().as_deref() {
            Some(SQLSTATE_SERIALIZATION_FAILURE) => {
                return MediaError::conflict(db.message().to_string());
            }
            Some(SQLSTATE_UNIQUE_VIOLATION) => {
                return MediaError::Core(CoreError::PreconditionFailed {
                    message: db.message().to_string(),
                });
            }
            _ => {}
        }
    }
    MediaError::Core(CoreError::storage_with_source("postgres query failed", e))
}

/// PostgreSQL implementation of [`LedgerStore`].
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Connects to the database and applies the embedded schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a schema statement fails.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(map_sqlx)?;

        let ledger = Self { pool };
        ledger.apply_schema().await?;
        Ok(ledger)
    }

    /// Wraps an existing pool (the schema is assumed to be applied).
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded schema, statement by statement.
    ///
    /// # Errors
    ///
    /// Returns an error if a schema statement fails.
    pub async fn apply_schema(&self) -> Result<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn begin_serializable(&self) -> Result<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        Ok(tx)
    }
}

fn image_from_row(row: &PgRow) -> Result<ImageRecord> {
    let id: String = row.try_get("id").map_err(map_sqlx)?;
    let mime: String = row.try_get("mime_type").map_err(map_sqlx)?;
    let size: i64 = row.try_get("size").map_err(map_sqlx)?;
    let width: i32 = row.try_get("width").map_err(map_sqlx)?;
    let height: i32 = row.try_get("height").map_err(map_sqlx)?;

    Ok(ImageRecord {
        id: ImageId::from_str(&id)?,
        original_filename: row.try_get("original_filename").map_err(map_sqlx)?,
        mime: mime.parse::<ImageMime>()?,
        size: u64::try_from(size).unwrap_or_default(),
        width: u32::try_from(width).unwrap_or_default(),
        height: u32::try_from(height).unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn rendition_from_row(row: &PgRow) -> Result<RenditionRecord> {
    let id: String = row.try_get("id").map_err(map_sqlx)?;
    let image_id: String = row.try_get("image_id").map_err(map_sqlx)?;
    let mime: String = row.try_get("mime_type").map_err(map_sqlx)?;
    let size: i64 = row.try_get("size").map_err(map_sqlx)?;
    let width: i32 = row.try_get("width").map_err(map_sqlx)?;
    let height: i32 = row.try_get("height").map_err(map_sqlx)?;

    Ok(RenditionRecord {
        id: RenditionId::from_str(&id)?,
        image_id: ImageId::from_str(&image_id)?,
        mime: mime.parse()?,
        size: u64::try_from(size).unwrap_or_default(),
        width: u32::try_from(width).unwrap_or_default(),
        height: u32::try_from(height).unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn insert_original(&self, model_id: &ModelId, image: ImageRecord) -> Result<u32> {
        // Plain transaction: the caller holds the model's ordering lock,
        // which is what makes read-max-then-insert safe.
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(sort_order), 0) AS max_order \
             FROM model_images WHERE model_id = $1",
        )
        .bind(model_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        let max_order: i32 = row.try_get("max_order").map_err(map_sqlx)?;
        let next = max_order + 1;

        sqlx::query(
            "INSERT INTO images \
             (id, original_filename, mime_type, size, width, height, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(image.id.to_string())
        .bind(&image.original_filename)
        .bind(image.mime.as_str())
        .bind(i64::try_from(image.size).unwrap_or(i64::MAX))
        .bind(i32::try_from(image.width).unwrap_or(i32::MAX))
        .bind(i32::try_from(image.height).unwrap_or(i32::MAX))
        .bind(image.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query(
            "INSERT INTO model_images (model_id, image_id, sort_order) VALUES ($1, $2, $3)",
        )
        .bind(model_id.as_str())
        .bind(image.id.to_string())
        .bind(next)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(u32::try_from(next).unwrap_or_default())
    }

    async fn insert_renditions(
        &self,
        image_id: ImageId,
        renditions: Vec<RenditionRecord>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let parent = sqlx::query("SELECT 1 AS one FROM images WHERE id = $1")
            .bind(image_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        if parent.is_none() {
            return Err(MediaError::ImageNotFound { image_id });
        }

        let mut inserted = 0;
        for rendition in renditions {
            let result = sqlx::query(
                "INSERT INTO images_optimized \
                 (id, image_id, mime_type, size, width, height, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT ON CONSTRAINT images_optimized_cell_key DO NOTHING",
            )
            .bind(rendition.id.to_string())
            .bind(rendition.image_id.to_string())
            .bind(rendition.mime.as_str())
            .bind(i64::try_from(rendition.size).unwrap_or(i64::MAX))
            .bind(i32::try_from(rendition.width).unwrap_or(i32::MAX))
            .bind(i32::try_from(rendition.height).unwrap_or(i32::MAX))
            .bind(rendition.created_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            inserted += usize::try_from(result.rows_affected()).unwrap_or_default();
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(inserted)
    }

    async fn reorder(
        &self,
        model_id: &ModelId,
        image_id: ImageId,
        new_sort_order: u32,
    ) -> Result<()> {
        let mut tx = self.begin_serializable().await?;

        let current_row = sqlx::query(
            "SELECT sort_order FROM model_images WHERE model_id = $1 AND image_id = $2",
        )
        .bind(model_id.as_str())
        .bind(image_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        let Some(current_row) = current_row else {
            return Err(MediaError::ImageNotFound { image_id });
        };
        let current: i32 = current_row.try_get("sort_order").map_err(map_sqlx)?;
        let current = u32::try_from(current).unwrap_or_default();

        let count_row =
            sqlx::query("SELECT COUNT(*) AS count FROM model_images WHERE model_id = $1")
                .bind(model_id.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        let len: i64 = count_row.try_get("count").map_err(map_sqlx)?;
        let len = u32::try_from(len).unwrap_or_default();

        if new_sort_order < 1 || new_sort_order > len {
            return Err(MediaError::OrderOutOfRange {
                requested: new_sort_order,
                len,
            });
        }

        if let Some(window) = plan::reorder_window(current, new_sort_order) {
            // Bulk shift transiently duplicates positions; the deferred
            // constraint checks at commit, after the placement below.
            sqlx::query(
                "UPDATE model_images SET sort_order = sort_order + $1 \
                 WHERE model_id = $2 AND image_id <> $3 \
                 AND sort_order BETWEEN $4 AND $5",
            )
            .bind(window.delta)
            .bind(model_id.as_str())
            .bind(image_id.to_string())
            .bind(i32::try_from(window.lo).unwrap_or_default())
            .bind(i32::try_from(window.hi).unwrap_or_default())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            sqlx::query(
                "UPDATE model_images SET sort_order = $1 \
                 WHERE model_id = $2 AND image_id = $3",
            )
            .bind(i32::try_from(new_sort_order).unwrap_or_default())
            .bind(model_id.as_str())
            .bind(image_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_image(&self, model_id: &ModelId, image_id: ImageId) -> Result<ImageRecord> {
        let mut tx = self.begin_serializable().await?;

        let row = sqlx::query(
            "SELECT i.id, i.original_filename, i.mime_type, i.size, i.width, i.height, \
                    i.created_at, mi.sort_order \
             FROM images i JOIN model_images mi ON mi.image_id = i.id \
             WHERE mi.model_id = $1 AND i.id = $2",
        )
        .bind(model_id.as_str())
        .bind(image_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Err(MediaError::ImageNotFound { image_id });
        };
        let record = image_from_row(&row)?;
        let removed_order: i32 = row.try_get("sort_order").map_err(map_sqlx)?;

        // Deleting the image row cascades to its attachment and renditions.
        sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(image_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        sqlx::query(
            "UPDATE model_images SET sort_order = sort_order - 1 \
             WHERE model_id = $1 AND sort_order > $2",
        )
        .bind(model_id.as_str())
        .bind(removed_order)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(record)
    }

    async fn attachments(&self, model_id: &ModelId) -> Result<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT image_id, sort_order FROM model_images \
             WHERE model_id = $1 ORDER BY sort_order",
        )
        .bind(model_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                let image_id: String = row.try_get("image_id").map_err(map_sqlx)?;
                let sort_order: i32 = row.try_get("sort_order").map_err(map_sqlx)?;
                Ok(Attachment {
                    image_id: ImageId::from_str(&image_id)?,
                    sort_order: u32::try_from(sort_order).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn image(&self, image_id: ImageId) -> Result<Option<ImageRecord>> {
        let row = sqlx::query(
            "SELECT id, original_filename, mime_type, size, width, height, created_at \
             FROM images WHERE id = $1",
        )
        .bind(image_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(image_from_row).transpose()
    }

    async fn renditions(&self, image_id: ImageId) -> Result<Vec<RenditionRecord>> {
        let rows = sqlx::query(
            "SELECT id, image_id, mime_type, size, width, height, created_at \
             FROM images_optimized WHERE image_id = $1 \
             ORDER BY mime_type, width",
        )
        .bind(image_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(rendition_from_row).collect()
    }

    async fn model_images(&self, model_id: &ModelId) -> Result<Vec<ImageWithRenditions>> {
        let rows = sqlx::query(
            "SELECT i.id, i.original_filename, i.mime_type, i.size, i.width, i.height, \
                    i.created_at, mi.sort_order \
             FROM images i JOIN model_images mi ON mi.image_id = i.id \
             WHERE mi.model_id = $1 ORDER BY mi.sort_order",
        )
        .bind(model_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let image = image_from_row(row)?;
            let sort_order: i32 = row.try_get("sort_order").map_err(map_sqlx)?;
            let renditions = self.renditions(image.id).await?;
            result.push(ImageWithRenditions {
                image,
                sort_order: u32::try_from(sort_order).unwrap_or_default(),
                renditions,
            });
        }
        Ok(result)
    }

    async fn all_images(&self) -> Result<Vec<(ModelId, ImageRecord)>> {
        let rows = sqlx::query(
            "SELECT mi.model_id, i.id, i.original_filename, i.mime_type, i.size, \
                    i.width, i.height, i.created_at \
             FROM images i JOIN model_images mi ON mi.image_id = i.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                let model_id: String = row.try_get("model_id").map_err(map_sqlx)?;
                Ok((ModelId::new(model_id)?, image_from_row(row)?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_statements() {
        let statements = schema_statements(SCHEMA);
        assert!(statements.len() >= 5);
        assert!(statements
            .iter()
            .any(|s| s.contains("DEFERRABLE INITIALLY DEFERRED")));
        assert!(statements
            .iter()
            .any(|s| s.contains("images_optimized_cell_key")));
    }

    #[test]
    fn comment_only_fragments_are_skipped() {
        let statements = schema_statements("-- just a comment\n;\nCREATE TABLE t (id TEXT);");
        assert_eq!(statements.len(), 1);
        assert!(statements[0].starts_with("CREATE TABLE"));
    }
}
