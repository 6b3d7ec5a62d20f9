use sqlx::PgPool;

use crate::models::file::FileRecord;

/// Get an uploaded file by ID
pub async fn get_file(pool: &PgPool, file_id: i64) -> Result<Option<FileRecord>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, user_id, hash, ext, width, height
        FROM files
        WHERE id = $1
        "#,
    )
    .bind(file_id)
    .fetch_optional(pool)
    .await
}

/// Store decoded dimensions when the upload did not carry them
pub async fn set_dimensions(pool: &PgPool, file_id: i64, width: i32, height: i32) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE files
        SET width = $2, height = $3
        WHERE id = $1 AND (width IS DISTINCT FROM $2 OR height IS DISTINCT FROM $3)
        "#,
    )
    .bind(file_id)
    .bind(width)
    .bind(height)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a resized copy. Re-running a resize job is a no-op.
pub async fn insert_resized(
    pool: &PgPool,
    file_id: i64,
    user_id: i64,
    max_dimension_px: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO files_resized (file_id, user_id, max_dimension_px)
        VALUES ($1, $2, $3)
        ON CONFLICT (file_id, max_dimension_px) DO NOTHING
        "#,
    )
    .bind(file_id)
    .bind(user_id)
    .bind(max_dimension_px)
    .execute(pool)
    .await?;
    Ok(())
}
