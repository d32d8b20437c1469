//! Runs the bundled `migrations/` directory against an open pool.

use sqlx::SqlitePool;

use crate::error::StoreError;

pub async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))
}
