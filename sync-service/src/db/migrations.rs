//! Schema migrations, embedded from `migrations/` at build time.
//!
//! diesel's harness is synchronous, so it runs on a blocking thread over an
//! `AsyncConnectionWrapper` around a dedicated connection.

use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::{StoreError, StoreResult};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type SyncPgConnection = AsyncConnectionWrapper<AsyncPgConnection>;

/// Apply every pending migration. Returns the versions that were applied.
pub async fn run_migrations(conn: AsyncPgConnection) -> StoreResult<Vec<String>> {
    let mut conn = SyncPgConnection::from(conn);

    let applied = tokio::task::spawn_blocking(move || {
        conn.run_pending_migrations(MIGRATIONS)
            .map(|versions| versions.iter().map(ToString::to_string).collect::<Vec<_>>())
            .map_err(|e| StoreError::Migration(e.to_string()))
    })
    .await
    .map_err(|e| StoreError::Migration(format!("Migration task failed: {}", e)))??;

    if applied.is_empty() {
        tracing::debug!("Schema is up to date");
    } else {
        for version in &applied {
            tracing::info!("Applied migration {}", version);
        }
    }

    Ok(applied)
}

/// Names of migrations embedded in this build but not yet applied
pub async fn pending_migrations(conn: AsyncPgConnection) -> StoreResult<Vec<String>> {
    let mut conn = SyncPgConnection::from(conn);

    tokio::task::spawn_blocking(move || {
        conn.pending_migrations(MIGRATIONS)
            .map(|pending| {
                pending
                    .iter()
                    .map(|m| m.name().to_string())
                    .collect()
            })
            .map_err(|e| StoreError::Migration(e.to_string()))
    })
    .await
    .map_err(|e| StoreError::Migration(format!("Migration task failed: {}", e)))?
}
