use projector_core::{ProjectorError, ProjectorState, Result, StoreSession, StoreSessionFactory};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::Mutex;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

fn pg_err(cause: sqlx::Error) -> ProjectorError {
    ProjectorError::wrap_other("projector-postgres", "unknown", cause)
}

/// Opens one `sqlx` transaction per batch against a shared [`PgPool`].
#[derive(Clone)]
pub struct PgStoreSessionFactory {
    pool: PgPool,
}

impl PgStoreSessionFactory {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for migrations or ad hoc queries.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl StoreSessionFactory for PgStoreSessionFactory {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn StoreSession>>> {
        Box::pin(async move {
            let tx = self.pool.begin().await.map_err(pg_err)?;
            Ok(Box::new(PgStoreSession {
                tx: Mutex::new(Some(tx)),
            }) as Box<dyn StoreSession>)
        })
    }
}

/// One batch's `sqlx` transaction.
///
/// Table names come straight from [`projector_core::ProjectionEntity::TABLE`]
/// and are interpolated into the query text (`sqlx` has no bind parameter for
/// identifiers); the same pattern `projector-core`'s teacher uses for its own
/// per-projection table names. Callers own picking safe, non-user-controlled
/// table names.
pub struct PgStoreSession {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl StoreSession for PgStoreSession {
    fn load_row<'a>(&'a self, table: &'a str, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>> {
        Box::pin(async move {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(session_closed)?;
            let query = format!("SELECT data FROM {table} WHERE key = $1");
            let row = sqlx::query(&query)
                .bind(key)
                .fetch_optional(tx.as_mut())
                .await
                .map_err(pg_err)?;
            Ok(row.map(|r| r.get::<serde_json::Value, _>("data")))
        })
    }

    fn insert_row<'a>(&'a self, table: &'a str, key: &'a str, data: serde_json::Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(session_closed)?;
            let query = format!("INSERT INTO {table} (key, data, updated_at) VALUES ($1, $2, now())");
            sqlx::query(&query)
                .bind(key)
                .bind(data)
                .execute(tx.as_mut())
                .await
                .map_err(pg_err)?;
            Ok(())
        })
    }

    fn reattach_row<'a>(&'a self, table: &'a str, key: &'a str, data: serde_json::Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(session_closed)?;
            let query = format!(
                "INSERT INTO {table} (key, data, updated_at) VALUES ($1, $2, now())
                 ON CONFLICT (key) DO UPDATE SET data = EXCLUDED.data, updated_at = now()"
            );
            sqlx::query(&query)
                .bind(key)
                .bind(data)
                .execute(tx.as_mut())
                .await
                .map_err(pg_err)?;
            Ok(())
        })
    }

    fn delete_row<'a>(&'a self, table: &'a str, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(session_closed)?;
            let query = format!("DELETE FROM {table} WHERE key = $1");
            sqlx::query(&query).bind(key).execute(tx.as_mut()).await.map_err(pg_err)?;
            Ok(())
        })
    }

    fn load_state<'a>(&'a self, state_key: &'a str) -> BoxFuture<'a, Result<Option<ProjectorState>>> {
        Box::pin(async move {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(session_closed)?;
            let row = sqlx::query(
                "SELECT id, checkpoint, last_update_utc, data FROM projector_state WHERE id = $1",
            )
            .bind(state_key)
            .fetch_optional(tx.as_mut())
            .await
            .map_err(pg_err)?;

            Ok(row.map(|r| ProjectorState {
                id: r.get("id"),
                checkpoint: r.get("checkpoint"),
                last_update_utc: r.get("last_update_utc"),
                data: r.get("data"),
            }))
        })
    }

    fn save_state<'a>(&'a self, state: ProjectorState) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(session_closed)?;
            sqlx::query(
                "INSERT INTO projector_state (id, checkpoint, last_update_utc, data)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE
                 SET checkpoint = EXCLUDED.checkpoint,
                     last_update_utc = EXCLUDED.last_update_utc,
                     data = EXCLUDED.data",
            )
            .bind(state.id)
            .bind(state.checkpoint)
            .bind(state.last_update_utc)
            .bind(state.data)
            .execute(tx.as_mut())
            .await
            .map_err(pg_err)?;
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let tx = self.tx.into_inner().ok_or_else(session_closed)?;
            tx.commit().await.map_err(pg_err)
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let tx = self.tx.into_inner().ok_or_else(session_closed)?;
            tx.rollback().await.map_err(pg_err)
        })
    }
}

fn session_closed() -> ProjectorError {
    ProjectorError::Configuration("store session already committed or rolled back".to_string())
}
