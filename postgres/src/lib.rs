//! # Projector Postgres
//!
//! A [`projector_core::StoreSession`]/[`projector_core::StoreSessionFactory`]
//! pair backed by a `PostgreSQL` connection pool, using one `sqlx`
//! transaction per batch.
//!
//! Projection rows live in whatever table a given
//! [`projector_core::ProjectionEntity::TABLE`] names (`key TEXT PRIMARY KEY,
//! data JSONB NOT NULL, updated_at TIMESTAMPTZ NOT NULL`, created by the
//! application's own migrations); this crate's own migration only creates
//! `projector_state`, the checkpoint row shared by every projector.

mod store;

pub use store::{PgStoreSession, PgStoreSessionFactory};

/// Run this crate's own migrations (currently: `projector_state`).
///
/// # Errors
///
/// Returns a [`projector_core::ProjectorError`] if migration fails.
pub async fn migrate(pool: &sqlx::PgPool) -> projector_core::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| projector_core::ProjectorError::wrap_other("projector-postgres", "migrate", e))
}
