//! The storage seam (component C4): a transactional session over row-shaped
//! projection data plus this projector's own checkpoint row.
//!
//! Rows are untyped (`serde_json::Value`) at this boundary so the trait stays
//! object-safe and a single session implementation can back every
//! [`crate::model::ProjectionEntity`] a projector touches; [`crate::dispatcher::MapDispatcher`]
//! is the layer that (de)serializes into a concrete `P`.

use crate::error::Result;
use crate::model::ProjectorState;
use std::future::Future;
use std::pin::Pin;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One row-store transaction, opened for the lifetime of a single batch.
///
/// Every method takes `&self` except [`StoreSession::commit`] and
/// [`StoreSession::rollback`], which consume the session: once a batch ends,
/// the session cannot be reused. Implementations are expected to hold their
/// own interior mutability (a connection, a transaction handle) since the
/// trait must remain object-safe for use behind `Box<dyn StoreSession>`.
pub trait StoreSession: Send {
    /// Load a row by table and key. `None` if absent.
    fn load_row<'a>(&'a self, table: &'a str, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>>;

    /// Insert a brand-new row. Callers must guarantee at most one insert per
    /// key per batch (spec's create invariant); a second insert for the same
    /// key is a store-level error, not silently merged.
    fn insert_row<'a>(&'a self, table: &'a str, key: &'a str, data: serde_json::Value) -> BoxFuture<'a, Result<()>>;

    /// Re-attach a previously loaded row after in-memory mutation: load by
    /// key, merge the visible field changes, write back. The closest a
    /// reflection-free store can get to dirty-field tracking.
    fn reattach_row<'a>(&'a self, table: &'a str, key: &'a str, data: serde_json::Value) -> BoxFuture<'a, Result<()>>;

    /// Delete a row by table and key. Deleting an absent row is not an error.
    fn delete_row<'a>(&'a self, table: &'a str, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Load this projector's checkpoint state row, if it has ever been written.
    fn load_state<'a>(&'a self, state_key: &'a str) -> BoxFuture<'a, Result<Option<ProjectorState>>>;

    /// Upsert this projector's checkpoint state row.
    fn save_state<'a>(&'a self, state: ProjectorState) -> BoxFuture<'a, Result<()>>;

    /// Commit everything written through this session as one store transaction.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>>;

    /// Discard everything written through this session.
    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Opens fresh [`StoreSession`]s, one per batch.
pub trait StoreSessionFactory: Send + Sync {
    /// Begin a new store transaction.
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn StoreSession>>>;
}
