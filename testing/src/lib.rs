//! # Projector Testing
//!
//! In-memory `StoreSession`/`StoreSessionFactory` and canned
//! `ExceptionPolicy` fixtures for exercising `projector-core` projections
//! without a real database.
//!
//! - [`InMemoryStoreSessionFactory`]: a `HashMap`-based row store with real
//!   commit/rollback semantics (writes are invisible to other sessions until
//!   committed) and call counters for asserting the at-most-one-insert and
//!   cache-cleared-on-abort invariants.
//! - [`ScriptedPolicy`]: replays a fixed sequence of `Resolution`s, falling
//!   back to `Abort` once exhausted.

#![allow(clippy::unwrap_used)] // test infrastructure uses unwrap for simplicity

use projector_core::{ExceptionPolicy, ProjectorError, ProjectorState, Resolution, Result, StoreSession, StoreSessionFactory};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
#[error("row already exists for table '{table}' key '{key}'")]
struct DuplicateInsert {
    table: String,
    key: String,
}

fn row_id(table: &str, key: &str) -> String {
    format!("{table}:{key}")
}

/// Shared, committed state behind every session a factory opens.
#[derive(Default)]
struct Shared {
    rows: HashMap<String, serde_json::Value>,
    state: HashMap<String, ProjectorState>,
}

/// An in-memory `StoreSessionFactory` with real commit/rollback isolation.
///
/// Clone and share this across a test's `BatchDriver` and assertions; its
/// counters and row snapshots are reachable after the driver finishes.
#[derive(Clone)]
pub struct InMemoryStoreSessionFactory {
    shared: Arc<RwLock<Shared>>,
    insert_calls: Arc<AtomicU32>,
    reattach_calls: Arc<AtomicU32>,
}

impl InMemoryStoreSessionFactory {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RwLock::new(Shared::default())),
            insert_calls: Arc::new(AtomicU32::new(0)),
            reattach_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Number of committed `insert_row` calls across every session so far.
    #[must_use]
    pub fn insert_count(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Number of committed `reattach_row` calls across every session so far.
    #[must_use]
    pub fn reattach_count(&self) -> u32 {
        self.reattach_calls.load(Ordering::SeqCst)
    }

    /// Snapshot a committed row, if present.
    #[must_use]
    pub fn row(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        self.shared.read().unwrap().rows.get(&row_id(table, key)).cloned()
    }

    /// Number of committed rows across every table.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.shared.read().unwrap().rows.len()
    }

    /// Snapshot the committed checkpoint state row, if present.
    #[must_use]
    pub fn state(&self, state_key: &str) -> Option<ProjectorState> {
        self.shared.read().unwrap().state.get(state_key).cloned()
    }

    /// Pre-seed a committed checkpoint row, bypassing a session entirely.
    /// For tests that need a projector to start from a known checkpoint
    /// without driving the transactions that would have produced it.
    pub fn seed_state(&self, state: ProjectorState) {
        self.shared.write().unwrap().state.insert(state.id.clone(), state);
    }
}

impl Default for InMemoryStoreSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreSessionFactory for InMemoryStoreSessionFactory {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn StoreSession>>> {
        let session = InMemoryStoreSession {
            shared: self.shared.clone(),
            pending_rows: Mutex::new(HashMap::new()),
            pending_state: Mutex::new(None),
            insert_calls: self.insert_calls.clone(),
            reattach_calls: self.reattach_calls.clone(),
        };
        Box::pin(async move { Ok(Box::new(session) as Box<dyn StoreSession>) })
    }
}

/// A pending write: `Some` upserts, `None` marks the row deleted.
type PendingRow = Option<serde_json::Value>;

struct InMemoryStoreSession {
    shared: Arc<RwLock<Shared>>,
    pending_rows: Mutex<HashMap<String, PendingRow>>,
    pending_state: Mutex<Option<ProjectorState>>,
    insert_calls: Arc<AtomicU32>,
    reattach_calls: Arc<AtomicU32>,
}

impl StoreSession for InMemoryStoreSession {
    fn load_row<'a>(&'a self, table: &'a str, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>> {
        let id = row_id(table, key);
        Box::pin(async move {
            if let Some(pending) = self.pending_rows.lock().unwrap().get(&id) {
                return Ok(pending.clone());
            }
            Ok(self.shared.read().unwrap().rows.get(&id).cloned())
        })
    }

    fn insert_row<'a>(&'a self, table: &'a str, key: &'a str, data: serde_json::Value) -> BoxFuture<'a, Result<()>> {
        let id = row_id(table, key);
        let table = table.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let exists = self
                .pending_rows
                .lock()
                .unwrap()
                .get(&id)
                .map(Option::is_some)
                .unwrap_or_else(|| self.shared.read().unwrap().rows.contains_key(&id));
            if exists {
                return Err(ProjectorError::wrap_other(
                    "projector-testing",
                    "unknown",
                    DuplicateInsert { table, key },
                ));
            }
            self.insert_calls.fetch_add(1, Ordering::SeqCst);
            self.pending_rows.lock().unwrap().insert(id, Some(data));
            Ok(())
        })
    }

    fn reattach_row<'a>(&'a self, table: &'a str, key: &'a str, data: serde_json::Value) -> BoxFuture<'a, Result<()>> {
        let id = row_id(table, key);
        Box::pin(async move {
            self.reattach_calls.fetch_add(1, Ordering::SeqCst);
            self.pending_rows.lock().unwrap().insert(id, Some(data));
            Ok(())
        })
    }

    fn delete_row<'a>(&'a self, table: &'a str, key: &'a str) -> BoxFuture<'a, Result<()>> {
        let id = row_id(table, key);
        Box::pin(async move {
            self.pending_rows.lock().unwrap().insert(id, None);
            Ok(())
        })
    }

    fn load_state<'a>(&'a self, state_key: &'a str) -> BoxFuture<'a, Result<Option<ProjectorState>>> {
        Box::pin(async move {
            if let Some(pending) = self.pending_state.lock().unwrap().clone() {
                return Ok(Some(pending));
            }
            Ok(self.shared.read().unwrap().state.get(state_key).cloned())
        })
    }

    fn save_state<'a>(&'a self, state: ProjectorState) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            *self.pending_state.lock().unwrap() = Some(state);
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let mut shared = self.shared.write().unwrap();
            for (id, pending) in self.pending_rows.into_inner().unwrap() {
                match pending {
                    Some(value) => {
                        shared.rows.insert(id, value);
                    }
                    None => {
                        shared.rows.remove(&id);
                    }
                }
            }
            if let Some(state) = self.pending_state.into_inner().unwrap() {
                shared.state.insert(state.id.clone(), state);
            }
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Replays a fixed sequence of [`Resolution`]s, one per call, falling back
/// to `Abort` once the script is exhausted.
pub struct ScriptedPolicy {
    remaining: Mutex<Vec<Resolution>>,
}

impl ScriptedPolicy {
    /// Build a policy that returns `script[0]` on the first failure,
    /// `script[1]` on the second, and so on.
    #[must_use]
    pub fn new(script: Vec<Resolution>) -> Self {
        let mut remaining = script;
        remaining.reverse();
        Self {
            remaining: Mutex::new(remaining),
        }
    }
}

impl ExceptionPolicy for ScriptedPolicy {
    fn resolve(&self, _error: &ProjectorError) -> Resolution {
        self.remaining
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(Resolution::Abort)
    }
}
