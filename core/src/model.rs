//! Core data model: transactions, events, the per-event projection context
//! and the projector's own checkpoint state row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;

/// An event, identified by a stable, `'static` kind string used as the
/// dispatch key in an [`crate::event_map::EventMap`].
///
/// Mirrors `composable_rust_core::event::Event::event_type`.
pub trait DispatchEvent: Send + Sync + 'static {
    /// Stable dispatch key for this event's runtime variant, e.g. `"OrderPlaced.v1"`.
    fn kind(&self) -> &'static str;
}

/// A materialized, keyed projection row.
///
/// `Key` must be stable, hashable and renderable as a storage key. Identity
/// is assigned exactly once, at creation, via [`ProjectionEntity::set_identity`].
pub trait ProjectionEntity:
    Default + Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Key type for this projection.
    type Key: Clone + Eq + Hash + Send + Sync + ToString + 'static;

    /// Name of the backing table/collection this projection lives in.
    const TABLE: &'static str;

    /// Assign identity to a freshly constructed instance. Called exactly
    /// once, before any handler observes the new instance.
    fn set_identity(&mut self, key: &Self::Key);

    /// Render a key as a storage row key. Default: `Key::to_string`.
    fn row_key(key: &Self::Key) -> String {
        key.to_string()
    }
}

/// A single immutable fact carried by a [`Transaction`].
#[derive(Debug, Clone)]
pub struct EventEnvelope<E> {
    /// The event's runtime payload. Its kind is the dispatch key.
    pub body: E,
    /// Per-event metadata headers.
    pub headers: HashMap<String, serde_json::Value>,
}

impl<E> EventEnvelope<E> {
    /// Wrap an event body with empty headers.
    pub fn new(body: E) -> Self {
        Self {
            body,
            headers: HashMap::new(),
        }
    }

    /// Wrap an event body with the given headers.
    #[must_use]
    pub const fn with_headers(body: E, headers: HashMap<String, serde_json::Value>) -> Self {
        Self { body, headers }
    }
}

/// An atomic ordered bundle of events sharing a stream identifier and a
/// monotonically increasing checkpoint.
#[derive(Debug, Clone)]
pub struct Transaction<E> {
    /// Unique transaction identifier.
    pub id: String,
    /// Stream this transaction belongs to.
    pub stream_id: String,
    /// Monotonically increasing position used for checkpointing.
    pub checkpoint: i64,
    /// When this transaction occurred.
    pub timestamp_utc: DateTime<Utc>,
    /// Transaction-level metadata headers.
    pub headers: HashMap<String, serde_json::Value>,
    /// Events carried by this transaction, in projection order.
    pub events: Vec<EventEnvelope<E>>,
}

impl<E> Transaction<E> {
    /// Summarize this transaction without its event payloads, for error
    /// context and policy inspection.
    #[must_use]
    pub fn summarize(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id.clone(),
            stream_id: self.stream_id.clone(),
            checkpoint: self.checkpoint,
            event_count: self.events.len(),
        }
    }
}

/// A lightweight, payload-free description of a [`Transaction`], attached to
/// `ProjectorError::Projection` so an `ExceptionPolicy` can inspect the
/// failing batch without needing the event type to be `Debug`/`Clone`-free of
/// lifetime constraints.
#[derive(Debug, Clone)]
pub struct TransactionSummary {
    /// Transaction identifier.
    pub id: String,
    /// Stream this transaction belongs to.
    pub stream_id: String,
    /// Checkpoint carried by this transaction.
    pub checkpoint: i64,
    /// Number of events this transaction carried.
    pub event_count: usize,
}

/// Context threaded through every handler invocation for a single event.
///
/// `was_handled` is sticky: once set `true` for a transaction it must never
/// be reset back to `false` — see [`ProjectionContext::mark_handled`].
#[derive(Debug, Clone)]
pub struct ProjectionContext {
    /// Transaction this event belongs to.
    pub transaction_id: String,
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Checkpoint of the enclosing transaction.
    pub checkpoint: i64,
    /// Timestamp of the enclosing transaction.
    pub timestamp_utc: DateTime<Utc>,
    /// Transaction-level headers.
    pub transaction_headers: HashMap<String, serde_json::Value>,
    /// This event's own headers.
    pub event_headers: HashMap<String, serde_json::Value>,
    was_handled: bool,
}

impl ProjectionContext {
    /// Build a fresh context for one event, with `was_handled` starting `false`.
    #[must_use]
    pub fn for_event<E>(tx: &Transaction<E>, event: &EventEnvelope<E>) -> Self {
        Self {
            transaction_id: tx.id.clone(),
            stream_id: tx.stream_id.clone(),
            checkpoint: tx.checkpoint,
            timestamp_utc: tx.timestamp_utc,
            transaction_headers: tx.headers.clone(),
            event_headers: event.headers.clone(),
            was_handled: false,
        }
    }

    /// OR a handled observation into the sticky flag. Never resets it.
    pub fn mark_handled(&mut self, handled: bool) {
        self.was_handled |= handled;
    }

    /// Whether any handler matched this event so far.
    #[must_use]
    pub const fn was_handled(&self) -> bool {
        self.was_handled
    }
}

/// This projector's own durable checkpoint row.
///
/// Exactly one row per projector, keyed by `id` (the configured `state_key`).
/// `data` carries user extensions written by `BatchDriverOptions::enrich_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectorState {
    /// Identity under which this projector's state row is stored.
    pub id: String,
    /// Checkpoint of the last transaction folded into a persisted batch.
    pub checkpoint: i64,
    /// When this row was last written.
    pub last_update_utc: DateTime<Utc>,
    /// User extension fields, written by `enrich_state`.
    pub data: serde_json::Value,
}

impl ProjectorState {
    /// Build a new state row for `state_key` at `checkpoint`, with empty
    /// extension data and `last_update_utc` set to `now`.
    #[must_use]
    pub fn new(state_key: impl Into<String>, checkpoint: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: state_key.into(),
            checkpoint,
            last_update_utc: now,
            data: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn was_handled_is_sticky_or() {
        let mut ctx = ProjectionContext {
            transaction_id: "tx-1".into(),
            stream_id: "stream-1".into(),
            checkpoint: 1,
            timestamp_utc: Utc::now(),
            transaction_headers: HashMap::new(),
            event_headers: HashMap::new(),
            was_handled: false,
        };

        ctx.mark_handled(true);
        ctx.mark_handled(false);
        assert!(ctx.was_handled());
    }

    #[test]
    fn summarize_drops_event_payloads() {
        let tx: Transaction<()> = Transaction {
            id: "tx-1".into(),
            stream_id: "stream-1".into(),
            checkpoint: 3,
            timestamp_utc: Utc::now(),
            headers: HashMap::new(),
            events: vec![EventEnvelope::new(()), EventEnvelope::new(())],
        };

        let summary = tx.summarize();
        assert_eq!(summary.checkpoint, 3);
        assert_eq!(summary.event_count, 2);
    }
}
