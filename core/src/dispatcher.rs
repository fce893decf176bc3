//! Dispatches a single event through an [`EventMap`], a projection cache and
//! a [`StoreSession`] (components C1–C4 wired together), running any
//! registered child projectors first.

use crate::cache::ProjectionCache;
use crate::error::{ProjectorError, Result};
use crate::event_map::{Action, EventMap};
use crate::model::{DispatchEvent, ProjectionContext, ProjectionEntity};
use crate::store::StoreSession;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A projector nested inside another, sharing the parent's event stream and
/// store transaction. Always runs to completion before the parent handles
/// the same event, per the ordering invariant in spec §4.
pub trait ChildDispatch<E>: Send + Sync {
    /// This child's identity, used to tag any error it raises.
    fn name(&self) -> &str;

    /// Project one event through this child.
    fn project<'a>(
        &'a self,
        transaction_id: &'a str,
        ctx: &'a mut ProjectionContext,
        event: &'a E,
        store: &'a dyn StoreSession,
    ) -> BoxFuture<'a, Result<()>>;

    /// Invalidate this child's own cache (and any of its own children's).
    /// Called whenever the enclosing batch aborts.
    fn clear_cache(&self);
}

/// Routes events of type `E` into rows of projection type `P`.
pub struct MapDispatcher<E, P: ProjectionEntity> {
    name: String,
    map: EventMap<E, P>,
    cache: Arc<dyn ProjectionCache<P>>,
    children: Vec<Arc<dyn ChildDispatch<E>>>,
    filter: crate::event_map::FilterFn<P>,
}

impl<E: DispatchEvent, P: ProjectionEntity> MapDispatcher<E, P> {
    /// Build a dispatcher with no children and an accept-all filter, named
    /// for error tagging.
    pub fn new(name: impl Into<String>, map: EventMap<E, P>, cache: Arc<dyn ProjectionCache<P>>) -> Self {
        Self {
            name: name.into(),
            map,
            cache,
            children: Vec::new(),
            filter: Arc::new(|_: &P| true),
        }
    }

    /// Register a child projector. Children run in registration order,
    /// before this dispatcher handles the event itself.
    #[must_use]
    pub fn with_child(mut self, child: Arc<dyn ChildDispatch<E>>) -> Self {
        self.children.push(child);
        self
    }

    /// Replace the accept-all default with a predicate that gates whether an
    /// already-existing row is visible to create/update handling at all (spec
    /// §8 property 2: a filtered-out row sees no mutation after commit).
    #[must_use]
    pub fn with_filter(mut self, filter: impl Fn(&P) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// This dispatcher's name, used both for error tagging and as the
    /// identity under which a parent driver reports it as a child.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invalidate this dispatcher's cache and every registered child's.
    /// A [`crate::batch::BatchDriver`] calls this on any batch abort.
    pub fn clear_cache(&self) {
        self.cache.clear();
        for child in &self.children {
            child.clear_cache();
        }
    }

    /// Project one event: run every child, then route and apply the action
    /// registered for the event's kind, if any.
    pub async fn dispatch(
        &self,
        transaction_id: &str,
        ctx: &mut ProjectionContext,
        event: &E,
        store: &dyn StoreSession,
    ) -> Result<()> {
        for child in &self.children {
            child
                .project(transaction_id, ctx, event, store)
                .await
                .map_err(|err| err.tag_child(child.name()))?;
        }

        let Some(action) = self.map.route(event) else {
            return Ok(());
        };

        match action {
            Action::Create {
                key_fn,
                init,
                should_overwrite,
            } => {
                self.apply_create(transaction_id, ctx, event, store, key_fn, init, should_overwrite)
                    .await
            }
            Action::Update {
                key_fn,
                mutate,
                create_if_missing,
            } => {
                self.apply_update(transaction_id, ctx, event, store, key_fn, mutate, create_if_missing)
                    .await
            }
            Action::Delete { key_fn } => self.apply_delete(transaction_id, ctx, event, store, key_fn).await,
            Action::Custom(handler) => handler(ctx, event, store)
                .await
                .map(|()| ctx.mark_handled(true))
                .map_err(|err| err.contextualize(&self.name, transaction_id, None)),
        }
    }

    async fn apply_create(
        &self,
        transaction_id: &str,
        ctx: &mut ProjectionContext,
        event: &E,
        store: &dyn StoreSession,
        key_fn: &crate::event_map::KeyFn<E, P>,
        init: &crate::event_map::MutateFn<E, P>,
        should_overwrite: &crate::event_map::OverwriteFn<P>,
    ) -> Result<()> {
        let key = key_fn(event);
        let key_for_loader = key.clone();
        let table = P::TABLE;
        let existing = self
            .cache
            .get_or_load(
                &key,
                Box::new(move || {
                    Box::pin(async move {
                        let row_key = P::row_key(&key_for_loader);
                        let row = store.load_row(table, &row_key).await.ok().flatten()?;
                        serde_json::from_value(row).ok()
                    })
                }),
            )
            .await;

        match existing {
            None => {
                let mut value = P::default();
                value.set_identity(&key);
                init(ctx, event, &mut value);
                ctx.mark_handled(true);

                let row_key = P::row_key(&key);
                let data = serde_json::to_value(&value)
                    .map_err(|e| ProjectorError::wrap_other(self.name.as_str(), transaction_id, e))?;
                store
                    .insert_row(P::TABLE, &row_key, data)
                    .await
                    .map_err(|e| e.contextualize(&self.name, transaction_id, None))?;
                self.cache.put(&key, value);
            }
            Some(mut value) => {
                if !(self.filter)(&value) || !should_overwrite(&value) {
                    return Ok(());
                }
                init(ctx, event, &mut value);
                ctx.mark_handled(true);

                let row_key = P::row_key(&key);
                let data = serde_json::to_value(&value)
                    .map_err(|e| ProjectorError::wrap_other(self.name.as_str(), transaction_id, e))?;
                store
                    .reattach_row(P::TABLE, &row_key, data)
                    .await
                    .map_err(|e| e.contextualize(&self.name, transaction_id, None))?;
                self.cache.put(&key, value);
            }
        }
        Ok(())
    }

    async fn apply_update(
        &self,
        transaction_id: &str,
        ctx: &mut ProjectionContext,
        event: &E,
        store: &dyn StoreSession,
        key_fn: &crate::event_map::KeyFn<E, P>,
        mutate: &crate::event_map::MutateFn<E, P>,
        create_if_missing: &crate::event_map::CreateIfMissingFn,
    ) -> Result<()> {
        let key = key_fn(event);
        let key_for_loader = key.clone();
        let table = P::TABLE;
        let loaded = self
            .cache
            .get_or_load(
                &key,
                Box::new(move || {
                    Box::pin(async move {
                        let row_key = P::row_key(&key_for_loader);
                        let row = store.load_row(table, &row_key).await.ok().flatten()?;
                        serde_json::from_value(row).ok()
                    })
                }),
            )
            .await;

        let (mut value, is_new) = match loaded {
            None => {
                if !create_if_missing() {
                    // An update against a nonexistent row is a no-op, not a
                    // failure, so a late or out-of-order event can't wedge
                    // the batch.
                    return Ok(());
                }
                let mut value = P::default();
                value.set_identity(&key);
                (value, true)
            }
            Some(value) => {
                if !(self.filter)(&value) {
                    return Ok(());
                }
                (value, false)
            }
        };

        mutate(ctx, event, &mut value);
        ctx.mark_handled(true);

        let row_key = P::row_key(&key);
        let data = serde_json::to_value(&value)
            .map_err(|e| ProjectorError::wrap_other(self.name.as_str(), transaction_id, e))?;
        let write = if is_new {
            store.insert_row(P::TABLE, &row_key, data)
        } else {
            store.reattach_row(P::TABLE, &row_key, data)
        };
        write
            .await
            .map_err(|e| e.contextualize(&self.name, transaction_id, None))?;
        self.cache.put(&key, value);
        Ok(())
    }

    async fn apply_delete(
        &self,
        transaction_id: &str,
        ctx: &mut ProjectionContext,
        event: &E,
        store: &dyn StoreSession,
        key_fn: &crate::event_map::KeyFn<E, P>,
    ) -> Result<()> {
        let key = key_fn(event);
        let row_key = P::row_key(&key);
        store
            .delete_row(P::TABLE, &row_key)
            .await
            .map_err(|e| e.contextualize(&self.name, transaction_id, None))?;
        self.cache.remove(&key);
        ctx.mark_handled(true);
        Ok(())
    }
}

impl<E: DispatchEvent, P: ProjectionEntity> ChildDispatch<E> for MapDispatcher<E, P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn project<'a>(
        &'a self,
        transaction_id: &'a str,
        ctx: &'a mut ProjectionContext,
        event: &'a E,
        store: &'a dyn StoreSession,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.dispatch(transaction_id, ctx, event, store))
    }

    fn clear_cache(&self) {
        Self::clear_cache(self);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::event_map::MapBuilder;
    use crate::model::Transaction;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    enum Ev {
        Created { id: String, name: String },
        Renamed { id: String, name: String },
        Removed { id: String },
    }

    impl DispatchEvent for Ev {
        fn kind(&self) -> &'static str {
            match self {
                Self::Created { .. } => "Created",
                Self::Renamed { .. } => "Renamed",
                Self::Removed { .. } => "Removed",
            }
        }
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct Widget {
        id: String,
        name: String,
    }

    impl ProjectionEntity for Widget {
        type Key = String;
        const TABLE: &'static str = "widgets";
        fn set_identity(&mut self, key: &Self::Key) {
            self.id = key.clone();
        }
    }

    #[derive(Default)]
    struct FakeStore {
        rows: Mutex<StdHashMap<String, serde_json::Value>>,
        insert_calls: Mutex<u32>,
        reattach_calls: Mutex<u32>,
    }

    impl StoreSession for FakeStore {
        fn load_row<'a>(
            &'a self,
            _table: &'a str,
            key: &'a str,
        ) -> BoxFuture<'a, Result<Option<serde_json::Value>>> {
            let value = self.rows.lock().unwrap().get(key).cloned();
            Box::pin(async move { Ok(value) })
        }

        fn insert_row<'a>(
            &'a self,
            _table: &'a str,
            key: &'a str,
            data: serde_json::Value,
        ) -> BoxFuture<'a, Result<()>> {
            *self.insert_calls.lock().unwrap() += 1;
            self.rows.lock().unwrap().insert(key.to_string(), data);
            Box::pin(async { Ok(()) })
        }

        fn reattach_row<'a>(
            &'a self,
            _table: &'a str,
            key: &'a str,
            data: serde_json::Value,
        ) -> BoxFuture<'a, Result<()>> {
            *self.reattach_calls.lock().unwrap() += 1;
            self.rows.lock().unwrap().insert(key.to_string(), data);
            Box::pin(async { Ok(()) })
        }

        fn delete_row<'a>(&'a self, _table: &'a str, key: &'a str) -> BoxFuture<'a, Result<()>> {
            self.rows.lock().unwrap().remove(key);
            Box::pin(async { Ok(()) })
        }

        fn load_state<'a>(
            &'a self,
            _state_key: &'a str,
        ) -> BoxFuture<'a, Result<Option<crate::model::ProjectorState>>> {
            Box::pin(async { Ok(None) })
        }

        fn save_state<'a>(&'a self, _state: crate::model::ProjectorState) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn widget_map() -> EventMap<Ev, Widget> {
        MapBuilder::new()
            .on_create(
                "Created",
                |e| match e {
                    Ev::Created { id, .. } => id.clone(),
                    _ => unreachable!(),
                },
                |_ctx, e, w| {
                    if let Ev::Created { name, .. } = e {
                        w.name = name.clone();
                    }
                },
            )
            .on_update(
                "Renamed",
                |e| match e {
                    Ev::Renamed { id, .. } => id.clone(),
                    _ => unreachable!(),
                },
                |_ctx, e, w| {
                    if let Ev::Renamed { name, .. } = e {
                        w.name = name.clone();
                    }
                },
            )
            .on_delete("Removed", |e| match e {
                Ev::Removed { id } => id.clone(),
                _ => unreachable!(),
            })
            .build()
    }

    fn fresh_ctx(tx_id: &str) -> ProjectionContext {
        let tx: Transaction<Ev> = Transaction {
            id: tx_id.to_string(),
            stream_id: "stream".into(),
            checkpoint: 1,
            timestamp_utc: Utc::now(),
            headers: StdHashMap::new(),
            events: Vec::new(),
        };
        let env = crate::model::EventEnvelope::new(Ev::Created {
            id: "1".into(),
            name: "x".into(),
        });
        ProjectionContext::for_event(&tx, &env)
    }

    #[tokio::test]
    async fn create_then_update_then_delete_round_trips() {
        let dispatcher = MapDispatcher::new("widgets", widget_map(), Arc::new(InMemoryCache::<Widget>::new()));
        let store = FakeStore::default();
        let mut ctx = fresh_ctx("tx-1");

        dispatcher
            .dispatch(
                "tx-1",
                &mut ctx,
                &Ev::Created {
                    id: "1".into(),
                    name: "first".into(),
                },
                &store,
            )
            .await
            .unwrap();
        assert!(ctx.was_handled());
        assert_eq!(*store.insert_calls.lock().unwrap(), 1);

        let mut ctx2 = fresh_ctx("tx-2");
        dispatcher
            .dispatch(
                "tx-2",
                &mut ctx2,
                &Ev::Renamed {
                    id: "1".into(),
                    name: "second".into(),
                },
                &store,
            )
            .await
            .unwrap();
        assert_eq!(*store.reattach_calls.lock().unwrap(), 1);
        let row = store.rows.lock().unwrap().get("1").cloned().unwrap();
        assert_eq!(row["name"], "second");

        let mut ctx3 = fresh_ctx("tx-3");
        dispatcher
            .dispatch("tx-3", &mut ctx3, &Ev::Removed { id: "1".into() }, &store)
            .await
            .unwrap();
        assert!(store.rows.lock().unwrap().get("1").is_none());
    }

    #[tokio::test]
    async fn update_against_missing_row_is_a_silent_no_op() {
        let dispatcher = MapDispatcher::new("widgets", widget_map(), Arc::new(InMemoryCache::<Widget>::new()));
        let store = FakeStore::default();
        let mut ctx = fresh_ctx("tx-1");

        dispatcher
            .dispatch(
                "tx-1",
                &mut ctx,
                &Ev::Renamed {
                    id: "missing".into(),
                    name: "x".into(),
                },
                &store,
            )
            .await
            .unwrap();

        assert!(!ctx.was_handled());
        assert_eq!(*store.reattach_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn filtered_out_row_is_not_mutated() {
        let map = MapBuilder::new()
            .on_create(
                "Created",
                |e| match e {
                    Ev::Created { id, .. } => id.clone(),
                    _ => unreachable!(),
                },
                |_ctx, e, w| {
                    if let Ev::Created { name, .. } = e {
                        w.name = name.clone();
                    }
                },
            )
            .on_update(
                "Renamed",
                |e| match e {
                    Ev::Renamed { id, .. } => id.clone(),
                    _ => unreachable!(),
                },
                |_ctx, e, w| {
                    if let Ev::Renamed { name, .. } = e {
                        w.name = name.clone();
                    }
                },
            )
            .build();
        let dispatcher = MapDispatcher::new("widgets", map, Arc::new(InMemoryCache::<Widget>::new()))
            .with_filter(|w: &Widget| w.name != "locked");
        let store = FakeStore::default();

        let mut ctx = fresh_ctx("tx-1");
        dispatcher
            .dispatch(
                "tx-1",
                &mut ctx,
                &Ev::Created {
                    id: "1".into(),
                    name: "locked".into(),
                },
                &store,
            )
            .await
            .unwrap();

        let mut ctx2 = fresh_ctx("tx-2");
        dispatcher
            .dispatch(
                "tx-2",
                &mut ctx2,
                &Ev::Renamed {
                    id: "1".into(),
                    name: "unlocked".into(),
                },
                &store,
            )
            .await
            .unwrap();

        assert!(!ctx2.was_handled(), "filtered-out row must see no mutation");
        let row = store.rows.lock().unwrap().get("1").cloned().unwrap();
        assert_eq!(row["name"], "locked");
    }

    #[tokio::test]
    async fn create_against_an_existing_key_is_a_no_op_unless_overwrite_allows_it() {
        let map: EventMap<Ev, Widget> = MapBuilder::new()
            .on_create_overwrite_if(
                "Created",
                |e| match e {
                    Ev::Created { id, .. } => id.clone(),
                    _ => unreachable!(),
                },
                |_ctx, e, w| {
                    if let Ev::Created { name, .. } = e {
                        w.name = name.clone();
                    }
                },
                |existing: &Widget| existing.name == "placeholder",
            )
            .build();
        let dispatcher = MapDispatcher::new("widgets", map, Arc::new(InMemoryCache::<Widget>::new()));
        let store = FakeStore::default();

        let mut ctx = fresh_ctx("tx-1");
        dispatcher
            .dispatch(
                "tx-1",
                &mut ctx,
                &Ev::Created {
                    id: "1".into(),
                    name: "placeholder".into(),
                },
                &store,
            )
            .await
            .unwrap();
        assert_eq!(*store.insert_calls.lock().unwrap(), 1);

        let mut ctx2 = fresh_ctx("tx-2");
        dispatcher
            .dispatch(
                "tx-2",
                &mut ctx2,
                &Ev::Created {
                    id: "1".into(),
                    name: "real".into(),
                },
                &store,
            )
            .await
            .unwrap();

        assert!(ctx2.was_handled(), "overwrite policy allowed this one");
        assert_eq!(*store.reattach_calls.lock().unwrap(), 1);
        assert_eq!(*store.insert_calls.lock().unwrap(), 1, "still only one insert ever");
        let row = store.rows.lock().unwrap().get("1").cloned().unwrap();
        assert_eq!(row["name"], "real");
    }

    #[tokio::test]
    async fn update_or_create_builds_a_row_on_a_miss() {
        let map: EventMap<Ev, Widget> = MapBuilder::new()
            .on_update_or_create(
                "Renamed",
                |e| match e {
                    Ev::Renamed { id, .. } => id.clone(),
                    _ => unreachable!(),
                },
                |_ctx, e, w| {
                    if let Ev::Renamed { name, .. } = e {
                        w.name = name.clone();
                    }
                },
                || true,
            )
            .build();
        let dispatcher = MapDispatcher::new("widgets", map, Arc::new(InMemoryCache::<Widget>::new()));
        let store = FakeStore::default();
        let mut ctx = fresh_ctx("tx-1");

        dispatcher
            .dispatch(
                "tx-1",
                &mut ctx,
                &Ev::Renamed {
                    id: "new".into(),
                    name: "first".into(),
                },
                &store,
            )
            .await
            .unwrap();

        assert!(ctx.was_handled());
        assert_eq!(*store.insert_calls.lock().unwrap(), 1);
        let row = store.rows.lock().unwrap().get("new").cloned().unwrap();
        assert_eq!(row["name"], "first");
    }

    struct CountingChild {
        calls: Mutex<u32>,
    }

    impl ChildDispatch<Ev> for CountingChild {
        fn name(&self) -> &str {
            "child"
        }

        fn project<'a>(
            &'a self,
            _transaction_id: &'a str,
            ctx: &'a mut ProjectionContext,
            _event: &'a Ev,
            _store: &'a dyn StoreSession,
        ) -> BoxFuture<'a, Result<()>> {
            *self.calls.lock().unwrap() += 1;
            ctx.mark_handled(true);
            Box::pin(async { Ok(()) })
        }

        fn clear_cache(&self) {}
    }

    #[tokio::test]
    async fn children_run_before_the_parent_handles_the_event() {
        let child = Arc::new(CountingChild {
            calls: Mutex::new(0),
        });
        let dispatcher = MapDispatcher::new("widgets", widget_map(), Arc::new(InMemoryCache::<Widget>::new()))
            .with_child(child.clone());
        let store = FakeStore::default();
        let mut ctx = fresh_ctx("tx-1");

        dispatcher
            .dispatch(
                "tx-1",
                &mut ctx,
                &Ev::Created {
                    id: "1".into(),
                    name: "first".into(),
                },
                &store,
            )
            .await
            .unwrap();

        assert_eq!(*child.calls.lock().unwrap(), 1);
        assert!(ctx.was_handled());
    }
}
