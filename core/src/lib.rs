//! # Projector Core
//!
//! Event-map dispatch, a batched transactional driver and a retry/exception
//! state machine for projecting ordered event streams into relational
//! projections.
//!
//! ## Core Concepts
//!
//! - **`EventMap`**: routes an event's kind to a `Create`/`Update`/`Delete`/
//!   `Custom` action against one projection type.
//! - **`MapDispatcher`**: applies an `EventMap` to a single event, against a
//!   `ProjectionCache` and a `StoreSession`, running any child projectors first.
//! - **`BatchDriver`**: groups transactions into batches, one store
//!   transaction per batch, checkpointing on a configurable cadence.
//! - **`RetryController`**: turns a failed batch into an `Abort`/`Retry`/
//!   `RetryIndividual`/`Ignore` decision, and refuses to bisect a batch that
//!   is already a single transaction.
//!
//! This crate is storage-agnostic: [`store::StoreSession`] is the only seam
//! to a backing store. `projector-postgres` provides a PostgreSQL
//! implementation; `projector-testing` provides an in-memory one for tests.

pub mod batch;
pub mod cache;
pub mod cancel;
pub mod dispatcher;
pub mod error;
pub mod event_map;
pub mod model;
pub mod retry;
pub mod store;

pub use batch::{BatchDriver, BatchOptions, PersistStateBehavior};
pub use cache::{InMemoryCache, PassthroughCache, ProjectionCache};
pub use cancel::{CancelSource, CancelToken};
pub use dispatcher::{ChildDispatch, MapDispatcher};
pub use error::{ProjectorError, Result};
pub use event_map::{Action, EventMap, MapBuilder};
pub use model::{DispatchEvent, EventEnvelope, ProjectionContext, ProjectionEntity, ProjectorState, Transaction, TransactionSummary};
pub use retry::{AlwaysAbort, ExceptionPolicy, Resolution, RetryController};
pub use store::{StoreSession, StoreSessionFactory};
