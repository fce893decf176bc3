//! The batched transactional driver (component C2): groups transactions
//! into one store transaction per batch, checkpoints on the policy-chosen
//! cadence, and hands failures to a [`crate::retry::RetryController`].

use crate::cancel::CancelToken;
use crate::dispatcher::MapDispatcher;
use crate::error::{ProjectorError, Result};
use crate::model::{DispatchEvent, ProjectionContext, ProjectionEntity, ProjectorState, Transaction};
use crate::retry::{ExceptionPolicy, Resolution, RetryController};
use crate::store::StoreSessionFactory;
use chrono::Utc;
use std::sync::Arc;

/// When this projector's checkpoint row is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStateBehavior {
    /// Persist after every batch.
    EveryBatch,
    /// Persist only after a batch in which at least one event matched a
    /// registered handler (the batch is "dirty"), or at the last batch of
    /// a page.
    DirtyBatch,
    /// Persist only at the last batch of a page.
    LastBatchOfPage,
}

/// User extension hook invoked before a checkpoint row is written, so a
/// caller can fold extra metadata into [`ProjectorState::data`].
pub type EnrichState = Arc<dyn Fn(&mut ProjectorState) + Send + Sync>;

/// Construction-time options for a [`BatchDriver`].
pub struct BatchOptions {
    /// Maximum number of transactions folded into one store transaction.
    pub batch_size: usize,
    /// When the checkpoint row is written.
    pub persist_state: PersistStateBehavior,
    /// Identity under which this projector's checkpoint row is stored.
    pub state_key: String,
    /// Optional hook to enrich the checkpoint row before it's written.
    pub enrich_state: Option<EnrichState>,
}

impl BatchOptions {
    /// Validate construction-time invariants: a zero batch size or an empty
    /// state key can never make progress, so both are rejected synchronously
    /// rather than discovered mid-run.
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ProjectorError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.state_key.trim().is_empty() {
            return Err(ProjectorError::Configuration(
                "state_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Drives a [`MapDispatcher`] over a stream of transactions, one store
/// transaction per batch, applying a [`RetryController`] to any failure.
pub struct BatchDriver<E: DispatchEvent, P: ProjectionEntity> {
    dispatcher: Arc<MapDispatcher<E, P>>,
    store_factory: Arc<dyn StoreSessionFactory>,
    retry: RetryController,
    cancel: CancelToken,
    options: BatchOptions,
}

impl<E: DispatchEvent, P: ProjectionEntity> BatchDriver<E, P> {
    /// Build a driver. Fails synchronously if `options` is invalid.
    pub fn new(
        dispatcher: Arc<MapDispatcher<E, P>>,
        store_factory: Arc<dyn StoreSessionFactory>,
        policy: Arc<dyn ExceptionPolicy>,
        cancel: CancelToken,
        options: BatchOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            dispatcher,
            store_factory,
            retry: RetryController::new(policy),
            cancel,
            options,
        })
    }

    /// Process `transactions` in batches of `options.batch_size`, in order.
    /// First reads the persisted checkpoint and discards any transaction at
    /// or before it, so re-driving the same (or an overlapping) slice is a
    /// no-op for what was already applied. Returns on the first batch whose
    /// resolution is `Abort`, or once every transaction has been applied.
    pub async fn drive(&self, transactions: Vec<Transaction<E>>) -> Result<()> {
        let session = self.store_factory.begin().await?;
        let last = session.load_state(&self.options.state_key).await?;
        session.rollback().await?;
        let last_checkpoint = last.map_or(0, |state| state.checkpoint);

        let pending: Vec<_> = transactions
            .into_iter()
            .filter(|tx| tx.checkpoint > last_checkpoint)
            .collect();

        let chunks: Vec<_> = pending
            .chunks(self.options.batch_size)
            .map(<[Transaction<E>]>::to_vec)
            .collect();
        let total = chunks.len();
        tracing::info!(
            projector = self.dispatcher.name(),
            batch_count = total,
            batch_size = self.options.batch_size,
            "driving transactions"
        );

        for (index, chunk) in chunks.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!(projector = self.dispatcher.name(), "cancelled between batches");
                return Err(ProjectorError::Cancelled);
            }
            let is_last_of_page = index + 1 == total;
            self.run_batch_with_retry(&chunk, is_last_of_page, false)
                .await?;
        }
        Ok(())
    }

    /// Reset this projector's checkpoint to zero and re-drive `transactions`
    /// from the beginning. A convenience for backfills; callers are
    /// responsible for feeding the full transaction history, not just the
    /// tail the projector had already consumed.
    pub async fn rebuild(&self, transactions: Vec<Transaction<E>>) -> Result<()> {
        let session = self.store_factory.begin().await?;
        let reset = ProjectorState::new(self.options.state_key.clone(), 0, Utc::now());
        session.save_state(reset).await?;
        session.commit().await?;
        self.dispatcher.clear_cache();
        self.drive(transactions).await
    }

    async fn run_batch_with_retry(
        &self,
        batch: &[Transaction<E>],
        is_last_of_page: bool,
        individual_mode: bool,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProjectorError::Cancelled);
        }

        let session = self.store_factory.begin().await?;
        let outcome = Self::apply_batch(&self.dispatcher, session.as_ref(), batch).await;

        match outcome {
            Ok((last_checkpoint, dirty)) => {
                let should_persist = match self.options.persist_state {
                    PersistStateBehavior::EveryBatch => true,
                    PersistStateBehavior::LastBatchOfPage => is_last_of_page,
                    PersistStateBehavior::DirtyBatch => is_last_of_page || dirty,
                };
                if should_persist {
                    let mut state =
                        ProjectorState::new(self.options.state_key.clone(), last_checkpoint, Utc::now());
                    if let Some(enrich) = &self.options.enrich_state {
                        enrich(&mut state);
                    }
                    tracing::info!(
                        projector = self.dispatcher.name(),
                        state_key = %self.options.state_key,
                        checkpoint = last_checkpoint,
                        "persisting checkpoint"
                    );
                    session.save_state(state).await?;
                }
                session.commit().await
            }
            Err(ProjectorError::Cancelled) => {
                tracing::info!(projector = self.dispatcher.name(), "cancelled mid-batch, rolling back");
                session.rollback().await?;
                self.dispatcher.clear_cache();
                Err(ProjectorError::Cancelled)
            }
            Err(err) => {
                tracing::warn!(projector = self.dispatcher.name(), error = %err, "batch failed");
                session.rollback().await?;
                self.dispatcher.clear_cache();
                self.handle_failure(err, batch, is_last_of_page, individual_mode)
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        err: ProjectorError,
        batch: &[Transaction<E>],
        is_last_of_page: bool,
        individual_mode: bool,
    ) -> Result<()> {
        let resolution = self.retry.decide(&err, individual_mode)?;
        tracing::info!(
            projector = self.dispatcher.name(),
            resolution = ?resolution,
            batch_len = batch.len(),
            "exception policy resolved a failed batch"
        );
        match resolution {
            Resolution::Abort => Err(err),
            Resolution::Ignore => Ok(()),
            Resolution::Retry => {
                Box::pin(self.run_batch_with_retry(batch, is_last_of_page, individual_mode)).await
            }
            Resolution::RetryIndividual => {
                for (idx, tx) in batch.iter().enumerate() {
                    let is_last = is_last_of_page && idx + 1 == batch.len();
                    Box::pin(self.run_batch_with_retry(
                        std::slice::from_ref(tx),
                        is_last,
                        true,
                    ))
                    .await?;
                }
                Ok(())
            }
        }
    }

    async fn apply_batch(
        dispatcher: &MapDispatcher<E, P>,
        session: &dyn crate::store::StoreSession,
        batch: &[Transaction<E>],
    ) -> Result<(i64, bool)> {
        let mut last_checkpoint = 0;
        let mut dirty = false;
        for tx in batch {
            for event in &tx.events {
                let mut ctx = ProjectionContext::for_event(tx, event);
                dispatcher
                    .dispatch(&tx.id, &mut ctx, &event.body, session)
                    .await
                    .map_err(|e| {
                        e.tag_batch(
                            dispatcher.name(),
                            batch.iter().map(Transaction::summarize).collect(),
                        )
                    })?;
                dirty |= ctx.was_handled();
            }
            last_checkpoint = tx.checkpoint;
        }
        Ok((last_checkpoint, dirty))
    }
}
