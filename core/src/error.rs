//! Error taxonomy for the projector core.
//!
//! Mirrors `composable_rust_core::projection::ProjectionError` in shape, but
//! carries the richer context spec'd for this core: which projector (and,
//! for nested failures, which child projector) raised it, the transaction
//! and event under way, and the full batch so a caller-supplied
//! `ExceptionPolicy` can make an informed decision.

use crate::model::TransactionSummary;
use std::fmt;

/// Result type for projector operations.
pub type Result<T> = std::result::Result<T, ProjectorError>;

/// Error type for the event-map dispatcher, batch driver and retry controller.
///
/// `Cancelled` is not really an error condition — it is the cooperative-stop
/// signal described in spec §5/§7 — but it travels the same `Result` channel
/// because it must short-circuit the same call stack a real failure does.
#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    /// A handler, child projector, or store call failed while projecting an event.
    #[error("{origin}: {source}")]
    Projection {
        /// Structured context describing where the failure occurred.
        origin: ProjectionOrigin,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Cooperative cancellation observed mid-batch or between batches.
    ///
    /// Not wrapped, not tagged, and never passed to an `ExceptionPolicy`.
    #[error("projection cancelled")]
    Cancelled,

    /// Invalid construction-time arguments (null map builder, empty state
    /// key, `batch_size < 1`, ...). Raised synchronously, never swallowed.
    #[error("invalid projector configuration: {0}")]
    Configuration(String),

    /// An `ExceptionPolicy` returned `RetryIndividual` while the controller
    /// was already retrying individually. Non-recoverable.
    #[error("retry policy returned RetryIndividual while already retrying individually")]
    RetryInconsistency,
}

impl ProjectorError {
    /// Build a fresh, untagged projection failure from any error.
    pub fn from_cause(
        projector: impl Into<String>,
        transaction_id: impl Into<String>,
        event_index: Option<usize>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Projection {
            origin: ProjectionOrigin {
                projector: projector.into(),
                child_projector: None,
                transaction_id: transaction_id.into(),
                event_index,
                batch: Vec::new(),
            },
            source: Box::new(cause),
        }
    }

    /// Returns `true` if this is a tagged `Projection` failure already
    /// carrying a child-projector identity.
    #[must_use]
    pub const fn has_child_tag(&self) -> bool {
        matches!(
            self,
            Self::Projection {
                origin: ProjectionOrigin {
                    child_projector: Some(_),
                    ..
                },
                ..
            }
        )
    }

    /// Tag this failure with a child projector's identity, if it's a
    /// `Projection` failure that isn't tagged yet. No-op otherwise.
    #[must_use]
    pub fn tag_child(mut self, child_projector: &str) -> Self {
        if let Self::Projection { origin, .. } = &mut self {
            if origin.child_projector.is_none() {
                origin.child_projector = Some(child_projector.to_string());
            }
        }
        self
    }

    /// Attach the batch under way to a `Projection` failure. No-op otherwise.
    #[must_use]
    pub fn tag_batch(mut self, projector: &str, batch: Vec<TransactionSummary>) -> Self {
        if let Self::Projection { origin, .. } = &mut self {
            origin.projector = projector.to_string();
            origin.batch = batch;
        }
        self
    }

    /// Wrap any failure as an untagged `Projection` failure. Shorthand for
    /// [`Self::from_cause`] with no known event index.
    pub fn wrap_other(
        projector: impl Into<String>,
        transaction_id: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::from_cause(projector, transaction_id, None, cause)
    }

    /// Fill in origin fields that haven't been set yet. Used by the
    /// dispatcher to attach the current transaction/event context to an
    /// error a store implementation raised without knowing either.
    #[must_use]
    pub fn contextualize(
        mut self,
        projector: &str,
        transaction_id: &str,
        event_index: Option<usize>,
    ) -> Self {
        if let Self::Projection { origin, .. } = &mut self {
            if origin.projector.is_empty() {
                origin.projector = projector.to_string();
            }
            if origin.transaction_id.is_empty() {
                origin.transaction_id = transaction_id.to_string();
            }
            if origin.event_index.is_none() {
                origin.event_index = event_index;
            }
        }
        self
    }
}

/// Structured origin context for a `ProjectorError::Projection`.
#[derive(Debug, Default)]
pub struct ProjectionOrigin {
    /// Identity of the top-level projector (the `MapDispatcher`'s configured name).
    pub projector: String,
    /// Identity of the child projector that raised this, if any.
    pub child_projector: Option<String>,
    /// The transaction being projected when the failure occurred.
    pub transaction_id: String,
    /// Index of the event within the transaction, if known.
    pub event_index: Option<usize>,
    /// The full batch under way, for policy inspection.
    pub batch: Vec<TransactionSummary>,
}

impl fmt::Display for ProjectionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projector '{}'", self.projector)?;
        if let Some(child) = &self.child_projector {
            write!(f, " (child '{child}')")?;
        }
        write!(f, " failed on transaction '{}'", self.transaction_id)?;
        if let Some(idx) = self.event_index {
            write!(f, " at event #{idx}")?;
        }
        Ok(())
    }
}
