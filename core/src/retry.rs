//! The retry/exception state machine (component C3): turns a batch failure
//! into a policy decision, and guards against the one recursive case that
//! has no sound interpretation — asking to bisect a batch that is already a
//! single transaction.

use crate::error::{ProjectorError, Result};

/// What a caller-supplied [`ExceptionPolicy`] decided to do about a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Roll back and propagate the failure; stop processing.
    Abort,
    /// Roll back and re-attempt the whole batch as-is.
    Retry,
    /// Roll back and re-attempt each transaction in the batch individually.
    RetryIndividual,
    /// Roll back this batch's writes and move on without propagating the
    /// failure. The checkpoint for this batch is never persisted.
    Ignore,
}

/// Decides how a [`crate::batch::BatchDriver`] should respond to a failed batch.
pub trait ExceptionPolicy: Send + Sync {
    /// Inspect `error` (which, for a `Projection` failure, carries the full
    /// failing batch via its origin) and decide how to proceed.
    fn resolve(&self, error: &ProjectorError) -> Resolution;
}

/// The conservative default: every failure aborts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAbort;

impl ExceptionPolicy for AlwaysAbort {
    fn resolve(&self, _error: &ProjectorError) -> Resolution {
        Resolution::Abort
    }
}

/// Wraps an [`ExceptionPolicy`] with the anti-recursion guard described in
/// spec §4.5: a policy may ask to bisect a multi-transaction batch once, but
/// asking to bisect an already-individual batch is a configuration bug, not
/// something to paper over with deeper recursion.
pub struct RetryController {
    policy: std::sync::Arc<dyn ExceptionPolicy>,
}

impl RetryController {
    /// Wrap `policy`.
    #[must_use]
    pub fn new(policy: std::sync::Arc<dyn ExceptionPolicy>) -> Self {
        Self { policy }
    }

    /// Resolve `error`, rejecting `RetryIndividual` if `already_individual`
    /// is set (the batch under way is already a single transaction).
    pub fn decide(&self, error: &ProjectorError, already_individual: bool) -> Result<Resolution> {
        let resolution = self.policy.resolve(error);
        if resolution == Resolution::RetryIndividual && already_individual {
            return Err(ProjectorError::RetryInconsistency);
        }
        Ok(resolution)
    }
}
