//! Cooperative cancellation (spec §5): a single flag checked at transaction
//! and batch boundaries, never pre-empted mid-transaction.

use tokio::sync::watch;

/// A cheaply cloned handle a [`crate::batch::BatchDriver`] polls between
/// transactions and between batches.
///
/// Built on `tokio::sync::watch` rather than `tokio_util::CancellationToken`
/// so cancellation rides the same primitive the rest of this crate uses for
/// shutdown signaling.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Wrap an existing watch receiver.
    #[must_use]
    pub fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// `true` once [`CancelSource::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// A token that never reports cancelled, for callers that don't need
    /// cooperative shutdown (tests, one-shot backfills).
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }
}

/// The other half of a [`CancelToken`]: signals cancellation to every clone.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    /// Build a fresh, not-yet-cancelled source and its first token.
    #[must_use]
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    /// Hand out another token sharing this source's cancellation state.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal cancellation to every outstanding token. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_observes_cancellation_from_its_source() {
        let (source, token) = CancelSource::new();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn never_token_is_never_cancelled() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn subsequent_tokens_share_state() {
        let (source, first) = CancelSource::new();
        let second = source.token();
        source.cancel();
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }
}
