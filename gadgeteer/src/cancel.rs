//! Hierarchical cancellation signals.
//!
//! One external [`CancelSignal`] is the root of a small tree: the controller
//! derives a per-iteration child, each LLM call derives one from that, and
//! each gadget execution derives one more (additionally asserted by its
//! timeout). Asserting a parent asserts every descendant. Each signal carries
//! a human-readable reason so an observer can distinguish "user hit ctrl-c"
//! from "timed out after 50ms".

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// A cancellation signal with an attached reason.
///
/// Cloning shares the underlying token; [`child`](CancelSignal::child)
/// derives a signal that fires when either the parent fires or it is
/// asserted itself.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelSignal {
    /// Create a fresh, unasserted root signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child signal.
    ///
    /// The child fires when the parent fires; asserting the child does not
    /// affect the parent. The child starts with its own empty reason slot —
    /// [`reason`](CancelSignal::reason) falls back to the parent's reason
    /// through the shared slot only when the child was never asserted
    /// directly.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::clone(&self.reason),
        }
    }

    /// Derive a child with an independent reason slot.
    ///
    /// Used for timeout-derived signals, where the reason ("timed out") must
    /// not leak up into the parent's slot.
    #[must_use]
    pub fn child_detached(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Assert the signal with a reason.
    ///
    /// The first reason wins; later asserts are no-ops.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.reason.lock()
            && slot.is_none()
        {
            *slot = Some(reason.into());
        }
        self.token.cancel();
    }

    /// Whether the signal (or any ancestor) has been asserted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded reason, if the signal has been asserted with one.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    /// The reason, or a generic fallback for signals asserted upstream
    /// without one.
    #[must_use]
    pub fn reason_or_default(&self) -> String {
        self.reason()
            .unwrap_or_else(|| "cancellation requested".to_owned())
    }

    /// Resolve when the signal is asserted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
