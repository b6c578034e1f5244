//! Sliding-window rate limiting for model calls.
//!
//! One [`RateTracker`] is threaded through a whole agent tree, so a parent
//! and its subagents throttle against the same windows. Before each model
//! call the controller *reserves* an estimated token cost; after the call it
//! *reconciles* the reservation with the provider-reported usage. Reserve and
//! commit both happen under the tracker's mutex.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::usage::Usage;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configured ceilings for a tracker. `None` disables a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimits {
    /// Requests allowed per sliding minute.
    pub requests_per_minute: Option<u64>,
    /// Tokens allowed per sliding minute.
    pub tokens_per_minute: Option<u64>,
    /// Tokens allowed per sliding day.
    pub tokens_per_day: Option<u64>,
    /// Fraction of each ceiling actually used, in `(0, 1]`.
    pub safety_margin: f64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: None,
            tokens_per_minute: None,
            tokens_per_day: None,
            safety_margin: 1.0,
        }
    }
}

impl RateLimits {
    /// Unlimited tracker configuration.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    fn effective(&self, limit: Option<u64>) -> Option<u64> {
        let margin = self.safety_margin.clamp(f64::MIN_POSITIVE, 1.0);
        limit.map(|ceiling| {
            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss
            )]
            let scaled = ((ceiling as f64) * margin).floor().max(1.0) as u64;
            scaled
        })
    }
}

#[derive(Debug)]
struct Entry {
    at: Instant,
    tokens: u64,
    id: u64,
}

#[derive(Debug, Default)]
struct Window {
    requests: VecDeque<Instant>,
    tokens: VecDeque<Entry>,
    next_id: u64,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while self.requests.front().is_some_and(|&at| now - at >= MINUTE) {
            self.requests.pop_front();
        }
        while self.tokens.front().is_some_and(|e| now - e.at >= DAY) {
            self.tokens.pop_front();
        }
    }

    fn tokens_within(&self, now: Instant, span: Duration) -> u64 {
        self.tokens
            .iter()
            .filter(|e| now - e.at < span)
            .map(|e| e.tokens)
            .sum()
    }
}

/// A receipt for a reserved token estimate, handed back at reconcile time.
#[derive(Debug)]
pub struct Reservation {
    id: u64,
}

/// A sliding-window, multi-metric request/token limiter.
#[derive(Debug, Default)]
pub struct RateTracker {
    limits: RateLimits,
    window: tokio::sync::Mutex<Window>,
}

impl RateTracker {
    /// Create a tracker with the given limits.
    #[must_use]
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            window: tokio::sync::Mutex::new(Window::default()),
        }
    }

    /// The configured limits.
    #[must_use]
    pub const fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Reserve a slot for one request with an estimated token cost.
    ///
    /// Suspends until every enabled window has room (or the signal fires, in
    /// which case `None` is returned and nothing was reserved). The
    /// reservation must be passed back to
    /// [`reconcile`](RateTracker::reconcile) once actual usage is known.
    pub async fn acquire(&self, estimated_tokens: u64, signal: &CancelSignal) -> Option<Reservation> {
        loop {
            if signal.is_cancelled() {
                return None;
            }

            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                window.prune(now);

                match self.room(&window, now, estimated_tokens) {
                    Ok(()) => {
                        let id = window.next_id;
                        window.next_id += 1;
                        window.requests.push_back(now);
                        window.tokens.push_back(Entry {
                            at: now,
                            tokens: estimated_tokens,
                            id,
                        });
                        return Some(Reservation { id });
                    }
                    Err(wait) => wait,
                }
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = signal.cancelled() => return None,
            }
        }
    }

    /// Replace a reservation's estimate with the actual token usage.
    pub async fn reconcile(&self, reservation: Reservation, actual: &Usage) {
        let mut window = self.window.lock().await;
        if let Some(entry) = window.tokens.iter_mut().find(|e| e.id == reservation.id) {
            entry.tokens = actual.total();
        }
    }

    /// Check whether a request of `tokens` fits right now; on refusal,
    /// return how long to wait before rechecking.
    fn room(&self, window: &Window, now: Instant, tokens: u64) -> std::result::Result<(), Duration> {
        if let Some(limit) = self.limits.effective(self.limits.requests_per_minute)
            && window.requests.len() as u64 >= limit
        {
            let oldest = window.requests.front().copied().unwrap_or(now);
            return Err(MINUTE.saturating_sub(now - oldest));
        }
        if let Some(limit) = self.limits.effective(self.limits.tokens_per_minute)
            && window.tokens_within(now, MINUTE) + tokens > limit
        {
            let oldest = window
                .tokens
                .iter()
                .find(|e| now - e.at < MINUTE)
                .map_or(now, |e| e.at);
            return Err(MINUTE.saturating_sub(now - oldest));
        }
        if let Some(limit) = self.limits.effective(self.limits.tokens_per_day)
            && window.tokens_within(now, DAY) + tokens > limit
        {
            let oldest = window.tokens.front().map_or(now, |e| e.at);
            return Err(DAY.saturating_sub(now - oldest));
        }
        Ok(())
    }
}
