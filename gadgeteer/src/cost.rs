//! Cost accounting shared across an agent tree.
//!
//! A [`CostLedger`] is a monotonically non-decreasing USD total. Three source
//! kinds fold into it: model token costs (priced through a [`ModelPricing`]
//! registry), costs a gadget reports through its context callback, and costs
//! a gadget returns in a structured result. Child agents clone the `Arc` and
//! write into the same ledger, so a parent's budget check sees subagent
//! spending immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::usage::Usage;

/// Micro-dollars per dollar; the ledger stores integers to keep the
/// accumulation atomic and monotonic.
const MICROS: f64 = 1_000_000.0;

/// A shared, monotonic cost accumulator in USD.
#[derive(Debug, Default)]
pub struct CostLedger {
    micros: AtomicU64,
}

impl CostLedger {
    /// Create an empty ledger.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            micros: AtomicU64::new(0),
        }
    }

    /// Add a cost in USD. Negative or non-finite amounts are ignored —
    /// the total never decreases.
    pub fn add(&self, usd: f64) {
        if !usd.is_finite() || usd <= 0.0 {
            return;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delta = (usd * MICROS).round() as u64;
        self.micros.fetch_add(delta, Ordering::Relaxed);
        trace!(usd, "cost recorded");
    }

    /// The accumulated total in USD.
    #[must_use]
    pub fn total(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let micros = self.micros.load(Ordering::Relaxed) as f64;
        micros / MICROS
    }
}

/// Prices model token usage in USD.
///
/// Supplied by the embedding application. Returning `None` for an unknown
/// model is non-fatal: the caller records zero cost and carries on.
pub trait ModelPricing: Send + Sync {
    /// Price the given usage for the given model id, in USD.
    fn price(&self, model: &str, usage: &Usage) -> Option<f64>;
}

/// Per-million-token rates for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelRates {
    /// USD per million input tokens.
    pub input_per_million: f64,
    /// USD per million output tokens.
    pub output_per_million: f64,
    /// USD per million cached input tokens.
    pub cached_input_per_million: f64,
    /// USD per million cache-creation tokens.
    pub cache_creation_per_million: f64,
    /// USD per million reasoning tokens.
    pub reasoning_per_million: f64,
}

impl ModelRates {
    /// Rates with only input/output pricing set.
    #[must_use]
    pub const fn simple(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
            cached_input_per_million: 0.0,
            cache_creation_per_million: 0.0,
            reasoning_per_million: 0.0,
        }
    }

    /// Price a usage record against these rates.
    #[must_use]
    pub fn price(&self, usage: &Usage) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let per = |tokens: u64, rate: f64| (tokens as f64) * rate / 1_000_000.0;
        per(usage.input_tokens, self.input_per_million)
            + per(usage.output_tokens, self.output_per_million)
            + per(usage.cached_input_tokens, self.cached_input_per_million)
            + per(usage.cache_creation_tokens, self.cache_creation_per_million)
            + per(usage.reasoning_tokens, self.reasoning_per_million)
    }
}

/// A [`ModelPricing`] backed by a static rate table.
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    rates: HashMap<String, ModelRates>,
}

impl StaticPricing {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register rates for a model id.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, rates: ModelRates) -> Self {
        self.rates.insert(model.into(), rates);
        self
    }
}

impl ModelPricing for StaticPricing {
    fn price(&self, model: &str, usage: &Usage) -> Option<f64> {
        self.rates.get(model).map(|rates| rates.price(usage))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn ledger_starts_at_zero() {
        assert_eq!(CostLedger::new().total(), 0.0);
    }

    #[test]
    fn ledger_accumulates() {
        let ledger = CostLedger::new();
        ledger.add(0.01);
        ledger.add(0.02);
        assert!((ledger.total() - 0.03).abs() < 1e-9);
    }

    #[test]
    fn ledger_ignores_negative_and_nan() {
        let ledger = CostLedger::new();
        ledger.add(0.05);
        ledger.add(-1.0);
        ledger.add(f64::NAN);
        assert!((ledger.total() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn rates_price_all_counters() {
        let rates = ModelRates {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cached_input_per_million: 0.3,
            cache_creation_per_million: 3.75,
            reasoning_per_million: 15.0,
        };
        let usage = Usage::new(1_000_000, 1_000_000)
            .with_cached(1_000_000)
            .with_reasoning(1_000_000);
        assert_eq!(rates.price(&usage), 3.0 + 15.0 + 0.3 + 15.0);
    }

    #[test]
    fn static_pricing_misses_are_none() {
        let pricing = StaticPricing::new().with_model("gpt-test", ModelRates::simple(1.0, 2.0));
        let usage = Usage::new(500_000, 0);
        assert_eq!(pricing.price("gpt-test", &usage), Some(0.5));
        assert_eq!(pricing.price("unknown-model", &usage), None);
    }
}
