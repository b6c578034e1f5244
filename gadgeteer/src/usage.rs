//! Token usage accounting for model calls.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token usage reported by one model call.
///
/// Providers that do not break out cached / cache-creation / reasoning
/// tokens leave those counters at zero; pricing lookups treat every counter
/// independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u64,

    /// Tokens generated by the model.
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u64,

    /// Prompt tokens served from the provider's cache.
    #[serde(default)]
    pub cached_input_tokens: u64,

    /// Prompt tokens written to the provider's cache.
    #[serde(default)]
    pub cache_creation_tokens: u64,

    /// Hidden reasoning tokens, for models that report them.
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl Usage {
    /// Create a usage record from prompt and completion counts.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_input_tokens: 0,
            cache_creation_tokens: 0,
            reasoning_tokens: 0,
        }
    }

    /// An all-zero record.
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Set the cached-input counter.
    #[must_use]
    pub const fn with_cached(mut self, cached: u64) -> Self {
        self.cached_input_tokens = cached;
        self
    }

    /// Set the cache-creation counter.
    #[must_use]
    pub const fn with_cache_creation(mut self, created: u64) -> Self {
        self.cache_creation_tokens = created;
        self
    }

    /// Set the reasoning counter.
    #[must_use]
    pub const fn with_reasoning(mut self, reasoning: u64) -> Self {
        self.reasoning_tokens = reasoning;
        self
    }

    /// Total tokens across all counters.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cached_input_tokens
            + self.cache_creation_tokens
            + self.reasoning_tokens
    }

    /// Whether every counter is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cached_input_tokens: self.cached_input_tokens + rhs.cached_input_tokens,
            cache_creation_tokens: self.cache_creation_tokens + rhs.cache_creation_tokens,
            reasoning_tokens: self.reasoning_tokens + rhs.reasoning_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
