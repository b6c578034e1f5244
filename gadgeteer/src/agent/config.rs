//! Agent configuration types.

use std::time::Duration;

use crate::hooks::TextOnlyPolicy;
use crate::parser::MarkerConfig;

/// How a batch of gadget invocations is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// All ready invocations run concurrently.
    #[default]
    Parallel,
    /// At most one invocation runs at a time; within a dependency layer
    /// the textual order of the response is preserved.
    Sequential,
}

/// Configuration for an agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent name, used for tracing spans.
    pub name: String,
    /// Model id passed to the provider.
    pub model: String,
    /// Base system instructions; the marker protocol and gadget briefs are
    /// appended at run time.
    pub system_prompt: Option<String>,
    /// Maximum loop iterations (default: 20).
    pub max_iterations: usize,
    /// USD budget; the loop terminates once total cost reaches it.
    pub budget: Option<f64>,
    /// Timeout applied to gadgets that do not declare their own.
    pub default_gadget_timeout: Duration,
    /// Batch dispatch mode.
    pub execution_mode: ExecutionMode,
    /// Cap on dispatched invocations per response (0 = unlimited).
    pub max_gadgets_per_response: usize,
    /// Marker prefixes for the invocation grammar.
    pub markers: MarkerConfig,
    /// What to do with invocation-free replies.
    pub text_only_policy: TextOnlyPolicy,
    /// When set, prose accompanying invocations is wrapped as a trailing
    /// synthetic invocation of this gadget; when `None`, the prose becomes
    /// the assistant-message preamble.
    pub text_wrapper_gadget: Option<String>,
}

impl AgentConfig {
    /// Default maximum number of loop iterations.
    pub const DEFAULT_MAX_ITERATIONS: usize = 20;

    /// Default per-gadget timeout.
    pub const DEFAULT_GADGET_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a config for the given model with defaults everywhere else.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            name: "agent".to_owned(),
            model: model.into(),
            system_prompt: None,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            budget: None,
            default_gadget_timeout: Self::DEFAULT_GADGET_TIMEOUT,
            execution_mode: ExecutionMode::default(),
            max_gadgets_per_response: 0,
            markers: MarkerConfig::default(),
            text_only_policy: TextOnlyPolicy::default(),
            text_wrapper_gadget: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::new("test-model");
        assert_eq!(config.model, "test-model");
        assert_eq!(config.max_iterations, AgentConfig::DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.execution_mode, ExecutionMode::Parallel);
        assert_eq!(config.max_gadgets_per_response, 0);
        assert!(config.budget.is_none());
    }
}
