//! Events emitted by the agent loop.

use std::pin::Pin;

use futures::Stream;

use crate::error::Error;
use crate::usage::Usage;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TerminationReason {
    /// A gadget asserted task completion.
    TaskComplete,
    /// The reply was text-only and the policy says stop.
    Completed,
    /// Total cost reached the configured budget.
    BudgetExhausted,
    /// The iteration ceiling was reached.
    IterationLimit,
    /// The external cancellation signal fired.
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::TaskComplete => "task_complete",
            Self::Completed => "completed",
            Self::BudgetExhausted => "budget_exhausted",
            Self::IterationLimit => "iteration_limit",
            Self::Cancelled => "cancelled",
        };
        f.write_str(tag)
    }
}

/// Events surfaced while the agent runs.
///
/// Text events for one LLM call arrive in stream order; invocation
/// completions arrive in completion order. The final event of every run is
/// [`AgentEvent::Terminated`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AgentEvent {
    /// A model call is being opened.
    LlmCallStarted {
        /// 1-based iteration number.
        iteration: usize,
        /// Model id.
        model: String,
    },

    /// Incremental prose from the model.
    Text(String),

    /// A model call closed.
    LlmCallCompleted {
        /// 1-based iteration number.
        iteration: usize,
        /// Token usage for the call.
        usage: Usage,
        /// Priced cost in USD.
        cost: f64,
    },

    /// A gadget invocation was dispatched.
    InvocationStarted {
        /// Invocation id within the response.
        invocation_id: String,
        /// Gadget name.
        gadget: String,
    },

    /// A gadget invocation reached a terminal state.
    InvocationCompleted {
        /// Invocation id within the response.
        invocation_id: String,
        /// Gadget name.
        gadget: String,
        /// Whether it completed successfully.
        success: bool,
        /// The result (or error) text the model will see.
        result: String,
    },

    /// The loop stopped.
    Terminated {
        /// Why.
        reason: TerminationReason,
    },
}

/// The boxed event stream returned by `Agent::run`.
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<AgentEvent, Error>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_tags() {
        assert_eq!(TerminationReason::TaskComplete.to_string(), "task_complete");
        assert_eq!(TerminationReason::BudgetExhausted.to_string(), "budget_exhausted");
        assert_eq!(TerminationReason::IterationLimit.to_string(), "iteration_limit");
        assert_eq!(TerminationReason::Cancelled.to_string(), "cancelled");
        assert_eq!(TerminationReason::Completed.to_string(), "completed");
    }
}
