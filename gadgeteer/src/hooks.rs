//! The observer and controller hook surface.
//!
//! Three callback families surround the agent loop:
//!
//! - a **controller** ([`BeforeLlmCall`]) that may skip, modify, or let a
//!   model call proceed;
//! - **observers** ([`Observer`]) that watch lifecycle edges and must not
//!   mutate state;
//! - the **text-only policy** ([`TextOnlyPolicy`]) deciding what happens
//!   when a reply contains prose but no invocations.
//!
//! [`HumanInput`] is the external collaborator consulted for
//! `wait_for_input` and for gadgets that raise a needs-input signal.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::message::Message;
use crate::parser::GadgetCall;
use crate::usage::Usage;

/// Decision returned by the pre-call controller hook.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum LlmCallDecision {
    /// Make the call with the prepared messages.
    Proceed,
    /// Make no call this turn; the iteration counter does not advance.
    Skip,
    /// Make the call with a replacement message list.
    Modify(Vec<Message>),
}

/// Pre-call controller hook.
#[async_trait]
pub trait BeforeLlmCall: Send + Sync {
    /// Inspect the prepared messages and decide how to proceed.
    async fn before_llm_call(&self, iteration: usize, messages: &[Message]) -> LlmCallDecision;
}

/// Parameter interceptor, consulted after parsing and before schema
/// coercion. Returning `Some` replaces the parsed arguments; when the
/// replacement differs from the parsed value, the coercing pass is skipped
/// (interceptor output is trusted as already typed).
#[async_trait]
pub trait GadgetInterceptor: Send + Sync {
    /// Optionally rewrite a call's arguments.
    async fn before_gadget(&self, call: &GadgetCall) -> Option<Value>;
}

/// Fire-and-forget lifecycle observers. Default implementations do nothing;
/// implementors must not mutate agent state.
#[async_trait]
pub trait Observer: Send + Sync {
    /// An iteration is starting.
    async fn on_iteration_start(&self, _iteration: usize) {}

    /// An iteration finished.
    async fn on_iteration_end(&self, _iteration: usize) {}

    /// A model call is being opened.
    async fn on_llm_call_start(&self, _iteration: usize, _model: &str) {}

    /// A model call closed.
    async fn on_llm_call_end(&self, _iteration: usize, _usage: &Usage, _cost: f64) {}

    /// Prose was emitted by the stream parser.
    async fn on_text(&self, _text: &str) {}

    /// A gadget invocation was dispatched.
    async fn on_gadget_start(&self, _invocation_id: &str, _name: &str) {}

    /// A gadget invocation reached a terminal state.
    async fn on_gadget_end(&self, _invocation_id: &str, _name: &str, _success: bool) {}
}

/// The external human-input collaborator.
///
/// May suspend indefinitely; implementations should watch their own channel
/// for cancellation and return `None` when no answer can be produced.
#[async_trait]
pub trait HumanInput: Send + Sync {
    /// Ask the human a question and await the answer.
    async fn ask(&self, question: &str) -> Option<String>;
}

/// What a custom text-only handler wants the controller to do.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TextOnlyAction {
    /// Stop the loop.
    Terminate,
    /// Append this user message and re-enter the loop.
    Reply(String),
}

/// Custom text-only policy handler.
#[async_trait]
pub trait TextOnlyHandler: Send + Sync {
    /// Decide what to do with an invocation-free reply.
    async fn on_text_only(&self, text: &str) -> TextOnlyAction;
}

/// Policy for replies that contain prose but no gadget invocations.
#[derive(Clone, Default)]
#[non_exhaustive]
pub enum TextOnlyPolicy {
    /// Treat the reply as the final answer and stop.
    #[default]
    Terminate,
    /// Synthesize a minimal "continue" user message and re-enter.
    Acknowledge,
    /// Ask the human-input collaborator and append the answer.
    WaitForInput,
    /// Delegate the decision to a handler.
    Custom(Arc<dyn TextOnlyHandler>),
}

impl std::fmt::Debug for TextOnlyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminate => f.write_str("Terminate"),
            Self::Acknowledge => f.write_str("Acknowledge"),
            Self::WaitForInput => f.write_str("WaitForInput"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A controller hook that always proceeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysProceed;

#[async_trait]
impl BeforeLlmCall for AlwaysProceed {
    async fn before_llm_call(&self, _iteration: usize, _messages: &[Message]) -> LlmCallDecision {
        LlmCallDecision::Proceed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct CannedInput(&'static str);

    #[async_trait]
    impl HumanInput for CannedInput {
        async fn ask(&self, _question: &str) -> Option<String> {
            Some(self.0.to_owned())
        }
    }

    #[tokio::test]
    async fn always_proceed_proceeds() {
        let decision = AlwaysProceed.before_llm_call(1, &[]).await;
        assert_eq!(decision, LlmCallDecision::Proceed);
    }

    #[tokio::test]
    async fn canned_input_answers() {
        let input = CannedInput("42");
        assert_eq!(input.ask("meaning of life?").await.as_deref(), Some("42"));
    }

    #[test]
    fn policy_default_is_terminate() {
        assert!(matches!(TextOnlyPolicy::default(), TextOnlyPolicy::Terminate));
    }

    #[tokio::test]
    async fn observer_defaults_are_noops() {
        struct Silent;
        #[async_trait]
        impl Observer for Silent {}
        Silent.on_text("hello").await;
        Silent.on_iteration_start(1).await;
    }
}
