#![allow(tail_expr_drop_order)]
//! Gadgeteer is an agent runtime: it drives a conversation between a
//! language model and a set of callable capabilities ("gadgets") invoked
//! through a plain-text marker protocol.
//!
//! One iteration of the loop opens a streamed model call, feeds the reply
//! through an incremental marker parser, resolves dependencies among the
//! extracted invocations, executes them with bounded concurrency and
//! per-invocation timeouts, folds the results back into the conversation,
//! and re-enters — until a budget, iteration limit, cancellation, or a
//! gadget-asserted task completion stops it. Everything that happens is
//! recorded in an append-only execution tree shared with any subagents.
//!
//! # Example
//!
//! ```rust,ignore
//! let agent = Agent::builder()
//!     .model("some-model")
//!     .client(client)
//!     .gadget(Calculator)
//!     .build();
//!
//! let mut events = agent.run("What is 2 + 3?");
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod agent;
pub mod cancel;
pub mod context;
pub mod cost;
pub mod error;
pub mod gadget;
pub mod hooks;
pub mod media;
pub mod message;
pub mod parser;
pub mod provider;
pub mod ratelimit;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod tree;
pub mod usage;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentEvent, AgentStream, ExecutionMode, TerminationReason};
pub use cancel::CancelSignal;
pub use context::GadgetContext;
pub use cost::{CostLedger, ModelPricing, ModelRates, StaticPricing};
pub use error::{Error, InvocationError, ProviderError, Result};
pub use gadget::{Gadget, GadgetError, GadgetOutput, GadgetRegistry, schema_of};
pub use hooks::{
    BeforeLlmCall, GadgetInterceptor, HumanInput, LlmCallDecision, Observer, TextOnlyAction,
    TextOnlyHandler, TextOnlyPolicy,
};
pub use media::{InMemoryMediaStore, Media, MediaKind, MediaStore};
pub use message::{Content, Conversation, GadgetBrief, Message, Part, Role};
pub use parser::{GadgetCall, MarkerConfig, MarkerParser};
pub use provider::{FinishReason, FrameStream, ModelClient, ModelRequest, StreamFrame};
pub use ratelimit::{RateLimits, RateTracker};
pub use retry::{BackoffStrategy, RetryHarness, RetryPolicy};
pub use scheduler::{InvocationRecord, InvocationState, Scheduler};
pub use schema::{SchemaViolation, validate_and_coerce};
pub use tree::{ExecutionTree, GadgetCompletion, NodeId, NodeKind, TreeEvent, TreeNode};
pub use usage::Usage;
