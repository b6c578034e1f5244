//! Builder for [`Agent`].

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelSignal;
use crate::cost::{CostLedger, ModelPricing};
use crate::gadget::{BoxedGadget, Gadget, GadgetRegistry};
use crate::hooks::{BeforeLlmCall, GadgetInterceptor, HumanInput, Observer, TextOnlyPolicy};
use crate::media::MediaStore;
use crate::message::Message;
use crate::parser::MarkerConfig;
use crate::provider::ModelClient;
use crate::ratelimit::{RateLimits, RateTracker};
use crate::retry::RetryHarness;
use crate::tree::{ExecutionTree, NodeId};

use super::config::{AgentConfig, ExecutionMode};
use super::runner::Agent;

/// Builds an [`Agent`].
///
/// Shared state (tree, ledger, rate tracker, cancellation signal) defaults
/// to fresh instances; a gadget that spawns a subagent passes its context's
/// handles in instead, so parent and child share accounting and observers.
#[derive(Default)]
pub struct AgentBuilder {
    config: Option<AgentConfig>,
    registry: GadgetRegistry,
    client: Option<Arc<dyn ModelClient>>,
    pricing: Option<Arc<dyn ModelPricing>>,
    tree: Option<Arc<ExecutionTree>>,
    tree_parent: Option<NodeId>,
    ledger: Option<Arc<CostLedger>>,
    rate: Option<Arc<RateTracker>>,
    retry: Option<RetryHarness>,
    signal: Option<CancelSignal>,
    controller: Option<Arc<dyn BeforeLlmCall>>,
    observers: Vec<Arc<dyn Observer>>,
    human: Option<Arc<dyn HumanInput>>,
    media: Option<Arc<dyn MediaStore>>,
    interceptor: Option<Arc<dyn GadgetInterceptor>>,
    ephemeral: Option<Message>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn config_mut(&mut self) -> &mut AgentConfig {
        self.config.get_or_insert_with(|| AgentConfig::new(""))
    }

    /// Set the model id.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config_mut().model = model.into();
        self
    }

    /// Set the agent name used in tracing spans.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config_mut().name = name.into();
        self
    }

    /// Set the base system instructions.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config_mut().system_prompt = Some(prompt.into());
        self
    }

    /// Set the iteration ceiling.
    #[must_use]
    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config_mut().max_iterations = max;
        self
    }

    /// Set the USD budget.
    #[must_use]
    pub fn budget(mut self, budget: f64) -> Self {
        self.config_mut().budget = Some(budget);
        self
    }

    /// Set the default gadget timeout.
    #[must_use]
    pub fn default_gadget_timeout(mut self, timeout: Duration) -> Self {
        self.config_mut().default_gadget_timeout = timeout;
        self
    }

    /// Set the batch execution mode.
    #[must_use]
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.config_mut().execution_mode = mode;
        self
    }

    /// Cap dispatched invocations per response (0 = unlimited).
    #[must_use]
    pub fn max_gadgets_per_response(mut self, cap: usize) -> Self {
        self.config_mut().max_gadgets_per_response = cap;
        self
    }

    /// Override the marker prefixes.
    #[must_use]
    pub fn markers(mut self, markers: MarkerConfig) -> Self {
        self.config_mut().markers = markers;
        self
    }

    /// Set the text-only policy.
    #[must_use]
    pub fn text_only_policy(mut self, policy: TextOnlyPolicy) -> Self {
        self.config_mut().text_only_policy = policy;
        self
    }

    /// Wrap prose accompanying invocations as a trailing call to this
    /// gadget instead of inlining it as the assistant preamble.
    #[must_use]
    pub fn text_wrapper_gadget(mut self, gadget: impl Into<String>) -> Self {
        self.config_mut().text_wrapper_gadget = Some(gadget.into());
        self
    }

    /// Register a gadget.
    #[must_use]
    pub fn gadget<G: Gadget + 'static>(mut self, gadget: G) -> Self {
        self.registry.register(gadget);
        self
    }

    /// Register a boxed gadget.
    #[must_use]
    pub fn gadget_boxed(mut self, gadget: BoxedGadget) -> Self {
        self.registry.register_boxed(gadget);
        self
    }

    /// Set the model client.
    #[must_use]
    pub fn client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the pricing registry.
    #[must_use]
    pub fn pricing(mut self, pricing: Arc<dyn ModelPricing>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Share an existing execution tree (subagent construction).
    #[must_use]
    pub fn tree(mut self, tree: Arc<ExecutionTree>) -> Self {
        self.tree = Some(tree);
        self
    }

    /// Parent node for this agent's root LLM call (the spawning gadget's
    /// node id).
    #[must_use]
    pub fn parent_node(mut self, node: NodeId) -> Self {
        self.tree_parent = Some(node);
        self
    }

    /// Share an existing cost ledger (subagent construction).
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Share an existing rate tracker (subagent construction).
    #[must_use]
    pub fn rate(mut self, rate: Arc<RateTracker>) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Configure a fresh rate tracker from limits.
    #[must_use]
    pub fn rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate = Some(Arc::new(RateTracker::new(limits)));
        self
    }

    /// Set the retry harness for model-stream acquisition.
    #[must_use]
    pub fn retry(mut self, retry: RetryHarness) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Use an external cancellation signal.
    #[must_use]
    pub fn signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Install the pre-call controller hook.
    #[must_use]
    pub fn controller(mut self, controller: Arc<dyn BeforeLlmCall>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Add a lifecycle observer.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Set the human-input collaborator.
    #[must_use]
    pub fn human_input(mut self, human: Arc<dyn HumanInput>) -> Self {
        self.human = Some(human);
        self
    }

    /// Set the media store.
    #[must_use]
    pub fn media_store(mut self, media: Arc<dyn MediaStore>) -> Self {
        self.media = Some(media);
        self
    }

    /// Install a parameter interceptor.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn GadgetInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Append an ephemeral trailing message to every model call without
    /// persisting it in the conversation.
    #[must_use]
    pub fn ephemeral_message(mut self, message: Message) -> Self {
        self.ephemeral = Some(message);
        self
    }

    /// Assemble the agent.
    #[must_use]
    pub fn build(self) -> Agent {
        Agent {
            config: Arc::new(self.config.unwrap_or_else(|| AgentConfig::new(""))),
            registry: Arc::new(self.registry),
            client: self.client,
            pricing: self.pricing,
            tree: self.tree.unwrap_or_default(),
            tree_parent: self.tree_parent,
            ledger: self.ledger.unwrap_or_default(),
            rate: self.rate.unwrap_or_default(),
            retry: Arc::new(self.retry.unwrap_or_default()),
            signal: self.signal.unwrap_or_default(),
            controller: self.controller,
            observers: self.observers,
            human: self.human,
            media: self.media,
            interceptor: self.interceptor,
            ephemeral: self.ephemeral,
        }
    }
}
