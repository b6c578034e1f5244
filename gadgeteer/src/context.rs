//! The execution context handed to every gadget.
//!
//! Shared mutable state — the execution tree, the cost ledger, the rate
//! tracker — travels through this context as explicit references, never as
//! globals. A gadget that spawns a subagent passes the context's tree handle
//! and its own node id as the child's root parent, so the child writes into
//! the same tree and spends against the same ledger.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt as _;

use crate::agent::AgentConfig;
use crate::cancel::CancelSignal;
use crate::cost::{CostLedger, ModelPricing};
use crate::error::ProviderError;
use crate::hooks::HumanInput;
use crate::media::MediaStore;
use crate::provider::{FrameStream, ModelClient, ModelRequest};
use crate::ratelimit::RateTracker;
use crate::tree::{ExecutionTree, NodeId};

/// Context available to a gadget during execution.
#[derive(Clone)]
pub struct GadgetContext {
    /// Cancellation signal for this invocation (asserted by timeouts and by
    /// every ancestor signal).
    pub signal: CancelSignal,
    /// This invocation's id within its response.
    pub invocation_id: String,
    /// This invocation's node in the shared execution tree.
    pub node_id: NodeId,
    /// The shared execution tree.
    pub tree: Arc<ExecutionTree>,
    /// Snapshot of the owning agent's configuration.
    pub config: Arc<AgentConfig>,
    /// The shared rate tracker, for subagent construction.
    pub rate: Arc<RateTracker>,
    ledger: Arc<CostLedger>,
    local: Arc<CostLedger>,
    llm: Option<Arc<dyn ModelClient>>,
    human: Option<Arc<dyn HumanInput>>,
    media: Option<Arc<dyn MediaStore>>,
}

impl std::fmt::Debug for GadgetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GadgetContext")
            .field("invocation_id", &self.invocation_id)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl GadgetContext {
    /// Assemble a context. Called by the executor; gadgets only consume it.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        signal: CancelSignal,
        invocation_id: impl Into<String>,
        node_id: NodeId,
        tree: Arc<ExecutionTree>,
        config: Arc<AgentConfig>,
        rate: Arc<RateTracker>,
        ledger: Arc<CostLedger>,
        local: Arc<CostLedger>,
        llm: Option<Arc<dyn ModelClient>>,
        human: Option<Arc<dyn HumanInput>>,
        media: Option<Arc<dyn MediaStore>>,
    ) -> Self {
        Self {
            signal,
            invocation_id: invocation_id.into(),
            node_id,
            tree,
            config,
            rate,
            ledger,
            local,
            llm,
            human,
            media,
        }
    }

    /// Report a cost. It lands on the shared ledger (where budget checks
    /// see it immediately) and on this invocation's own total.
    pub fn report_cost(&self, usd: f64) {
        self.ledger.add(usd);
        self.local.add(usd);
    }

    /// The shared cost ledger, for subagent construction.
    #[must_use]
    pub fn ledger(&self) -> Arc<CostLedger> {
        Arc::clone(&self.ledger)
    }

    /// A model client whose calls automatically report their cost against
    /// the shared ledger. `None` when the agent has no client configured.
    #[must_use]
    pub fn llm(&self) -> Option<Arc<dyn ModelClient>> {
        self.llm.clone()
    }

    /// The human-input collaborator, when one is configured.
    #[must_use]
    pub fn human(&self) -> Option<Arc<dyn HumanInput>> {
        self.human.clone()
    }

    /// The media store, when one is configured.
    #[must_use]
    pub fn media(&self) -> Option<Arc<dyn MediaStore>> {
        self.media.clone()
    }
}

/// A [`ModelClient`] decorator that prices every streamed usage frame and
/// records it on the shared ledger.
pub struct CostReportingClient {
    inner: Arc<dyn ModelClient>,
    ledger: Arc<CostLedger>,
    pricing: Option<Arc<dyn ModelPricing>>,
}

impl std::fmt::Debug for CostReportingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostReportingClient").finish_non_exhaustive()
    }
}

impl CostReportingClient {
    /// Wrap a client.
    #[must_use]
    pub fn new(
        inner: Arc<dyn ModelClient>,
        ledger: Arc<CostLedger>,
        pricing: Option<Arc<dyn ModelPricing>>,
    ) -> Self {
        Self {
            inner,
            ledger,
            pricing,
        }
    }
}

#[async_trait]
impl ModelClient for CostReportingClient {
    async fn stream(
        &self,
        request: &ModelRequest,
        signal: &CancelSignal,
    ) -> std::result::Result<FrameStream, ProviderError> {
        let stream = self.inner.stream(request, signal).await?;
        let model = request.model.clone();
        let ledger = Arc::clone(&self.ledger);
        let pricing = self.pricing.clone();
        let priced = stream.map(move |item| {
            if let Ok(frame) = &item
                && let Some(usage) = &frame.usage
                && let Some(cost) = pricing.as_ref().and_then(|p| p.price(&model, usage))
            {
                ledger.add(cost);
            }
            item
        });
        Ok(Box::pin(priced))
    }
}
