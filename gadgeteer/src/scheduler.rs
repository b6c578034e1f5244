//! The gadget scheduler and executor.
//!
//! Takes the batch of invocations extracted from one model response, builds
//! the dependency DAG, and drives every invocation to a terminal state:
//!
//! ```text
//! pending → ready → running → (completed | errored | skipped | aborted | timed_out)
//! ```
//!
//! Failures stay invocation-local: a registry miss, schema violation,
//! timeout, or execution error becomes a result payload the model sees next
//! iteration, and dependents of a failed invocation are skipped rather than
//! run. The records returned preserve the textual order of the response no
//! matter what order executions finish in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt as _};
use tokio::sync::mpsc;
use tracing::{Instrument as _, debug, info_span, warn};

use crate::agent::{AgentConfig, ExecutionMode};
use crate::agent::events::AgentEvent;
use crate::cancel::CancelSignal;
use crate::context::{CostReportingClient, GadgetContext};
use crate::cost::{CostLedger, ModelPricing};
use crate::error::InvocationError;
use crate::gadget::{Gadget as _, GadgetError, GadgetOutput, GadgetRegistry};
use crate::hooks::{GadgetInterceptor, HumanInput};
use crate::media::MediaStore;
use crate::message::Part;
use crate::parser::GadgetCall;
use crate::provider::ModelClient;
use crate::ratelimit::RateTracker;
use crate::schema::validate_and_coerce;
use crate::tree::{ExecutionTree, GadgetCompletion, NodeId};

/// Lifecycle state of one invocation. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationState {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies satisfied, not yet dispatched.
    Ready,
    /// Dispatched and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Errored,
    /// Never dispatched (failed dependency or per-response cap).
    Skipped,
    /// Observed a cancellation signal.
    Aborted,
    /// Exceeded its time limit.
    TimedOut,
}

impl InvocationState {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Errored | Self::Skipped | Self::Aborted | Self::TimedOut
        )
    }
}

/// The complete record of one invocation after batch execution.
#[derive(Debug)]
pub struct InvocationRecord {
    /// The parsed call.
    pub call: GadgetCall,
    /// Terminal state.
    pub state: InvocationState,
    /// Result text, on success.
    pub result: Option<String>,
    /// The failure, otherwise.
    pub error: Option<InvocationError>,
    /// Cost attributed to this invocation in USD.
    pub cost: f64,
    /// Media-store ids produced.
    pub media_ids: Vec<String>,
    /// Conversation parts for produced media.
    pub media_parts: Vec<Part>,
    /// Whether the gadget asserted task completion.
    pub breaks_loop: bool,
    /// This invocation's execution-tree node.
    pub node_id: NodeId,
}

impl InvocationRecord {
    /// Whether the invocation completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == InvocationState::Completed
    }

    /// The text the model sees in the result message.
    #[must_use]
    pub fn result_text(&self) -> String {
        match (&self.result, &self.error) {
            (Some(result), _) => result.clone(),
            (None, Some(error)) => error.to_string(),
            (None, None) => String::new(),
        }
    }
}

/// Outcome of one dispatched execution, folded into the record.
struct Outcome {
    state: InvocationState,
    result: Option<String>,
    error: Option<InvocationError>,
    cost: f64,
    media_ids: Vec<String>,
    media_parts: Vec<Part>,
    breaks_loop: bool,
}

impl Outcome {
    fn errored(error: InvocationError) -> Self {
        let state = match &error {
            InvocationError::Timeout { .. } => InvocationState::TimedOut,
            InvocationError::Aborted(_) => InvocationState::Aborted,
            _ => InvocationState::Errored,
        };
        Self {
            state,
            result: None,
            error: Some(error),
            cost: 0.0,
            media_ids: Vec::new(),
            media_parts: Vec::new(),
            breaks_loop: false,
        }
    }
}

/// Builds the invocation DAG for one response and executes it.
pub struct Scheduler {
    registry: Arc<GadgetRegistry>,
    config: Arc<AgentConfig>,
    tree: Arc<ExecutionTree>,
    ledger: Arc<CostLedger>,
    rate: Arc<RateTracker>,
    pricing: Option<Arc<dyn ModelPricing>>,
    client: Option<Arc<dyn ModelClient>>,
    human: Option<Arc<dyn HumanInput>>,
    media: Option<Arc<dyn MediaStore>>,
    interceptor: Option<Arc<dyn GadgetInterceptor>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .field("mode", &self.config.execution_mode)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler over the shared runtime state.
    #[must_use]
    pub fn new(
        registry: Arc<GadgetRegistry>,
        config: Arc<AgentConfig>,
        tree: Arc<ExecutionTree>,
        ledger: Arc<CostLedger>,
        rate: Arc<RateTracker>,
    ) -> Self {
        Self {
            registry,
            config,
            tree,
            ledger,
            rate,
            pricing: None,
            client: None,
            human: None,
            media: None,
            interceptor: None,
        }
    }

    /// Attach a model client (exposed to gadgets as `ctx.llm()`).
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Attach a pricing registry for `ctx.llm()` cost reporting.
    #[must_use]
    pub fn with_pricing(mut self, pricing: Arc<dyn ModelPricing>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Attach the human-input collaborator.
    #[must_use]
    pub fn with_human(mut self, human: Arc<dyn HumanInput>) -> Self {
        self.human = Some(human);
        self
    }

    /// Attach the media store.
    #[must_use]
    pub fn with_media(mut self, media: Arc<dyn MediaStore>) -> Self {
        self.media = Some(media);
        self
    }

    /// Attach a parameter interceptor.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn GadgetInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Execute one batch of invocations to terminal states.
    ///
    /// Records are returned in the textual order of the response. Lifecycle
    /// events are sent through `events` as they happen.
    pub async fn execute_batch(
        &self,
        calls: Vec<GadgetCall>,
        parent_llm: &NodeId,
        signal: &CancelSignal,
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
    ) -> Vec<InvocationRecord> {
        let mut records: Vec<InvocationRecord> = calls
            .into_iter()
            .map(|call| {
                let node_id = self.tree.add_gadget(
                    parent_llm,
                    &call.invocation_id,
                    &call.gadget_name,
                    call.args.clone(),
                    call.dependencies.clone(),
                );
                InvocationRecord {
                    call,
                    state: InvocationState::Pending,
                    result: None,
                    error: None,
                    cost: 0.0,
                    media_ids: Vec::new(),
                    media_parts: Vec::new(),
                    breaks_loop: false,
                    node_id,
                }
            })
            .collect();

        // First occurrence wins; invocation ids are the only identity.
        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, record) in records.iter().enumerate() {
            index.entry(record.call.invocation_id.clone()).or_insert(i);
        }

        if let Some(cycle) = find_cycle(&records, &index) {
            self.reject_batch(&mut records, &cycle, events);
            return records;
        }

        // Parse errors are terminal before anything dispatches.
        for i in 0..records.len() {
            if let Some(message) = records[i].call.parse_error.clone() {
                let outcome = Outcome::errored(InvocationError::Parse(message));
                self.finish(&mut records[i], outcome, events);
            }
        }

        let cap = self.config.max_gadgets_per_response;
        let mut dispatched = 0_usize;
        let mut running: FuturesUnordered<_> = FuturesUnordered::new();

        loop {
            self.propagate_skips(&mut records, &index, events);

            if cap > 0 && dispatched >= cap {
                self.skip_remaining(&mut records, cap, events);
            }

            let mut ready: Vec<usize> = records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.state == InvocationState::Pending)
                .filter(|(_, r)| self.deps_satisfied(r, &records, &index))
                .map(|(i, _)| i)
                .collect();

            if cap > 0 {
                ready.truncate(cap.saturating_sub(dispatched));
            }
            if self.config.execution_mode == ExecutionMode::Sequential {
                // One at a time, textual order within a layer.
                ready.truncate(usize::from(running.is_empty()));
            }

            for i in ready {
                records[i].state = InvocationState::Running;
                dispatched += 1;
                let record = &records[i];
                self.tree.start_gadget(&record.node_id);
                send_event(
                    events,
                    AgentEvent::InvocationStarted {
                        invocation_id: record.call.invocation_id.clone(),
                        gadget: record.call.gadget_name.clone(),
                    },
                );
                let fut = self.run_one(
                    record.call.clone(),
                    record.node_id.clone(),
                    signal.clone(),
                );
                running.push(async move { (i, fut.await) });
            }

            if running.is_empty() {
                // Nothing running and nothing dispatchable: any survivors
                // have unsatisfiable dependencies.
                for i in 0..records.len() {
                    if !records[i].state.is_terminal() {
                        let dependency = records[i]
                            .call
                            .dependencies
                            .iter()
                            .find(|d| !index.contains_key(d.as_str()))
                            .cloned()
                            .unwrap_or_default();
                        let outcome = Outcome {
                            state: InvocationState::Skipped,
                            result: None,
                            error: Some(InvocationError::DependencyFailed {
                                dependency,
                                reason: "no such invocation in this response".to_owned(),
                            }),
                            cost: 0.0,
                            media_ids: Vec::new(),
                            media_parts: Vec::new(),
                            breaks_loop: false,
                        };
                        self.finish(&mut records[i], outcome, events);
                    }
                }
                break;
            }

            if let Some((i, outcome)) = running.next().await {
                self.finish(&mut records[i], outcome, events);
            }
        }

        records
    }

    fn deps_satisfied(
        &self,
        record: &InvocationRecord,
        records: &[InvocationRecord],
        index: &HashMap<String, usize>,
    ) -> bool {
        record.call.dependencies.iter().all(|dep| {
            index
                .get(dep)
                .is_some_and(|&i| records[i].state == InvocationState::Completed)
        })
    }

    /// Skip every pending invocation whose dependency failed or was itself
    /// skipped; repeats until the skip set stops growing.
    fn propagate_skips(
        &self,
        records: &mut [InvocationRecord],
        index: &HashMap<String, usize>,
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
    ) {
        loop {
            let mut skip: Option<(usize, String, String)> = None;
            'scan: for (i, record) in records.iter().enumerate() {
                if record.state != InvocationState::Pending {
                    continue;
                }
                for dep in &record.call.dependencies {
                    if let Some(&j) = index.get(dep)
                        && records[j].state.is_terminal()
                        && records[j].state != InvocationState::Completed
                    {
                        skip = Some((i, dep.clone(), records[j].result_text()));
                        break 'scan;
                    }
                }
            }

            let Some((i, dependency, reason)) = skip else { break };
            let outcome = Outcome {
                state: InvocationState::Skipped,
                result: None,
                error: Some(InvocationError::DependencyFailed { dependency, reason }),
                cost: 0.0,
                media_ids: Vec::new(),
                media_parts: Vec::new(),
                breaks_loop: false,
            };
            self.finish(&mut records[i], outcome, events);
        }
    }

    fn skip_remaining(
        &self,
        records: &mut [InvocationRecord],
        limit: usize,
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
    ) {
        for i in 0..records.len() {
            if !records[i].state.is_terminal() && records[i].state != InvocationState::Running {
                let outcome = Outcome::errored(InvocationError::MaxPerResponseExceeded { limit });
                let outcome = Outcome {
                    state: InvocationState::Skipped,
                    ..outcome
                };
                self.finish(&mut records[i], outcome, events);
            }
        }
    }

    fn reject_batch(
        &self,
        records: &mut [InvocationRecord],
        cycle: &[String],
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
    ) {
        let description = format!("dependency cycle: {}", cycle.join(" -> "));
        warn!(cycle = %description, "rejecting invocation batch");
        for record in records.iter_mut() {
            let message = if cycle.contains(&record.call.invocation_id) {
                description.clone()
            } else {
                "batch rejected: dependency cycle detected".to_owned()
            };
            let outcome = Outcome::errored(InvocationError::Parse(message));
            finish_static(&self.tree, record, outcome, events);
        }
    }

    fn finish(
        &self,
        record: &mut InvocationRecord,
        outcome: Outcome,
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
    ) {
        finish_static(&self.tree, record, outcome, events);
    }

    /// Run one invocation: lookup, validation, context assembly, execution
    /// under a timeout.
    async fn run_one(&self, call: GadgetCall, node_id: NodeId, signal: CancelSignal) -> Outcome {
        let span = info_span!(
            "gadget",
            gadget.name = %call.gadget_name,
            invocation.id = %call.invocation_id,
        );
        self.run_one_inner(call, node_id, signal).instrument(span).await
    }

    async fn run_one_inner(
        &self,
        call: GadgetCall,
        node_id: NodeId,
        signal: CancelSignal,
    ) -> Outcome {
        if signal.is_cancelled() {
            return Outcome::errored(InvocationError::Aborted(signal.reason_or_default()));
        }

        let Some(gadget) = self.registry.lookup(&call.gadget_name) else {
            return Outcome::errored(InvocationError::RegistryMiss {
                name: call.gadget_name.clone(),
                valid: self.registry.names(),
            });
        };

        // Interceptor output that differs from the parsed arguments is
        // trusted as already typed; unchanged arguments go through the
        // schema-directed coercing pass.
        let intercepted = match &self.interceptor {
            Some(interceptor) => interceptor.before_gadget(&call).await,
            None => None,
        };
        let args = match intercepted {
            Some(replacement) if replacement != call.args => replacement,
            _ => match validate_and_coerce(&call.args, &gadget.parameters_schema()) {
                Ok(coerced) => coerced,
                Err(violation) => {
                    return Outcome::errored(InvocationError::Schema(violation));
                }
            },
        };

        let local = Arc::new(CostLedger::new());
        let gadget_signal = signal.child_detached();
        let ctx = self.build_context(&call, node_id, gadget_signal.clone(), &local);

        let limit = gadget
            .timeout()
            .unwrap_or(self.config.default_gadget_timeout);

        let exec = gadget.execute(args, &ctx);
        tokio::pin!(exec);
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        let result = tokio::select! {
            result = &mut exec => Some(result),
            () = &mut deadline => None,
        };

        let Some(result) = result else {
            // Assert the gadget-level signal with the reason first, yield so
            // a cooperative gadget can observe it and clean up, then resolve
            // as timed out. Dropping the pinned sleep disarms the timer.
            gadget_signal.cancel(format!("timed out after {}ms", limit.as_millis()));
            tokio::task::yield_now().await;
            let _ = futures::poll!(&mut exec);
            debug!(limit_ms = limit.as_millis() as u64, "gadget timed out");
            let mut outcome = Outcome::errored(InvocationError::Timeout { limit });
            outcome.cost = local.total();
            return outcome;
        };

        self.classify(result, &call, &local).await
    }

    fn build_context(
        &self,
        call: &GadgetCall,
        node_id: NodeId,
        gadget_signal: CancelSignal,
        local: &Arc<CostLedger>,
    ) -> GadgetContext {
        // Double-wrapped client: costs report against the shared ledger and
        // against this invocation's local total.
        let llm: Option<Arc<dyn ModelClient>> = self.client.clone().map(|raw| {
            let shared: Arc<dyn ModelClient> = Arc::new(CostReportingClient::new(
                raw,
                Arc::clone(&self.ledger),
                self.pricing.clone(),
            ));
            let both: Arc<dyn ModelClient> = Arc::new(CostReportingClient::new(
                shared,
                Arc::clone(local),
                self.pricing.clone(),
            ));
            both
        });

        GadgetContext::new(
            gadget_signal,
            &call.invocation_id,
            node_id,
            Arc::clone(&self.tree),
            Arc::clone(&self.config),
            Arc::clone(&self.rate),
            Arc::clone(&self.ledger),
            Arc::clone(local),
            llm,
            self.human.clone(),
            self.media.clone(),
        )
    }

    async fn classify(
        &self,
        result: std::result::Result<GadgetOutput, GadgetError>,
        call: &GadgetCall,
        local: &Arc<CostLedger>,
    ) -> Outcome {
        match result {
            Ok(output) => self.accept_output(output, call, local).await,
            Err(GadgetError::TaskComplete(message)) => Outcome {
                state: InvocationState::Completed,
                result: Some(message),
                error: None,
                cost: local.total(),
                media_ids: Vec::new(),
                media_parts: Vec::new(),
                breaks_loop: true,
            },
            Err(GadgetError::NeedsInput(question)) => match &self.human {
                Some(human) => match human.ask(&question).await {
                    Some(answer) => Outcome {
                        state: InvocationState::Completed,
                        result: Some(answer),
                        error: None,
                        cost: local.total(),
                        media_ids: Vec::new(),
                        media_parts: Vec::new(),
                        breaks_loop: false,
                    },
                    None => Outcome::errored(InvocationError::HumanInputUnavailable(question)),
                },
                None => Outcome::errored(InvocationError::HumanInputUnavailable(question)),
            },
            Err(GadgetError::Aborted(reason)) => {
                Outcome::errored(InvocationError::Aborted(reason))
            }
            Err(GadgetError::Execution(message)) => {
                let mut outcome = Outcome::errored(InvocationError::Execution(message));
                outcome.cost = local.total();
                outcome
            }
        }
    }

    async fn accept_output(
        &self,
        output: GadgetOutput,
        call: &GadgetCall,
        local: &Arc<CostLedger>,
    ) -> Outcome {
        let (mut result, cost, media) = match output {
            GadgetOutput::Text(result) => (result, None, Vec::new()),
            GadgetOutput::Structured {
                result,
                cost,
                media,
            } => (result, cost, media),
        };

        if let Some(cost) = cost {
            self.ledger.add(cost);
            local.add(cost);
        }

        let mut media_ids = Vec::new();
        let mut media_parts = Vec::new();
        if !media.is_empty() {
            if let Some(store) = &self.media {
                for item in media {
                    let id = store.store(item.clone(), &call.invocation_id).await;
                    media_parts.push(Part::from_media(item, &id));
                    media_ids.push(id);
                }
                result.push_str(&format!("\n[media: {}]", media_ids.join(", ")));
            } else {
                warn!(
                    gadget = %call.gadget_name,
                    "gadget returned media but no media store is configured",
                );
            }
        }

        Outcome {
            state: InvocationState::Completed,
            result: Some(result),
            error: None,
            cost: local.total(),
            media_ids,
            media_parts,
            breaks_loop: false,
        }
    }
}

fn finish_static(
    tree: &ExecutionTree,
    record: &mut InvocationRecord,
    outcome: Outcome,
    events: Option<&mpsc::UnboundedSender<AgentEvent>>,
) {
    if record.state.is_terminal() {
        return;
    }
    record.state = outcome.state;
    record.result = outcome.result;
    record.error = outcome.error;
    record.cost = outcome.cost;
    record.media_ids = outcome.media_ids;
    record.media_parts = outcome.media_parts;
    record.breaks_loop = outcome.breaks_loop;

    tree.complete_gadget(
        &record.node_id,
        GadgetCompletion {
            result: record.result.clone(),
            error: record.error.as_ref().map(ToString::to_string),
            skipped: record.state == InvocationState::Skipped,
            cost: record.cost,
            media: record.media_ids.clone(),
        },
    );

    send_event(
        events,
        AgentEvent::InvocationCompleted {
            invocation_id: record.call.invocation_id.clone(),
            gadget: record.call.gadget_name.clone(),
            success: record.is_success(),
            result: record.result_text(),
        },
    );
}

fn send_event(events: Option<&mpsc::UnboundedSender<AgentEvent>>, event: AgentEvent) {
    if let Some(sender) = events {
        let _ = sender.send(event);
    }
}

/// Detect a dependency cycle, returning the invocation ids on it.
fn find_cycle(
    records: &[InvocationRecord],
    index: &HashMap<String, usize>,
) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(
        i: usize,
        records: &[InvocationRecord],
        index: &HashMap<String, usize>,
        marks: &mut [Mark],
        trail: &mut Vec<String>,
    ) -> bool {
        marks[i] = Mark::Grey;
        trail.push(records[i].call.invocation_id.clone());
        for dep in &records[i].call.dependencies {
            let Some(&j) = index.get(dep) else { continue };
            match marks[j] {
                Mark::Grey => {
                    trail.push(records[j].call.invocation_id.clone());
                    return true;
                }
                Mark::White => {
                    if visit(j, records, index, marks, trail) {
                        return true;
                    }
                }
                Mark::Black => {}
            }
        }
        trail.pop();
        marks[i] = Mark::Black;
        false
    }

    let mut marks = vec![Mark::White; records.len()];
    for i in 0..records.len() {
        if marks[i] == Mark::White {
            let mut trail = Vec::new();
            if visit(i, records, index, &mut marks, &mut trail) {
                return Some(trail);
            }
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::media::{InMemoryMediaStore, Media};
    use crate::parser::{MarkerConfig, MarkerParser};

    fn calls_from(response: &str) -> Vec<GadgetCall> {
        let mut parser = MarkerParser::new(MarkerConfig::default(), "resp_test");
        let _ = parser.feed(response);
        let (_, calls) = parser.finish();
        calls
    }

    struct Calculator;

    #[async_trait]
    impl crate::gadget::Gadget for Calculator {
        fn name(&self) -> &str {
            "Calculator"
        }

        fn description(&self) -> String {
            "Basic arithmetic".to_owned()
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "op": {"type": "string", "enum": ["add", "sub"]},
                    "a": {"type": "number"},
                    "b": {"type": "number"}
                },
                "required": ["op", "a", "b"]
            })
        }

        async fn execute(
            &self,
            args: Value,
            _ctx: &GadgetContext,
        ) -> std::result::Result<GadgetOutput, GadgetError> {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            let out = match args["op"].as_str() {
                Some("add") => a + b,
                Some("sub") => a - b,
                _ => return Err(GadgetError::execution("unknown op")),
            };
            Ok(GadgetOutput::text(format!("{out}")))
        }
    }

    /// Records dispatch order and optionally fails or sleeps.
    struct Probe {
        name: &'static str,
        fail: bool,
        sleep: Duration,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl crate::gadget::Gadget for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> String {
            "test probe".to_owned()
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: Value,
            ctx: &GadgetContext,
        ) -> std::result::Result<GadgetOutput, GadgetError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("start:{}", ctx.invocation_id));
            tokio::time::sleep(self.sleep).await;
            self.log
                .lock()
                .unwrap()
                .push(format!("end:{}", ctx.invocation_id));
            if self.fail {
                Err(GadgetError::execution("probe failure"))
            } else {
                Ok(GadgetOutput::text(format!("{} done", self.name)))
            }
        }
    }

    struct Harness {
        scheduler: Scheduler,
        tree: Arc<ExecutionTree>,
        root: NodeId,
    }

    fn harness(registry: GadgetRegistry, configure: impl FnOnce(&mut AgentConfig)) -> Harness {
        let mut config = AgentConfig::new("test-model");
        configure(&mut config);
        let tree = Arc::new(ExecutionTree::new());
        let root = tree.add_llm_call(None, 1, "test-model", Vec::new());
        let scheduler = Scheduler::new(
            Arc::new(registry),
            Arc::new(config),
            Arc::clone(&tree),
            Arc::new(CostLedger::new()),
            Arc::new(RateTracker::default()),
        );
        Harness {
            scheduler,
            tree,
            root,
        }
    }

    #[tokio::test]
    async fn single_calculator_invocation_completes() {
        let mut registry = GadgetRegistry::new();
        registry.register(Calculator);
        let h = harness(registry, |_| {});

        let calls = calls_from(
            "!!!GADGET_START:Calculator\n!!!ARG:op\nadd\n!!!ARG:a\n2\n!!!ARG:b\n3\n!!!GADGET_END:",
        );
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert_eq!(records.len(), 1);
        assert!(records[0].is_success());
        assert_eq!(records[0].result_text(), "5");
        let node = h.tree.get(&records[0].node_id).unwrap();
        assert!(node.completed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_gadget_reports_valid_names() {
        let mut registry = GadgetRegistry::new();
        registry.register(Calculator);
        let h = harness(registry, |_| {});

        let calls = calls_from("!!!GADGET_START:Frobnicator\n!!!GADGET_END:");
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert_eq!(records[0].state, InvocationState::Errored);
        let text = records[0].result_text();
        assert!(text.contains("Frobnicator"));
        assert!(text.contains("Calculator"));
    }

    #[tokio::test]
    async fn schema_violation_pinpoints_the_path() {
        let mut registry = GadgetRegistry::new();
        registry.register(Calculator);
        let h = harness(registry, |_| {});

        let calls = calls_from(
            "!!!GADGET_START:Calculator\n!!!ARG:op\nadd\n!!!ARG:a\nbanana\n!!!ARG:b\n3\n!!!GADGET_END:",
        );
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert_eq!(records[0].state, InvocationState::Errored);
        let text = records[0].result_text();
        assert!(text.contains("'a'"));
        assert!(text.contains("number"));
    }

    #[tokio::test]
    async fn parse_error_never_executes() {
        let mut registry = GadgetRegistry::new();
        registry.register(Calculator);
        let h = harness(registry, |_| {});

        let calls = calls_from("!!!GADGET_START:Calculator\n!!!ARG:op\nadd");
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert_eq!(records[0].state, InvocationState::Errored);
        assert!(matches!(
            records[0].error,
            Some(InvocationError::Parse(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dependents_wait_for_their_dependencies() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = GadgetRegistry::new();
        registry.register(Probe {
            name: "fetch_a",
            fail: false,
            sleep: Duration::from_millis(50),
            log: Arc::clone(&log),
        });
        registry.register(Probe {
            name: "fetch_b",
            fail: false,
            sleep: Duration::from_millis(20),
            log: Arc::clone(&log),
        });
        registry.register(Probe {
            name: "merge",
            fail: false,
            sleep: Duration::ZERO,
            log: Arc::clone(&log),
        });
        let h = harness(registry, |_| {});

        let calls = calls_from(
            "!!!GADGET_START:fetch_a:fa\n!!!GADGET_END:\n\
             !!!GADGET_START:fetch_b:fb\n!!!GADGET_END:\n\
             !!!GADGET_START:merge:mg:fa,fb\n!!!GADGET_END:",
        );
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert!(records.iter().all(InvocationRecord::is_success));
        let log = log.lock().unwrap().clone();
        // Both fetches start before either finishes; merge starts last.
        assert_eq!(&log[0][..6], "start:");
        assert_eq!(&log[1][..6], "start:");
        let merge_start = log.iter().position(|e| e == "start:mg").unwrap();
        let a_end = log.iter().position(|e| e == "end:fa").unwrap();
        let b_end = log.iter().position(|e| e == "end:fb").unwrap();
        assert!(merge_start > a_end);
        assert!(merge_start > b_end);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dependency_skips_dependents_transitively() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = GadgetRegistry::new();
        registry.register(Probe {
            name: "fetch_a",
            fail: true,
            sleep: Duration::ZERO,
            log: Arc::clone(&log),
        });
        registry.register(Probe {
            name: "fetch_b",
            fail: false,
            sleep: Duration::from_millis(10),
            log: Arc::clone(&log),
        });
        registry.register(Probe {
            name: "merge",
            fail: false,
            sleep: Duration::ZERO,
            log: Arc::clone(&log),
        });
        registry.register(Probe {
            name: "publish",
            fail: false,
            sleep: Duration::ZERO,
            log: Arc::clone(&log),
        });
        let h = harness(registry, |_| {});

        let calls = calls_from(
            "!!!GADGET_START:fetch_a:fa\n!!!GADGET_END:\n\
             !!!GADGET_START:fetch_b:fb\n!!!GADGET_END:\n\
             !!!GADGET_START:merge:mg:fa,fb\n!!!GADGET_END:\n\
             !!!GADGET_START:publish:pub:mg\n!!!GADGET_END:",
        );
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert_eq!(records[0].state, InvocationState::Errored);
        assert!(records[1].is_success());
        assert_eq!(records[2].state, InvocationState::Skipped);
        assert!(records[2].result_text().contains("fa"));
        assert_eq!(records[3].state, InvocationState::Skipped);
        assert!(records[3].result_text().contains("mg"));
        // fetch_b still ran to completion.
        assert!(log.lock().unwrap().contains(&"end:fb".to_owned()));
    }

    #[tokio::test]
    async fn cycles_reject_the_whole_batch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = GadgetRegistry::new();
        registry.register(Probe {
            name: "alpha",
            fail: false,
            sleep: Duration::ZERO,
            log: Arc::clone(&log),
        });
        registry.register(Probe {
            name: "beta",
            fail: false,
            sleep: Duration::ZERO,
            log: Arc::clone(&log),
        });
        let h = harness(registry, |_| {});

        let calls = calls_from(
            "!!!GADGET_START:alpha:a:b\n!!!GADGET_END:\n\
             !!!GADGET_START:beta:b:a\n!!!GADGET_END:",
        );
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert!(records.iter().all(|r| r.state == InvocationState::Errored));
        assert!(records[0].result_text().contains("cycle"));
        // Nothing executed.
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn per_response_cap_skips_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = GadgetRegistry::new();
        for name in ["one", "two", "three"] {
            registry.register(Probe {
                name,
                fail: false,
                sleep: Duration::from_millis(5),
                log: Arc::clone(&log),
            });
        }
        let h = harness(registry, |config| config.max_gadgets_per_response = 2);

        let calls = calls_from(
            "!!!GADGET_START:one\n!!!GADGET_END:\n\
             !!!GADGET_START:two\n!!!GADGET_END:\n\
             !!!GADGET_START:three\n!!!GADGET_END:",
        );
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert!(records[0].is_success());
        assert!(records[1].is_success());
        assert_eq!(records[2].state, InvocationState::Skipped);
        assert!(records[2].result_text().contains("limit of 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_mode_runs_one_at_a_time_in_textual_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = GadgetRegistry::new();
        registry.register(Probe {
            name: "slow",
            fail: false,
            sleep: Duration::from_millis(30),
            log: Arc::clone(&log),
        });
        registry.register(Probe {
            name: "quick",
            fail: false,
            sleep: Duration::ZERO,
            log: Arc::clone(&log),
        });
        let h = harness(registry, |config| {
            config.execution_mode = ExecutionMode::Sequential;
        });

        let calls = calls_from(
            "!!!GADGET_START:slow:s\n!!!GADGET_END:\n!!!GADGET_START:quick:q\n!!!GADGET_END:",
        );
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert!(records.iter().all(InvocationRecord::is_success));
        let log = log.lock().unwrap().clone();
        assert_eq!(log, vec!["start:s", "end:s", "start:q", "end:q"]);
    }

    struct Sleeper {
        observed_signal: Arc<AtomicBool>,
    }

    #[async_trait]
    impl crate::gadget::Gadget for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        fn description(&self) -> String {
            "sleeps past its deadline".to_owned()
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(50))
        }

        async fn execute(
            &self,
            _args: Value,
            ctx: &GadgetContext,
        ) -> std::result::Result<GadgetOutput, GadgetError> {
            let signal = ctx.signal.clone();
            let observed = Arc::clone(&self.observed_signal);
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(200)) => {}
                () = signal.cancelled() => {
                    observed.store(true, Ordering::SeqCst);
                }
            }
            Ok(GadgetOutput::text("never seen"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_asserts_signal_then_resolves_timed_out() {
        let observed = Arc::new(AtomicBool::new(false));
        let mut registry = GadgetRegistry::new();
        registry.register(Sleeper {
            observed_signal: Arc::clone(&observed),
        });
        let h = harness(registry, |_| {});

        let calls = calls_from("!!!GADGET_START:sleeper\n!!!GADGET_END:");
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert_eq!(records[0].state, InvocationState::TimedOut);
        assert!(records[0].result_text().contains("50ms"));
        assert!(observed.load(Ordering::SeqCst));
    }

    struct Finisher;

    #[async_trait]
    impl crate::gadget::Gadget for Finisher {
        fn name(&self) -> &str {
            "finish"
        }

        fn description(&self) -> String {
            "asserts task completion".to_owned()
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: Value,
            _ctx: &GadgetContext,
        ) -> std::result::Result<GadgetOutput, GadgetError> {
            Err(GadgetError::TaskComplete("done".to_owned()))
        }
    }

    #[tokio::test]
    async fn task_completion_signal_breaks_the_loop() {
        let mut registry = GadgetRegistry::new();
        registry.register(Finisher);
        let h = harness(registry, |_| {});

        let calls = calls_from("!!!GADGET_START:finish\n!!!GADGET_END:");
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert!(records[0].is_success());
        assert!(records[0].breaks_loop);
        assert_eq!(records[0].result_text(), "done");
    }

    struct Asker;

    #[async_trait]
    impl crate::gadget::Gadget for Asker {
        fn name(&self) -> &str {
            "ask"
        }

        fn description(&self) -> String {
            "asks the human".to_owned()
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: Value,
            _ctx: &GadgetContext,
        ) -> std::result::Result<GadgetOutput, GadgetError> {
            Err(GadgetError::NeedsInput("which city?".to_owned()))
        }
    }

    struct CannedHuman;

    #[async_trait]
    impl HumanInput for CannedHuman {
        async fn ask(&self, _question: &str) -> Option<String> {
            Some("Lisbon".to_owned())
        }
    }

    #[tokio::test]
    async fn needs_input_is_answered_by_the_collaborator() {
        let mut registry = GadgetRegistry::new();
        registry.register(Asker);
        let mut h = harness(registry, |_| {});
        h.scheduler = h.scheduler.with_human(Arc::new(CannedHuman));

        let calls = calls_from("!!!GADGET_START:ask\n!!!GADGET_END:");
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert!(records[0].is_success());
        assert_eq!(records[0].result_text(), "Lisbon");
    }

    #[tokio::test]
    async fn needs_input_without_collaborator_is_an_error() {
        let mut registry = GadgetRegistry::new();
        registry.register(Asker);
        let h = harness(registry, |_| {});

        let calls = calls_from("!!!GADGET_START:ask\n!!!GADGET_END:");
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert_eq!(records[0].state, InvocationState::Errored);
        assert!(matches!(
            records[0].error,
            Some(InvocationError::HumanInputUnavailable(_))
        ));
    }

    struct Snapshotter;

    #[async_trait]
    impl crate::gadget::Gadget for Snapshotter {
        fn name(&self) -> &str {
            "snapshot"
        }

        fn description(&self) -> String {
            "returns media".to_owned()
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: Value,
            _ctx: &GadgetContext,
        ) -> std::result::Result<GadgetOutput, GadgetError> {
            Ok(GadgetOutput::with_media(
                "captured",
                vec![Media::image("b64", "image/png")],
            ))
        }
    }

    #[tokio::test]
    async fn media_is_stored_and_referenced() {
        let mut registry = GadgetRegistry::new();
        registry.register(Snapshotter);
        let store = Arc::new(InMemoryMediaStore::new());
        let mut h = harness(registry, |_| {});
        h.scheduler = h.scheduler.with_media(Arc::clone(&store) as Arc<dyn MediaStore>);

        let calls = calls_from("!!!GADGET_START:snapshot\n!!!GADGET_END:");
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert!(records[0].is_success());
        assert_eq!(records[0].media_ids.len(), 1);
        assert!(records[0].result_text().contains(&records[0].media_ids[0]));
        assert_eq!(store.len(), 1);
        // The tree rolls the media ids up.
        assert_eq!(h.tree.subtree_media(&h.root), records[0].media_ids);
    }

    struct Spender;

    #[async_trait]
    impl crate::gadget::Gadget for Spender {
        fn name(&self) -> &str {
            "spender"
        }

        fn description(&self) -> String {
            "reports costs".to_owned()
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: Value,
            ctx: &GadgetContext,
        ) -> std::result::Result<GadgetOutput, GadgetError> {
            ctx.report_cost(0.005);
            Ok(GadgetOutput::with_cost("spent", 0.002))
        }
    }

    #[tokio::test]
    async fn costs_fold_reported_and_returned_amounts() {
        let mut registry = GadgetRegistry::new();
        registry.register(Spender);
        let h = harness(registry, |_| {});

        let calls = calls_from("!!!GADGET_START:spender\n!!!GADGET_END:");
        let records = h
            .scheduler
            .execute_batch(calls, &h.root, &CancelSignal::new(), None)
            .await;

        assert!((records[0].cost - 0.007).abs() < 1e-9);
        assert!((h.tree.subtree_cost(&h.root) - 0.007).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pre_cancelled_signal_aborts_without_running() {
        let mut registry = GadgetRegistry::new();
        registry.register(Calculator);
        let h = harness(registry, |_| {});

        let signal = CancelSignal::new();
        signal.cancel("external stop");
        let calls = calls_from(
            "!!!GADGET_START:Calculator\n!!!ARG:op\nadd\n!!!ARG:a\n1\n!!!ARG:b\n1\n!!!GADGET_END:",
        );
        let records = h.scheduler.execute_batch(calls, &h.root, &signal, None).await;

        assert_eq!(records[0].state, InvocationState::Aborted);
        assert!(records[0].result_text().contains("external stop"));
    }
}
