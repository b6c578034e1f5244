//! The agent iteration loop.
//!
//! One [`Agent`] owns one conversation and drives it to termination:
//!
//! 1. Snapshot the conversation (plus an optional ephemeral trailer) and let
//!    the pre-call controller hook skip, modify, or proceed.
//! 2. Reserve a rate-limit slot and open the model stream through the retry
//!    harness.
//! 3. Feed every chunk through the marker parser, emitting prose as
//!    [`AgentEvent::Text`] in stream order.
//! 4. Classify the closed response: invocations go to the scheduler,
//!    invocation-free prose goes to the text-only policy.
//! 5. Append the assistant message and the per-invocation result messages
//!    (textual order), update cost, re-check bounds, and loop.
//!
//! Bounds are evaluated in a fixed order at the top of every iteration:
//! external cancellation, budget, iteration limit. Task completion is
//! observed on the scheduler's records. The run ends with a single
//! [`AgentEvent::Terminated`]; cancellation is a terminal event, not an
//! error.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt as _;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument as _;

use crate::cancel::CancelSignal;
use crate::cost::{CostLedger, ModelPricing};
use crate::error::Error;
use crate::gadget::GadgetRegistry;
use crate::hooks::{
    BeforeLlmCall, GadgetInterceptor, HumanInput, LlmCallDecision, Observer, TextOnlyAction,
    TextOnlyPolicy,
};
use crate::media::MediaStore;
use crate::message::{Conversation, Message, synthesize_system_prompt};
use crate::parser::{GadgetCall, MarkerParser};
use crate::provider::{ModelClient, ModelRequest};
use crate::ratelimit::RateTracker;
use crate::retry::RetryHarness;
use crate::scheduler::{InvocationRecord, Scheduler};
use crate::tree::{ExecutionTree, NodeId};
use crate::usage::Usage;

use super::config::AgentConfig;
use super::events::{AgentEvent, AgentStream, TerminationReason};

/// A configured agent: the controller task plus its conversation, registry,
/// accumulators, and tree handle. Built with
/// [`AgentBuilder`](super::AgentBuilder); consumed by [`run`](Agent::run).
pub struct Agent {
    pub(super) config: Arc<AgentConfig>,
    pub(super) registry: Arc<GadgetRegistry>,
    pub(super) client: Option<Arc<dyn ModelClient>>,
    pub(super) pricing: Option<Arc<dyn ModelPricing>>,
    pub(super) tree: Arc<ExecutionTree>,
    pub(super) tree_parent: Option<NodeId>,
    pub(super) ledger: Arc<CostLedger>,
    pub(super) rate: Arc<RateTracker>,
    pub(super) retry: Arc<RetryHarness>,
    pub(super) signal: CancelSignal,
    pub(super) controller: Option<Arc<dyn BeforeLlmCall>>,
    pub(super) observers: Vec<Arc<dyn Observer>>,
    pub(super) human: Option<Arc<dyn HumanInput>>,
    pub(super) media: Option<Arc<dyn MediaStore>>,
    pub(super) interceptor: Option<Arc<dyn GadgetInterceptor>>,
    pub(super) ephemeral: Option<Message>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Either a scheduler lifecycle event or the finished batch.
enum BatchStep {
    Event(AgentEvent),
    Done(Vec<InvocationRecord>),
}

impl Agent {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> super::AgentBuilder {
        super::AgentBuilder::new()
    }

    /// The shared execution tree.
    #[must_use]
    pub fn tree(&self) -> Arc<ExecutionTree> {
        Arc::clone(&self.tree)
    }

    /// The shared cost ledger.
    #[must_use]
    pub fn ledger(&self) -> Arc<CostLedger> {
        Arc::clone(&self.ledger)
    }

    /// The external cancellation signal for this run.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    /// Run the agent on a task, consuming it.
    ///
    /// Returns the event stream; the final item is always
    /// [`AgentEvent::Terminated`] unless a fatal provider or programming
    /// error ends the stream early.
    #[must_use]
    pub fn run(self, task: impl Into<String>) -> AgentStream {
        let task = task.into();
        let span = info_span!(
            "agent",
            agent.name = %self.config.name,
            agent.model = %self.config.model,
            agent.max_iterations = self.config.max_iterations,
        );
        Box::pin(self.run_inner(task).instrument(span))
    }

    #[allow(clippy::too_many_lines)]
    fn run_inner(self, task: String) -> impl futures::Stream<Item = Result<AgentEvent, Error>> + Send {
        try_stream! {
            let agent = self;
            let client = agent
                .client
                .clone()
                .ok_or_else(|| Error::internal("no model client configured"))?;

            let system_prompt = synthesize_system_prompt(
                agent.config.system_prompt.as_deref(),
                &agent.config.markers,
                &agent.registry.briefs(),
            );
            let mut conversation = Conversation::with_system(system_prompt);
            conversation.push(Message::user(task));

            let scheduler = agent.build_scheduler();
            let mut iteration: usize = 0;

            info!(agent = %agent.config.name, "agent run started");

            loop {
                // Bound checks, in order: cancellation, budget, iteration
                // limit. Task completion is handled on scheduler records.
                if agent.signal.is_cancelled() {
                    info!(reason = %agent.signal.reason_or_default(), "run cancelled");
                    yield AgentEvent::Terminated { reason: TerminationReason::Cancelled };
                    return;
                }
                if let Some(budget) = agent.config.budget
                    && agent.ledger.total() >= budget
                {
                    info!(budget, spent = agent.ledger.total(), "budget exhausted");
                    yield AgentEvent::Terminated { reason: TerminationReason::BudgetExhausted };
                    return;
                }
                if iteration >= agent.config.max_iterations {
                    warn!(max = agent.config.max_iterations, "iteration limit reached");
                    yield AgentEvent::Terminated { reason: TerminationReason::IterationLimit };
                    return;
                }

                let mut messages = conversation.snapshot(agent.ephemeral.as_ref());

                // Pre-call controller hook: skip, proceed, or modify. A skip
                // makes no model call and does not advance the counter.
                if let Some(controller) = &agent.controller {
                    match controller.before_llm_call(iteration + 1, &messages).await {
                        LlmCallDecision::Proceed => {}
                        LlmCallDecision::Skip => {
                            debug!("controller hook skipped this call");
                            tokio::task::yield_now().await;
                            continue;
                        }
                        LlmCallDecision::Modify(replacement) => messages = replacement,
                    }
                }

                let iter_signal = agent.signal.child();
                for observer in &agent.observers {
                    observer.on_iteration_start(iteration + 1).await;
                }

                // Reserve a rate-limit slot against an estimate, reconciled
                // with the provider-reported usage after the call.
                let estimate = estimate_tokens(&messages);
                let Some(reservation) = agent.rate.acquire(estimate, &iter_signal).await else {
                    yield AgentEvent::Terminated { reason: TerminationReason::Cancelled };
                    return;
                };

                iteration += 1;
                let llm_signal = iter_signal.child();
                let llm_node = agent.tree.add_llm_call(
                    agent.tree_parent.as_ref(),
                    iteration,
                    &agent.config.model,
                    messages.clone(),
                );

                yield AgentEvent::LlmCallStarted {
                    iteration,
                    model: agent.config.model.clone(),
                };
                for observer in &agent.observers {
                    observer.on_llm_call_start(iteration, &agent.config.model).await;
                }

                let request = ModelRequest::new(&agent.config.model, messages);
                let mut frames = agent
                    .retry
                    .run(|| client.stream(&request, &llm_signal))
                    .await
                    .map_err(|e| {
                        error!(error = %e, iteration, "model stream failed");
                        e
                    })?;

                let mut parser =
                    MarkerParser::new(agent.config.markers.clone(), format!("resp_{iteration}"));
                let mut raw_response = String::new();
                let mut prose = String::new();
                let mut usage = Usage::zero();

                while let Some(frame) = frames.next().await {
                    let frame = frame?;
                    if let Some(delta) = &frame.text_delta {
                        raw_response.push_str(delta);
                        let emitted = parser.feed(delta);
                        if !emitted.is_empty() {
                            prose.push_str(&emitted);
                            for observer in &agent.observers {
                                observer.on_text(&emitted).await;
                            }
                            yield AgentEvent::Text(emitted);
                        }
                    }
                    if let Some(frame_usage) = frame.usage {
                        usage += frame_usage;
                    }
                }

                let (tail, calls) = parser.finish();
                if !tail.is_empty() {
                    prose.push_str(&tail);
                    for observer in &agent.observers {
                        observer.on_text(&tail).await;
                    }
                    yield AgentEvent::Text(tail);
                }

                let call_cost = agent
                    .pricing
                    .as_ref()
                    .and_then(|pricing| pricing.price(&agent.config.model, &usage))
                    .unwrap_or(0.0);
                agent.ledger.add(call_cost);
                agent.rate.reconcile(reservation, &usage).await;
                agent
                    .tree
                    .complete_llm_call(&llm_node, usage, call_cost, raw_response);

                yield AgentEvent::LlmCallCompleted {
                    iteration,
                    usage,
                    cost: call_cost,
                };
                for observer in &agent.observers {
                    observer.on_llm_call_end(iteration, &usage, call_cost).await;
                }

                if !prose.is_empty() {
                    agent.tree.add_text(&llm_node, prose.clone());
                }

                // A stream that ended because of cancellation schedules
                // nothing; the next bound check terminates the run.
                if agent.signal.is_cancelled() {
                    continue;
                }

                if calls.is_empty() {
                    conversation.push(Message::assistant(prose.clone()));
                    match agent.handle_text_only(&prose).await {
                        TextOnlyOutcome::Terminate => {
                            info!(iteration, "text-only reply, terminating");
                            yield AgentEvent::Terminated { reason: TerminationReason::Completed };
                            return;
                        }
                        TextOnlyOutcome::Continue(reply) => {
                            conversation.push(Message::user(reply));
                        }
                    }
                    for observer in &agent.observers {
                        observer.on_iteration_end(iteration).await;
                    }
                    continue;
                }

                // Prose accompanying invocations: wrapped as a trailing
                // synthetic invocation, or inlined as the assistant preamble.
                let wrapper = agent.wrapper_call(&prose, iteration);
                let inline_preamble = !prose.is_empty() && wrapper.is_none();

                let mut assistant_text = String::new();
                if inline_preamble {
                    assistant_text.push_str(&prose);
                    assistant_text.push_str("\n\n");
                }
                let mut rendered: Vec<String> = calls
                    .iter()
                    .map(|call| call.render(&agent.config.markers))
                    .collect();
                if let Some(wrapper_call) = &wrapper {
                    rendered.push(wrapper_call.render(&agent.config.markers));
                }
                assistant_text.push_str(&rendered.join("\n"));
                conversation.push(Message::assistant(assistant_text));

                // Execute the batch, forwarding scheduler events as they
                // happen; the wrapper (if any) runs strictly afterwards.
                let (event_tx, mut event_rx) = mpsc::unbounded_channel();
                let mut records = {
                    let batch = scheduler.execute_batch(
                        calls,
                        &llm_node,
                        &iter_signal,
                        Some(&event_tx),
                    );
                    tokio::pin!(batch);
                    loop {
                        let step = tokio::select! {
                            biased;
                            Some(event) = event_rx.recv() => BatchStep::Event(event),
                            finished = &mut batch => BatchStep::Done(finished),
                        };
                        match step {
                            BatchStep::Event(event) => {
                                agent.observe_invocation_event(&event).await;
                                yield event;
                            }
                            BatchStep::Done(finished) => break finished,
                        }
                    }
                };
                while let Ok(event) = event_rx.try_recv() {
                    agent.observe_invocation_event(&event).await;
                    yield event;
                }

                if let Some(wrapper_call) = wrapper {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let trailing = scheduler
                        .execute_batch(vec![wrapper_call], &llm_node, &iter_signal, Some(&tx))
                        .await;
                    while let Ok(event) = rx.try_recv() {
                        agent.observe_invocation_event(&event).await;
                        yield event;
                    }
                    records.extend(trailing);
                }

                // Result messages preserve the textual order of the
                // response regardless of completion order.
                for record in &records {
                    conversation.push(Message::gadget_result(
                        &record.call.invocation_id,
                        &record.result_text(),
                        record.media_parts.clone(),
                    ));
                }

                for observer in &agent.observers {
                    observer.on_iteration_end(iteration).await;
                }

                if records.iter().any(|record| record.breaks_loop) {
                    info!(iteration, "task completion asserted");
                    yield AgentEvent::Terminated { reason: TerminationReason::TaskComplete };
                    return;
                }
            }
        }
    }

    fn build_scheduler(&self) -> Scheduler {
        let mut scheduler = Scheduler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
            Arc::clone(&self.tree),
            Arc::clone(&self.ledger),
            Arc::clone(&self.rate),
        );
        if let Some(client) = &self.client {
            scheduler = scheduler.with_client(Arc::clone(client));
        }
        if let Some(pricing) = &self.pricing {
            scheduler = scheduler.with_pricing(Arc::clone(pricing));
        }
        if let Some(human) = &self.human {
            scheduler = scheduler.with_human(Arc::clone(human));
        }
        if let Some(media) = &self.media {
            scheduler = scheduler.with_media(Arc::clone(media));
        }
        if let Some(interceptor) = &self.interceptor {
            scheduler = scheduler.with_interceptor(Arc::clone(interceptor));
        }
        scheduler
    }

    /// The synthetic trailing invocation wrapping accompanying prose, when
    /// the agent is configured with a text-wrapping gadget.
    fn wrapper_call(&self, prose: &str, iteration: usize) -> Option<GadgetCall> {
        if prose.trim().is_empty() {
            return None;
        }
        let name = self.config.text_wrapper_gadget.as_ref()?;
        Some(GadgetCall {
            gadget_name: name.clone(),
            invocation_id: format!("gc_text_{iteration}"),
            dependencies: Vec::new(),
            raw_args: format!("{}text\n{}", self.config.markers.arg_prefix, prose),
            args: serde_json::json!({ "text": prose }),
            parse_error: None,
            response_id: format!("resp_{iteration}"),
        })
    }

    async fn handle_text_only(&self, prose: &str) -> TextOnlyOutcome {
        match &self.config.text_only_policy {
            TextOnlyPolicy::Terminate => TextOnlyOutcome::Terminate,
            TextOnlyPolicy::Acknowledge => TextOnlyOutcome::Continue("continue".to_owned()),
            TextOnlyPolicy::WaitForInput => match &self.human {
                Some(human) => match human.ask(prose).await {
                    Some(answer) => TextOnlyOutcome::Continue(answer),
                    None => TextOnlyOutcome::Terminate,
                },
                None => {
                    warn!("wait_for_input policy without a human-input collaborator");
                    TextOnlyOutcome::Terminate
                }
            },
            TextOnlyPolicy::Custom(handler) => match handler.on_text_only(prose).await {
                TextOnlyAction::Terminate => TextOnlyOutcome::Terminate,
                TextOnlyAction::Reply(reply) => TextOnlyOutcome::Continue(reply),
            },
        }
    }

    async fn observe_invocation_event(&self, event: &AgentEvent) {
        match event {
            AgentEvent::InvocationStarted {
                invocation_id,
                gadget,
            } => {
                for observer in &self.observers {
                    observer.on_gadget_start(invocation_id, gadget).await;
                }
            }
            AgentEvent::InvocationCompleted {
                invocation_id,
                gadget,
                success,
                ..
            } => {
                for observer in &self.observers {
                    observer.on_gadget_end(invocation_id, gadget, *success).await;
                }
            }
            _ => {}
        }
    }
}

/// What the text-only policy decided.
enum TextOnlyOutcome {
    Terminate,
    Continue(String),
}

/// Rough token estimate for rate-limit reservation: characters over four.
fn estimate_tokens(messages: &[Message]) -> u64 {
    let chars: usize = messages.iter().map(|m| m.text().len()).sum();
    (chars / 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_scales_with_text() {
        let messages = vec![Message::user("a".repeat(400))];
        assert_eq!(estimate_tokens(&messages), 100);
        assert_eq!(estimate_tokens(&[]), 0);
    }
}
