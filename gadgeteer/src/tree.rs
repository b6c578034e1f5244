//! The execution tree: an append-only record of everything an agent did.
//!
//! Nodes are LLM calls, gadget invocations, and text fragments. The tree is
//! the single source of truth for observers and cost roll-ups: completion
//! only fills in result fields, never removes or reorders nodes. A subagent
//! writes into the *same* tree as its parent — the spawning gadget node
//! becomes the parent of the child's root LLM call — so subscribers watch
//! the whole hierarchy interleaved in real time.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::message::Message;
use crate::usage::Usage;

/// Unique id of a tree node.
pub type NodeId = String;

/// Payload of one node.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum NodeKind {
    /// One model call.
    LlmCall {
        /// 1-based iteration number within its agent.
        iteration: usize,
        /// Model id used.
        model: String,
        /// The message log sent with the call.
        request: Vec<Message>,
        /// Full response text, filled at completion.
        response: Option<String>,
        /// Token usage, filled at completion.
        usage: Option<Usage>,
        /// Priced cost in USD, filled at completion.
        cost: Option<f64>,
    },
    /// One gadget invocation.
    Gadget {
        /// Invocation id, unique within the parent LLM call.
        invocation_id: String,
        /// Gadget name.
        name: String,
        /// Coerced arguments.
        args: Value,
        /// Declared dependency ids.
        dependencies: Vec<String>,
        /// Result text, on success.
        result: Option<String>,
        /// Error text, on failure.
        error: Option<String>,
        /// Whether the invocation was skipped rather than run.
        skipped: bool,
        /// Media-store ids the invocation produced.
        media: Vec<String>,
        /// Aggregated cost in USD.
        cost: Option<f64>,
        /// Whether the gadget has been dispatched.
        started: bool,
    },
    /// A prose fragment attached to an LLM call.
    Text {
        /// The text.
        content: String,
    },
}

/// One node of the execution tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    /// Unique id.
    pub id: NodeId,
    /// Parent node, `None` for the root LLM call.
    pub parent_id: Option<NodeId>,
    /// Distance from the root (root = 0; children inherit parent + 1).
    pub depth: usize,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Completion timestamp, `None` until the node completes.
    pub completed_at: Option<SystemTime>,
    /// Node payload.
    pub kind: NodeKind,
}

impl TreeNode {
    /// The node's own cost contribution in USD.
    #[must_use]
    pub fn cost(&self) -> f64 {
        match &self.kind {
            NodeKind::LlmCall { cost, .. } | NodeKind::Gadget { cost, .. } => cost.unwrap_or(0.0),
            NodeKind::Text { .. } => 0.0,
        }
    }
}

/// A change notification delivered to subscribers, in application order.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TreeEvent {
    /// A node was appended.
    Added(TreeNode),
    /// A node's completion fields changed.
    Updated(TreeNode),
}

/// Fields recorded when a gadget invocation reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GadgetCompletion {
    /// Result text, on success.
    pub result: Option<String>,
    /// Error text, on failure.
    pub error: Option<String>,
    /// Whether the invocation was skipped.
    pub skipped: bool,
    /// Aggregated cost in USD.
    pub cost: f64,
    /// Media-store ids produced.
    pub media: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: Vec<TreeNode>,
    index: HashMap<NodeId, usize>,
    children: HashMap<NodeId, Vec<NodeId>>,
    subscribers: Vec<mpsc::UnboundedSender<TreeEvent>>,
}

impl Inner {
    fn notify(&mut self, event: &TreeEvent) {
        self.subscribers
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn append(&mut self, node: TreeNode) -> NodeId {
        let id = node.id.clone();
        if let Some(parent) = &node.parent_id {
            self.children.entry(parent.clone()).or_default().push(id.clone());
        }
        self.index.insert(id.clone(), self.nodes.len());
        let event = TreeEvent::Added(node.clone());
        self.nodes.push(node);
        self.notify(&event);
        id
    }

    fn depth_of(&self, parent: Option<&NodeId>) -> usize {
        parent
            .and_then(|id| self.index.get(id))
            .map_or(0, |&i| self.nodes[i].depth + 1)
    }
}

/// The append-only, thread-safe execution tree.
#[derive(Debug, Default)]
pub struct ExecutionTree {
    inner: RwLock<Inner>,
}

impl ExecutionTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to node-change events.
    ///
    /// Deltas arrive in the order they were applied to the tree.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TreeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inner) = self.inner.write() {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Append an LLM-call node. `parent` is `None` for an agent's root call
    /// and the spawning gadget's node id for a subagent.
    pub fn add_llm_call(
        &self,
        parent: Option<&NodeId>,
        iteration: usize,
        model: impl Into<String>,
        request: Vec<Message>,
    ) -> NodeId {
        let Ok(mut inner) = self.inner.write() else {
            return NodeId::new();
        };
        let depth = inner.depth_of(parent);
        inner.append(TreeNode {
            id: new_id(),
            parent_id: parent.cloned(),
            depth,
            created_at: SystemTime::now(),
            completed_at: None,
            kind: NodeKind::LlmCall {
                iteration,
                model: model.into(),
                request,
                response: None,
                usage: None,
                cost: None,
            },
        })
    }

    /// Fill an LLM-call node's completion fields.
    pub fn complete_llm_call(
        &self,
        id: &NodeId,
        call_usage: Usage,
        call_cost: f64,
        response_text: impl Into<String>,
    ) {
        self.update(id, |node| {
            if let NodeKind::LlmCall {
                response,
                usage,
                cost,
                ..
            } = &mut node.kind
            {
                *response = Some(response_text.into());
                *usage = Some(call_usage);
                *cost = Some(call_cost);
                node.completed_at = Some(SystemTime::now());
            }
        });
    }

    /// Append a gadget node under its emitting LLM call.
    pub fn add_gadget(
        &self,
        parent_llm: &NodeId,
        invocation_id: impl Into<String>,
        name: impl Into<String>,
        args: Value,
        dependencies: Vec<String>,
    ) -> NodeId {
        let Ok(mut inner) = self.inner.write() else {
            return NodeId::new();
        };
        let depth = inner.depth_of(Some(parent_llm));
        inner.append(TreeNode {
            id: new_id(),
            parent_id: Some(parent_llm.clone()),
            depth,
            created_at: SystemTime::now(),
            completed_at: None,
            kind: NodeKind::Gadget {
                invocation_id: invocation_id.into(),
                name: name.into(),
                args,
                dependencies,
                result: None,
                error: None,
                skipped: false,
                media: Vec::new(),
                cost: None,
                started: false,
            },
        })
    }

    /// Mark a gadget node as dispatched.
    pub fn start_gadget(&self, id: &NodeId) {
        self.update(id, |node| {
            if let NodeKind::Gadget { started, .. } = &mut node.kind {
                *started = true;
            }
        });
    }

    /// Fill a gadget node's terminal fields.
    pub fn complete_gadget(&self, id: &NodeId, completion: GadgetCompletion) {
        self.update(id, |node| {
            if let NodeKind::Gadget {
                result,
                error,
                skipped,
                media,
                cost,
                ..
            } = &mut node.kind
            {
                *result = completion.result.clone();
                *error = completion.error.clone();
                *skipped = completion.skipped;
                *media = completion.media.clone();
                *cost = Some(completion.cost);
                node.completed_at = Some(SystemTime::now());
            }
        });
    }

    /// Append a text node under an LLM call.
    pub fn add_text(&self, parent_llm: &NodeId, content: impl Into<String>) -> NodeId {
        let Ok(mut inner) = self.inner.write() else {
            return NodeId::new();
        };
        let depth = inner.depth_of(Some(parent_llm));
        inner.append(TreeNode {
            id: new_id(),
            parent_id: Some(parent_llm.clone()),
            depth,
            created_at: SystemTime::now(),
            completed_at: Some(SystemTime::now()),
            kind: NodeKind::Text {
                content: content.into(),
            },
        })
    }

    /// A point-in-time copy of one node.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<TreeNode> {
        let inner = self.inner.read().ok()?;
        inner.index.get(id).map(|&i| inner.nodes[i].clone())
    }

    /// Total number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.nodes.len()).unwrap_or(0)
    }

    /// Whether the tree is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time copy of all nodes, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TreeNode> {
        self.inner
            .read()
            .map(|inner| inner.nodes.clone())
            .unwrap_or_default()
    }

    /// Sum of costs in the subtree rooted at `id` (the node included).
    ///
    /// Each node contributes exactly once, so subagent costs never double
    /// count.
    #[must_use]
    pub fn subtree_cost(&self, id: &NodeId) -> f64 {
        let Ok(inner) = self.inner.read() else {
            return 0.0;
        };
        let mut total = 0.0;
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(&i) = inner.index.get(&current) {
                total += inner.nodes[i].cost();
            }
            if let Some(children) = inner.children.get(&current) {
                stack.extend(children.iter().cloned());
            }
        }
        total
    }

    /// All media-store ids produced in the subtree rooted at `id`.
    #[must_use]
    pub fn subtree_media(&self, id: &NodeId) -> Vec<String> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(&i) = inner.index.get(&current)
                && let NodeKind::Gadget { media, .. } = &inner.nodes[i].kind
            {
                out.extend(media.iter().cloned());
            }
            if let Some(children) = inner.children.get(&current) {
                stack.extend(children.iter().cloned());
            }
        }
        out
    }

    /// Find a gadget node by invocation id among the direct children of one
    /// LLM call. Invocation ids are only unique within their parent call,
    /// so the lookup is deliberately scoped.
    #[must_use]
    pub fn node_by_invocation_id(&self, parent_llm: &NodeId, invocation_id: &str) -> Option<TreeNode> {
        let inner = self.inner.read().ok()?;
        let children = inner.children.get(parent_llm)?;
        children.iter().find_map(|child| {
            let &i = inner.index.get(child)?;
            let node = &inner.nodes[i];
            match &node.kind {
                NodeKind::Gadget {
                    invocation_id: id, ..
                } if id == invocation_id => Some(node.clone()),
                _ => None,
            }
        })
    }

    fn update(&self, id: &NodeId, mutate: impl FnOnce(&mut TreeNode)) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        let Some(&i) = inner.index.get(id) else { return };
        mutate(&mut inner.nodes[i]);
        let event = TreeEvent::Updated(inner.nodes[i].clone());
        inner.notify(&event);
    }
}

fn new_id() -> NodeId {
    format!("node_{}", Uuid::new_v4().simple())
}
