//! The gadget capability interface and registry.
//!
//! A gadget is a named callable: a description and parameter schema that are
//! advertised to the model, plus an async `execute`. Control flow that the
//! runtime must react to — task completion, a question for the human, an
//! observed abort — travels as tagged [`GadgetError`] variants rather than
//! as plain failures; only [`GadgetError::Execution`] takes the generic
//! error path.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::GadgetContext;
use crate::media::Media;
use crate::message::GadgetBrief;

/// What a gadget execution produced.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum GadgetOutput {
    /// A plain text result (cost zero, no media).
    Text(String),
    /// A structured result.
    Structured {
        /// Result text shown to the model.
        result: String,
        /// Cost in USD to fold into the shared ledger.
        cost: Option<f64>,
        /// Media payloads to store and reference.
        media: Vec<Media>,
    },
}

impl GadgetOutput {
    /// A plain text result.
    #[must_use]
    pub fn text(result: impl Into<String>) -> Self {
        Self::Text(result.into())
    }

    /// A structured result with a cost.
    #[must_use]
    pub fn with_cost(result: impl Into<String>, cost: f64) -> Self {
        Self::Structured {
            result: result.into(),
            cost: Some(cost),
            media: Vec::new(),
        }
    }

    /// A structured result with media attachments.
    #[must_use]
    pub fn with_media(result: impl Into<String>, media: Vec<Media>) -> Self {
        Self::Structured {
            result: result.into(),
            cost: None,
            media,
        }
    }

    /// The result text.
    #[must_use]
    pub fn result_text(&self) -> &str {
        match self {
            Self::Text(result) | Self::Structured { result, .. } => result,
        }
    }
}

/// Errors and control-flow signals raised inside a gadget's `execute`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GadgetError {
    /// The task is done; the controller should stop the loop. The message
    /// becomes the invocation's result body.
    #[error("task complete: {0}")]
    TaskComplete(String),

    /// The gadget needs an answer from the human; the executor asks the
    /// collaborator and uses the reply as the gadget's result.
    #[error("needs input: {0}")]
    NeedsInput(String),

    /// The gadget observed its cancellation signal and stopped.
    #[error("aborted: {0}")]
    Aborted(String),

    /// An ordinary execution failure.
    #[error("{0}")]
    Execution(String),
}

impl GadgetError {
    /// An ordinary execution failure.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

/// The core trait every gadget implements.
#[async_trait]
pub trait Gadget: Send + Sync {
    /// The gadget's name, as the model invokes it.
    fn name(&self) -> &str;

    /// A human-readable description, advertised in the system prompt.
    fn description(&self) -> String;

    /// JSON schema for the gadget's parameters. Used for validation and
    /// for coercing string-typed marker values.
    fn parameters_schema(&self) -> Value;

    /// Per-gadget timeout override. `None` uses the agent default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the gadget.
    async fn execute(
        &self,
        args: Value,
        ctx: &GadgetContext,
    ) -> std::result::Result<GadgetOutput, GadgetError>;
}

/// A boxed gadget for registry storage.
pub type BoxedGadget = Box<dyn Gadget>;

/// Owns the gadget instances for the lifetime of an agent.
#[derive(Default)]
pub struct GadgetRegistry {
    gadgets: BTreeMap<String, BoxedGadget>,
}

impl GadgetRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gadget under its own name.
    pub fn register<G: Gadget + 'static>(&mut self, gadget: G) {
        self.gadgets.insert(gadget.name().to_owned(), Box::new(gadget));
    }

    /// Register a boxed gadget.
    pub fn register_boxed(&mut self, gadget: BoxedGadget) {
        self.gadgets.insert(gadget.name().to_owned(), gadget);
    }

    /// Look up a gadget by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&BoxedGadget> {
        self.gadgets.get(name)
    }

    /// All registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.gadgets.keys().cloned().collect()
    }

    /// Whether a name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.gadgets.contains_key(name)
    }

    /// Number of registered gadgets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gadgets.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gadgets.is_empty()
    }

    /// System-prompt briefs for every registered gadget.
    #[must_use]
    pub fn briefs(&self) -> Vec<GadgetBrief> {
        self.gadgets
            .values()
            .map(|gadget| GadgetBrief {
                name: gadget.name().to_owned(),
                description: gadget.description(),
                schema: gadget.parameters_schema(),
            })
            .collect()
    }
}

impl std::fmt::Debug for GadgetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GadgetRegistry")
            .field("gadgets", &self.names())
            .finish()
    }
}

/// Derive a parameter schema from a Rust type, for gadgets whose argument
/// struct carries `#[derive(JsonSchema)]`.
#[must_use]
pub fn schema_of<T: schemars::JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}
