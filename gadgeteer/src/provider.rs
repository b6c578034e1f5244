//! The model-provider interface consumed by the runtime.
//!
//! Wire formats live behind [`ModelClient`]: the runtime hands it a request
//! and receives an async stream of [`StreamFrame`]s. Adapters must surface
//! retriable conditions as [`ProviderError::RateLimited`] /
//! [`ProviderError::Transient`](crate::error::ProviderError::Transient) so
//! the retry harness can tell them from fatal failures, and must stop
//! streaming promptly when the given cancellation signal fires.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelSignal;
use crate::error::ProviderError;
use crate::message::Message;
use crate::usage::Usage;

/// A request for one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Model id, e.g. `claude-sonnet-4-5`.
    pub model: String,
    /// The full message log to send.
    pub messages: Vec<Message>,
    /// Optional completion token ceiling.
    pub max_tokens: Option<u32>,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
}

impl ModelRequest {
    /// Create a request.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FinishReason {
    /// Natural end of the reply.
    #[default]
    Stop,
    /// Token limit reached.
    Length,
    /// Content filtered by the provider.
    ContentFilter,
    /// Anything else.
    Other,
}

impl FinishReason {
    /// Parse a provider finish-reason string (case-insensitive; understands
    /// the common OpenAI and Anthropic spellings).
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            _ => Self::Other,
        }
    }
}

/// One frame of a streamed model reply. Fields are optional because a frame
/// may carry any combination of text, usage, and the finish reason.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFrame {
    /// Incremental text.
    pub text_delta: Option<String>,
    /// Usage totals (typically on the final frame).
    pub usage: Option<Usage>,
    /// Set on the final frame.
    pub finish_reason: Option<FinishReason>,
}

impl StreamFrame {
    /// A text-delta frame.
    #[must_use]
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            text_delta: Some(delta.into()),
            ..Self::default()
        }
    }

    /// A final frame with usage and finish reason.
    #[must_use]
    pub fn done(usage: Usage, finish_reason: FinishReason) -> Self {
        Self {
            text_delta: None,
            usage: Some(usage),
            finish_reason: Some(finish_reason),
        }
    }
}

/// A boxed stream of frames, as returned by a provider adapter.
pub type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<StreamFrame, ProviderError>> + Send>>;

/// The provider adapter interface.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Open a streamed model call.
    ///
    /// # Errors
    ///
    /// Fails with a [`ProviderError`] when the stream cannot be opened;
    /// in-stream failures arrive as `Err` items on the returned stream.
    async fn stream(
        &self,
        request: &ModelRequest,
        signal: &CancelSignal,
    ) -> std::result::Result<FrameStream, ProviderError>;
}
