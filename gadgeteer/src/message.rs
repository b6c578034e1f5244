//! Conversation messages and the canonical message log.
//!
//! The [`Conversation`] is the single feed for the next model call. The
//! controller owns it; gadgets never touch it. Completed invocations are
//! recorded as an assistant message carrying the reconstructed marker block
//! followed by one `Result (<id>): …` user message per invocation, in the
//! textual order of the response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::media::{Media, MediaKind};
use crate::parser::MarkerConfig;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instructions for the model.
    System,
    /// Input from the user (including synthetic gadget results).
    User,
    /// Model output.
    Assistant,
}

/// One piece of multimodal content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// An inline image.
    Image {
        /// Base64-encoded bytes.
        data: String,
        /// MIME type.
        mime: String,
    },
    /// An inline audio clip.
    Audio {
        /// Base64-encoded bytes.
        data: String,
        /// MIME type.
        mime: String,
    },
    /// A reference to a stored file.
    FileRef {
        /// Media-store id.
        id: String,
    },
}

impl Part {
    /// A text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

impl Part {
    /// The conversation part for a stored media item. Images and audio are
    /// inlined; files are carried as a reference to their store id.
    #[must_use]
    pub fn from_media(media: Media, store_id: &str) -> Self {
        match media.kind {
            MediaKind::Image => Self::Image {
                data: media.data,
                mime: media.mime,
            },
            MediaKind::Audio => Self::Audio {
                data: media.data,
                mime: media.mime,
            },
            MediaKind::File => Self::FileRef {
                id: store_id.to_owned(),
            },
        }
    }
}

/// Message content: a plain string or a part sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// A plain string.
    Text(String),
    /// A multimodal part sequence.
    Parts(Vec<Part>),
}

impl Content {
    /// The textual content, concatenating text parts.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    Part::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author role.
    pub role: Role,
    /// Content.
    pub content: Content,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub const fn new(role: Role, content: Content) -> Self {
        Self { role, content }
    }

    /// A system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Content::Text(content.into()))
    }

    /// A user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Content::Text(content.into()))
    }

    /// An assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Content::Text(content.into()))
    }

    /// The user message recording one gadget result, media attached as
    /// parts and referenced by id in the text.
    #[must_use]
    pub fn gadget_result(invocation_id: &str, text: &str, media: Vec<Part>) -> Self {
        let body = format!("Result ({invocation_id}): {text}");
        if media.is_empty() {
            Self::user(body)
        } else {
            let mut parts = vec![Part::text(body)];
            parts.extend(media);
            Self::new(Role::User, Content::Parts(parts))
        }
    }

    /// The textual content of this message.
    #[must_use]
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// A one-line advertisement of a gadget for the system prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct GadgetBrief {
    /// Gadget name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Parameter schema.
    pub schema: Value,
}

/// Synthesize the system prompt: the caller's base instructions plus a
/// description of the marker protocol and every registered gadget.
#[must_use]
pub fn synthesize_system_prompt(
    base: Option<&str>,
    markers: &MarkerConfig,
    gadgets: &[GadgetBrief],
) -> String {
    let mut prompt = String::new();
    if let Some(base) = base {
        prompt.push_str(base);
        prompt.push_str("\n\n");
    }

    prompt.push_str("You can invoke gadgets by emitting marker blocks:\n\n");
    prompt.push_str(&format!(
        "{}name:invocation_id:dep1,dep2\n{}parameter/path\nvalue lines\n{}\n\n",
        markers.start_prefix, markers.arg_prefix, markers.end_prefix
    ));
    prompt.push_str(
        "The invocation id and dependency list are optional. Declare a dependency \
         when a gadget needs the result of a peer invocation from the same reply; \
         independent invocations run in parallel. Parameter paths use '/' \
         separators and numeric segments address array elements.\n",
    );

    if !gadgets.is_empty() {
        prompt.push_str("\nAvailable gadgets:\n");
        for gadget in gadgets {
            prompt.push_str(&format!(
                "\n- {}: {}\n  parameters: {}\n",
                gadget.name, gadget.description, gadget.schema
            ));
        }
    }

    prompt
}

/// The ordered message log for one agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Create an empty conversation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Create a conversation seeded with a system message.
    #[must_use]
    pub fn with_system(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(prompt)],
        }
    }

    /// Append a message.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// The message log.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// An owned copy of the log, optionally with an ephemeral trailing
    /// message that is not persisted.
    #[must_use]
    pub fn snapshot(&self, ephemeral: Option<&Message>) -> Vec<Message> {
        let mut messages = self.messages.clone();
        if let Some(extra) = ephemeral {
            messages.push(extra.clone());
        }
        messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    mod content {
        use super::*;

        #[test]
        fn text_of_plain_string() {
            let message = Message::user("hello");
            assert_eq!(message.text(), "hello");
        }

        #[test]
        fn text_of_parts_joins_text_parts_only() {
            let message = Message::new(
                Role::User,
                Content::Parts(vec![
                    Part::text("a"),
                    Part::Image {
                        data: "xx".into(),
                        mime: "image/png".into(),
                    },
                    Part::text("b"),
                ]),
            );
            assert_eq!(message.text(), "ab");
        }

        #[test]
        fn media_converts_to_parts() {
            let part = Part::from_media(Media::image("bytes", "image/png"), "media_1");
            assert!(matches!(part, Part::Image { .. }));
            let part = Part::from_media(Media::file("bytes", "text/csv"), "media_2");
            assert_eq!(part, Part::FileRef { id: "media_2".into() });
        }
    }

    mod gadget_result {
        use super::*;

        #[test]
        fn plain_result_is_text_only() {
            let message = Message::gadget_result("gc_1", "5", Vec::new());
            assert_eq!(message.role, Role::User);
            assert_eq!(message.text(), "Result (gc_1): 5");
        }

        #[test]
        fn media_is_attached_as_parts() {
            let message = Message::gadget_result(
                "gc_2",
                "see media_abc",
                vec![Part::from_media(Media::image("bytes", "image/png"), "media_abc")],
            );
            let Content::Parts(parts) = &message.content else {
                panic!("expected parts");
            };
            assert_eq!(parts.len(), 2);
            assert_eq!(message.text(), "Result (gc_2): see media_abc");
        }
    }

    mod system_prompt {
        use super::*;

        #[test]
        fn includes_base_markers_and_gadgets() {
            let prompt = synthesize_system_prompt(
                Some("Be helpful."),
                &MarkerConfig::default(),
                &[GadgetBrief {
                    name: "calculator".into(),
                    description: "Basic arithmetic".into(),
                    schema: serde_json::json!({"type": "object"}),
                }],
            );
            assert!(prompt.starts_with("Be helpful."));
            assert!(prompt.contains("!!!GADGET_START:"));
            assert!(prompt.contains("calculator"));
            assert!(prompt.contains("Basic arithmetic"));
        }

        #[test]
        fn works_without_base_or_gadgets() {
            let prompt = synthesize_system_prompt(None, &MarkerConfig::default(), &[]);
            assert!(prompt.contains("!!!GADGET_END:"));
            assert!(!prompt.contains("Available gadgets"));
        }
    }

    mod conversation {
        use super::*;

        #[test]
        fn with_system_seeds_the_log() {
            let conversation = Conversation::with_system("rules");
            assert_eq!(conversation.len(), 1);
            assert_eq!(conversation.messages()[0].role, Role::System);
        }

        #[test]
        fn snapshot_appends_ephemeral_without_persisting() {
            let mut conversation = Conversation::new();
            conversation.push(Message::user("hi"));
            let reminder = Message::user("(reminder)");
            let snapshot = conversation.snapshot(Some(&reminder));
            assert_eq!(snapshot.len(), 2);
            assert_eq!(conversation.len(), 1);
        }
    }
}
