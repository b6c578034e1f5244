//! Media payloads produced by gadgets.
//!
//! Gadgets that return images, audio, or files hand them to a [`MediaStore`]
//! and reference them by the returned id in the result text the model sees.
//! Deduplication (or upload, or disk spill) is the store's business; the
//! runtime only needs stable ids back.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of binary payload a [`Media`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// An image.
    Image,
    /// An audio clip.
    Audio,
    /// An opaque file.
    File,
}

/// A binary payload produced by a gadget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    /// Payload kind.
    pub kind: MediaKind,
    /// Base64-encoded bytes.
    pub data: String,
    /// MIME type, e.g. `image/png`.
    pub mime: String,
}

impl Media {
    /// Create an image payload.
    #[must_use]
    pub fn image(data: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Image,
            data: data.into(),
            mime: mime.into(),
        }
    }

    /// Create an audio payload.
    #[must_use]
    pub fn audio(data: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Audio,
            data: data.into(),
            mime: mime.into(),
        }
    }

    /// Create a file payload.
    #[must_use]
    pub fn file(data: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::File,
            data: data.into(),
            mime: mime.into(),
        }
    }
}

/// Storage for gadget-produced media.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Store one item and return its stable id. `source` names the producer
    /// (typically the invocation id) for the store's bookkeeping.
    async fn store(&self, item: Media, source: &str) -> String;

    /// Fetch a stored item by id, if the store keeps payloads around.
    async fn get(&self, id: &str) -> Option<Media>;
}

/// A process-local media store.
#[derive(Debug, Default)]
pub struct InMemoryMediaStore {
    items: RwLock<HashMap<String, Media>>,
}

impl InMemoryMediaStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn store(&self, item: Media, _source: &str) -> String {
        let id = format!("media_{}", Uuid::new_v4().simple());
        if let Ok(mut items) = self.items.write() {
            items.insert(id.clone(), item);
        }
        id
    }

    async fn get(&self, id: &str) -> Option<Media> {
        self.items.read().ok().and_then(|items| items.get(id).cloned())
    }
}
