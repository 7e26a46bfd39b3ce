//! Layer cache
//!
//! Maps layer digests to the record of the layer produced under that
//! digest. Entries are never invalidated by time: a digest is a pure
//! function of its inputs. They are only removed when cleanup deletes the
//! layer image.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    pub digest: String,
    pub parent: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl LayerRecord {
    pub fn new(digest: &str, parent: Option<&str>, size_bytes: u64) -> Self {
        Self {
            digest: digest.to_string(),
            parent: parent.map(str::to_string),
            size_bytes,
            created_at: Utc::now(),
        }
    }
}

#[derive(Default)]
pub struct LayerCache {
    layers: RwLock<HashMap<String, LayerRecord>>,
}

impl LayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, digest: &str) -> Option<LayerRecord> {
        self.layers.read().await.get(digest).cloned()
    }

    pub async fn insert(&self, record: LayerRecord) {
        self.layers
            .write()
            .await
            .entry(record.digest.clone())
            .or_insert(record);
    }

    pub async fn remove(&self, digest: &str) -> Option<LayerRecord> {
        self.layers.write().await.remove(digest)
    }

    /// Whether any cached layer was built on top of `digest`
    pub async fn has_children(&self, digest: &str) -> bool {
        self.layers
            .read()
            .await
            .values()
            .any(|r| r.parent.as_deref() == Some(digest))
    }

    pub async fn len(&self) -> usize {
        self.layers.read().await.len()
    }
}
