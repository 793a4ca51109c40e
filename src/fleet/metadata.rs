//! Sprite metadata store - process-local persistence for tags and intent
//!
//! Sprite state itself is rebuilt from the worker API on startup, but tags
//! and desired status are Lattice-local; they live in a sled tree keyed by
//! `sprite_metadata/<id>` with JSON values, and are restored before each
//! sprite process starts. The schema is stable.

use crate::sprite::state::SpriteStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

const KEY_NAMESPACE: &str = "sprite_metadata/";

/// Metadata store errors
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted per-sprite metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpriteMetadata {
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub desired_status: Option<SpriteStatus>,
}

/// sled-backed key/value store for sprite metadata.
#[derive(Clone)]
pub struct MetadataStore {
    db: sled::Db,
}

impl MetadataStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        Ok(Self { db: sled::open(path)? })
    }

    /// In-memory store for tests.
    pub fn temporary() -> Result<Self, MetadataError> {
        Ok(Self { db: sled::Config::new().temporary(true).open()? })
    }

    fn key(sprite_id: &str) -> String {
        format!("{KEY_NAMESPACE}{sprite_id}")
    }

    /// Fetch metadata for one sprite. `None` when never persisted.
    pub fn get(&self, sprite_id: &str) -> Result<Option<SpriteMetadata>, MetadataError> {
        match self.db.get(Self::key(sprite_id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist metadata for one sprite, replacing any previous value.
    pub fn put(&self, sprite_id: &str, metadata: &SpriteMetadata) -> Result<(), MetadataError> {
        let raw = serde_json::to_vec(metadata)?;
        self.db.insert(Self::key(sprite_id), raw)?;
        debug!(sprite_id = sprite_id, "Sprite metadata persisted");
        Ok(())
    }

    /// Delete metadata for one sprite. Deleting an absent key is a no-op.
    pub fn delete(&self, sprite_id: &str) -> Result<(), MetadataError> {
        self.db.remove(Self::key(sprite_id))?;
        Ok(())
    }

    /// All sprite ids with persisted metadata.
    pub fn sprite_ids(&self) -> Vec<String> {
        self.db
            .scan_prefix(KEY_NAMESPACE)
            .keys()
            .filter_map(|k| k.ok())
            .filter_map(|k| {
                String::from_utf8(k.to_vec())
                    .ok()
                    .and_then(|s| s.strip_prefix(KEY_NAMESPACE).map(String::from))
            })
            .collect()
    }
}
