//! Keyed storage for the generated basis-column frames.
//!
//! Each construction unit puts exactly one frame under its own key while the
//! units run in parallel, so the store must accept concurrent writers. Nothing
//! reads from it until every unit has finished.

use crate::data::TrainingFrame;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static FIT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A key-addressed store for intermediate frames.
pub trait ArtifactStore: Send + Sync {
    /// Stores `frame` under `key`, replacing any previous value.
    fn put(&self, key: &str, frame: TrainingFrame);

    fn get(&self, key: &str) -> Option<Arc<TrainingFrame>>;

    /// Removes `key`, returning whether it was present.
    fn remove(&self, key: &str) -> bool;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// Process-local `ArtifactStore` backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    frames: DashMap<String, Arc<TrainingFrame>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// All keys currently held, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.frames.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl ArtifactStore for InMemoryStore {
    fn put(&self, key: &str, frame: TrainingFrame) {
        self.frames.insert(key.to_string(), Arc::new(frame));
    }

    fn get(&self, key: &str) -> Option<Arc<TrainingFrame>> {
        self.frames.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn remove(&self, key: &str) -> bool {
        self.frames.remove(key).is_some()
    }
}

/// A key prefix no other fit in this process shares:
/// `"{model_key}_{process_id}_{sequence}"`.
///
/// Fits sharing one store never overwrite or remove each other's frames.
pub fn unique_fit_key(model_key: &str) -> String {
    let sequence = FIT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{model_key}_{}_{sequence}", std::process::id())
}

/// Key of the generated frame for predictor `column` within the fit `model_key`.
pub fn gam_frame_key(model_key: &str, column: &str) -> String {
    format!("{model_key}_gamcols_{column}")
}
