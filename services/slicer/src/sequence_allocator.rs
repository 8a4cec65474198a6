//! Per-label sequence number allocation.
//!
//! Every upload is stored under `{label}/sequence{N}`. The next `N` is one
//! past the highest existing sequence for the label. Allocation is serialized
//! per label inside the process and additionally backed by an exclusive
//! reserve in the storage layer, so two uploads for the same label never end
//! up in the same slot even across processes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Directory / key segment prefix of a sequence slot.
pub const SEQUENCE_PREFIX: &str = "sequence";

/// Sub-directory holding the frames of a slot.
pub const VIEW_DIR: &str = "viewA";

/// Errors that can occur during allocation.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("failed to list sequences for label {label}: {message}")]
    Listing { label: String, message: String },

    #[error("failed to reserve {slot}: {message}")]
    Reserve { slot: String, message: String },

    #[error("no free sequence for label {label} after {attempts} attempts")]
    Exhausted { label: String, attempts: u32 },
}

/// An allocated, exclusive destination for one upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceSlot {
    /// Storage-safe label
    pub label: String,

    /// 1-based sequence number
    pub sequence_number: u32,
}

impl SequenceSlot {
    pub fn new(label: impl Into<String>, sequence_number: u32) -> Self {
        Self {
            label: label.into(),
            sequence_number,
        }
    }

    /// Name of the slot directory, e.g. `sequence3`.
    pub fn dir_name(&self) -> String {
        format!("{}{}", SEQUENCE_PREFIX, self.sequence_number)
    }

    /// Path of a frame relative to the label root.
    pub fn frame_path(&self, index: u32) -> String {
        format!("{}/{}/image{}.png", self.dir_name(), VIEW_DIR, index)
    }

    /// Path of the raw source video relative to the label root.
    pub fn source_path(&self, extension: &str) -> String {
        format!("{}/input.{}", self.dir_name(), extension)
    }
}

impl std::fmt::Display for SequenceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.label, self.dir_name())
    }
}

/// Storage operations the allocator needs.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Names of the entries directly below the label root. A missing label
    /// root is an empty listing, not an error.
    async fn list_slot_names(&self, label: &str) -> Result<Vec<String>, AllocationError>;

    /// Atomically claim `slot`. Returns `false` if it already exists.
    async fn reserve(&self, slot: &SequenceSlot) -> Result<bool, AllocationError>;
}

/// Parse the number out of a `sequence<N>` entry name.
///
/// Anything else, including `sequence0` and non-numeric suffixes, is `None`.
pub fn parse_sequence_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(SEQUENCE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse::<u32>().ok().filter(|n| *n > 0)
}

/// Map a caller-supplied label to a single safe path component.
pub fn sanitize_path_component(component: &str) -> String {
    component
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Allocates sequence slots on top of a [`SlotStore`].
pub struct SequenceAllocator {
    store: Arc<dyn SlotStore>,
    max_attempts: u32,
    label_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SequenceAllocator {
    pub fn new(store: Arc<dyn SlotStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            label_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Next free sequence number for `label` without reserving anything.
    pub async fn next_sequence_number(&self, label: &str) -> Result<u32, AllocationError> {
        let names = self.store.list_slot_names(label).await?;

        let highest = names
            .iter()
            .filter_map(|name| {
                let parsed = parse_sequence_number(name);
                if parsed.is_none() && name.starts_with(SEQUENCE_PREFIX) {
                    debug!(label, entry = %name, "Ignoring malformed sequence entry");
                }
                parsed
            })
            .max()
            .unwrap_or(0);

        Ok(highest + 1)
    }

    /// Allocate and reserve the next slot for `label`.
    #[instrument(skip(self))]
    pub async fn allocate(&self, label: &str) -> Result<SequenceSlot, AllocationError> {
        let lock = self.label_lock(label);
        let result = {
            let _guard = lock.lock().await;
            self.reserve_next(label).await
        };
        self.release_label_lock(label, lock);
        result
    }

    async fn reserve_next(&self, label: &str) -> Result<SequenceSlot, AllocationError> {
        let mut candidate = self.next_sequence_number(label).await?;

        for attempt in 1..=self.max_attempts {
            let slot = SequenceSlot::new(label, candidate);

            if self.store.reserve(&slot).await? {
                info!(slot = %slot, attempt, "Sequence slot allocated");
                return Ok(slot);
            }

            // Another process claimed it between listing and reserving
            warn!(slot = %slot, attempt, "Sequence slot already taken, trying next");
            candidate += 1;
        }

        Err(AllocationError::Exhausted {
            label: label.to_string(),
            attempts: self.max_attempts,
        })
    }

    fn label_lock(&self, label: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.label_locks.lock();
        locks
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the label's lock entry once no other allocation holds or awaits it.
    fn release_label_lock(&self, label: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.label_locks.lock();
        // Clones are only taken under the map lock: the map and `lock` are the
        // last two owners when the count is 2
        if Arc::strong_count(&lock) == 2 {
            locks.remove(label);
        }
    }

    /// Number of labels with a live lock entry.
    #[cfg(test)]
    fn tracked_labels(&self) -> usize {
        self.label_locks.lock().len()
    }
}
