//! Storage backend selection.

use crate::config::{Config, StorageBackendKind};
use crate::object_store::{ObjectMetadata, ObjectStore, S3ObjectStore};
use crate::sequence_allocator::{SequenceSlot, SlotStore};
use crate::sink::{FrameSink, LocalSlotStore, RemoteObjectSink, RemoteSlotStore, UploadPolicy};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Where slots are allocated and frames are written.
#[derive(Clone)]
pub enum StorageBackend {
    /// Directory tree on the local filesystem
    Local { slots: LocalSlotStore },

    /// Object store such as S3
    Remote {
        store: Arc<dyn ObjectStore>,
        key_prefix: String,
        policy: UploadPolicy,
    },
}

impl StorageBackend {
    pub fn local(base_path: impl Into<PathBuf>) -> Self {
        StorageBackend::Local {
            slots: LocalSlotStore::new(base_path),
        }
    }

    pub fn remote(
        store: Arc<dyn ObjectStore>,
        key_prefix: impl Into<String>,
        policy: UploadPolicy,
    ) -> Self {
        StorageBackend::Remote {
            store,
            key_prefix: key_prefix.into(),
            policy,
        }
    }

    /// Build the backend selected in configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        match config.storage.backend {
            StorageBackendKind::Local => {
                let base_path = &config.local.base_path;
                tokio::fs::create_dir_all(base_path)
                    .await
                    .with_context(|| format!("Failed to create {}", base_path.display()))?;

                info!(base_path = %base_path.display(), "Using local storage backend");
                Ok(Self::local(base_path.clone()))
            }
            StorageBackendKind::S3 => {
                let s3 = config.s3.as_ref().context("Missing s3 configuration")?;
                let store = S3ObjectStore::new(s3)
                    .await
                    .context("Failed to initialize S3 object store")?;

                let policy = UploadPolicy {
                    concurrency: s3.upload_concurrency,
                    retry_initial_interval: s3.upload_retry_initial(),
                    retry_max_elapsed: s3.upload_retry_max_elapsed(),
                };

                info!(
                    bucket = %store.bucket(),
                    key_prefix = %s3.key_prefix,
                    concurrency = policy.concurrency,
                    "Using S3 storage backend"
                );
                Ok(Self::remote(Arc::new(store), s3.key_prefix.clone(), policy))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Local { .. } => "local",
            StorageBackend::Remote { .. } => "remote",
        }
    }

    /// Slot store used by the sequence allocator
    pub fn slot_store(&self) -> Arc<dyn SlotStore> {
        match self {
            StorageBackend::Local { slots } => Arc::new(slots.clone()),
            StorageBackend::Remote {
                store, key_prefix, ..
            } => Arc::new(RemoteSlotStore::new(store.clone(), key_prefix.clone())),
        }
    }

    /// Open a sink for a reserved slot. `metadata` is attached to remote
    /// objects and ignored locally.
    pub fn open_sink(&self, slot: &SequenceSlot, metadata: ObjectMetadata) -> Box<dyn FrameSink> {
        match self {
            StorageBackend::Local { slots } => Box::new(slots.open_sink(slot)),
            StorageBackend::Remote {
                store,
                key_prefix,
                policy,
            } => Box::new(RemoteObjectSink::new(
                store.clone(),
                key_prefix,
                slot.clone(),
                metadata,
                policy.clone(),
            )),
        }
    }
}
