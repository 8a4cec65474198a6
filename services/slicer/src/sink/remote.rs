//! Object store storage.
//!
//! Keys mirror the local layout under a configurable prefix:
//!
//! ```text
//! {prefix}/{label}/sequence{N}/.slot                 reservation marker
//! {prefix}/{label}/sequence{N}/viewA/image{K}.png
//! {prefix}/{label}/sequence{N}/input.webm            (optional)
//! ```
//!
//! Frame uploads run as independent tasks. `write` only waits for a
//! concurrency permit, never for the upload itself, and `finish` collects the
//! outcome of every task so each failed index is reported.

use super::{FrameSink, PersistenceError, SinkReport};
use crate::decoder::Frame;
use crate::object_store::{ObjectMetadata, ObjectStore, ObjectStoreError};
use crate::sequence_allocator::{AllocationError, SequenceSlot, SlotStore};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tracing::{debug, info, warn};

/// Name of the marker object that claims a slot.
const SLOT_MARKER: &str = ".slot";

fn label_prefix(key_prefix: &str, label: &str) -> String {
    let key_prefix = key_prefix.trim_end_matches('/');
    if key_prefix.is_empty() {
        format!("{}/", label)
    } else {
        format!("{}/{}/", key_prefix, label)
    }
}

/// Slot listing and reservation in an object store.
pub struct RemoteSlotStore {
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
}

impl RemoteSlotStore {
    pub fn new(store: Arc<dyn ObjectStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }
}

#[async_trait]
impl SlotStore for RemoteSlotStore {
    async fn list_slot_names(&self, label: &str) -> Result<Vec<String>, AllocationError> {
        let prefix = label_prefix(&self.key_prefix, label);

        let prefixes = self
            .store
            .list_prefixes(&prefix)
            .await
            .map_err(|e| AllocationError::Listing {
                label: label.to_string(),
                message: e.to_string(),
            })?;

        let mut names: Vec<String> = prefixes
            .iter()
            .filter_map(|p| p.strip_prefix(prefix.as_str()))
            .map(|rest| rest.trim_end_matches('/'))
            .filter(|segment| !segment.is_empty())
            .map(String::from)
            .collect();
        names.sort_unstable();
        names.dedup();

        Ok(names)
    }

    async fn reserve(&self, slot: &SequenceSlot) -> Result<bool, AllocationError> {
        let key = format!(
            "{}{}/{}",
            label_prefix(&self.key_prefix, &slot.label),
            slot.dir_name(),
            SLOT_MARKER
        );

        self.store
            .put_if_absent(&key, Bytes::new())
            .await
            .map_err(|e| AllocationError::Reserve {
                slot: slot.to_string(),
                message: e.to_string(),
            })
    }
}

/// Concurrency and retry limits for frame uploads.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub concurrency: usize,
    pub retry_initial_interval: Duration,
    pub retry_max_elapsed: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            concurrency: 10,
            retry_initial_interval: Duration::from_millis(100),
            retry_max_elapsed: Duration::from_secs(10),
        }
    }
}

impl UploadPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.retry_initial_interval,
            current_interval: self.retry_initial_interval,
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..Default::default()
        }
    }
}

/// Upload one object, retrying transient failures with exponential backoff.
async fn upload_with_retry(
    store: Arc<dyn ObjectStore>,
    key: String,
    body: Bytes,
    metadata: Arc<ObjectMetadata>,
    policy: ExponentialBackoff,
) -> Result<(), ObjectStoreError> {
    backoff::future::retry(policy, || {
        let store = store.clone();
        let key = key.clone();
        let body = body.clone();
        let metadata = metadata.clone();
        async move {
            store.upload(&key, body, &metadata).await.map_err(|e| {
                if e.is_transient() {
                    debug!(key = %key, error = %e, "Upload attempt failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

/// Uploads the frames of one slot as concurrent object store writes.
pub struct RemoteObjectSink {
    store: Arc<dyn ObjectStore>,
    slot: SequenceSlot,
    label_prefix: String,
    metadata: Arc<ObjectMetadata>,
    policy: UploadPolicy,
    permits: Arc<Semaphore>,
    uploads: JoinSet<(u32, Result<(), ObjectStoreError>)>,
    in_flight: HashMap<TaskId, u32>,
    report: SinkReport,
    closed: bool,
}

impl RemoteObjectSink {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        key_prefix: &str,
        slot: SequenceSlot,
        metadata: ObjectMetadata,
        policy: UploadPolicy,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(policy.concurrency.max(1)));

        Self {
            store,
            label_prefix: label_prefix(key_prefix, &slot.label),
            slot,
            metadata: Arc::new(metadata),
            policy,
            permits,
            uploads: JoinSet::new(),
            in_flight: HashMap::new(),
            report: SinkReport::default(),
            closed: false,
        }
    }

    /// Object key of a frame.
    pub fn frame_key(&self, index: u32) -> String {
        format!("{}{}", self.label_prefix, self.slot.frame_path(index))
    }

    /// Number of uploads not yet collected.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn record(&mut self, joined: Result<(TaskId, (u32, Result<(), ObjectStoreError>)), JoinError>) {
        match joined {
            Ok((id, (index, Ok(())))) => {
                self.in_flight.remove(&id);
                self.report.record_success(index);
            }
            Ok((id, (index, Err(e)))) => {
                self.in_flight.remove(&id);
                warn!(slot = %self.slot, index, error = %e, "Frame upload failed");
                self.report.record_failure(index, e.to_string());
            }
            Err(join_error) => {
                let Some(index) = self.in_flight.remove(&join_error.id()) else {
                    warn!(error = %join_error, "Upload task without a tracked frame");
                    return;
                };
                let message = if join_error.is_cancelled() {
                    ObjectStoreError::Cancelled(self.frame_key(index)).to_string()
                } else {
                    format!("upload task panicked: {}", join_error)
                };
                warn!(slot = %self.slot, index, error = %message, "Frame upload did not complete");
                self.report.record_failure(index, message);
            }
        }
    }

    /// Collect uploads that already finished without waiting.
    fn reap_finished(&mut self) {
        while let Some(joined) = self.uploads.try_join_next_with_id() {
            self.record(joined);
        }
    }

    fn take_report(&mut self) -> SinkReport {
        self.closed = true;
        let mut report = std::mem::take(&mut self.report);
        report.normalize();
        report
    }
}

#[async_trait]
impl FrameSink for RemoteObjectSink {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn write_source(&mut self, video: Bytes, extension: &str) -> Result<(), PersistenceError> {
        let key = format!("{}{}", self.label_prefix, self.slot.source_path(extension));
        let size_bytes = video.len();

        upload_with_retry(
            self.store.clone(),
            key.clone(),
            video,
            self.metadata.clone(),
            self.policy.backoff(),
        )
        .await
        .map_err(|e| PersistenceError::Upload {
            key: key.clone(),
            message: e.to_string(),
        })?;

        debug!(key = %key, size_bytes, "Source video uploaded");
        Ok(())
    }

    async fn write(&mut self, frame: Frame) -> Result<(), PersistenceError> {
        if self.closed {
            return Err(PersistenceError::Closed);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PersistenceError::Closed)?;

        let key = self.frame_key(frame.index);
        let index = frame.index;
        let upload = upload_with_retry(
            self.store.clone(),
            key,
            frame.data,
            self.metadata.clone(),
            self.policy.backoff(),
        );

        let handle = self.uploads.spawn(async move {
            let result = upload.await;
            drop(permit);
            (index, result)
        });
        self.in_flight.insert(handle.id(), index);

        self.reap_finished();
        Ok(())
    }

    async fn finish(&mut self) -> SinkReport {
        let pending = self.in_flight.len();
        if pending > 0 {
            debug!(slot = %self.slot, pending, "Waiting for outstanding uploads");
        }

        while let Some(joined) = self.uploads.join_next_with_id().await {
            self.record(joined);
        }

        let report = self.take_report();
        info!(
            slot = %self.slot,
            persisted = report.persisted.len(),
            failed = report.failures.len(),
            "Remote sink finished"
        );
        report
    }

    async fn abort(&mut self) -> SinkReport {
        self.uploads.abort_all();
        while let Some(joined) = self.uploads.join_next_with_id().await {
            self.record(joined);
        }
        self.take_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MockObjectStore;
    use crate::testing::InMemoryObjectStore;

    fn frame(index: u32) -> Frame {
        Frame {
            index,
            data: Bytes::from(format!("png-{}", index)),
        }
    }

    fn fast_policy() -> UploadPolicy {
        UploadPolicy {
            concurrency: 4,
            retry_initial_interval: Duration::from_millis(1),
            retry_max_elapsed: Duration::from_millis(200),
        }
    }

    fn no_retry_policy() -> UploadPolicy {
        UploadPolicy {
            retry_max_elapsed: Duration::ZERO,
            ..fast_policy()
        }
    }

    #[test]
    fn test_label_prefix() {
        assert_eq!(label_prefix("input_folder", "cat"), "input_folder/cat/");
        assert_eq!(label_prefix("input_folder/", "cat"), "input_folder/cat/");
        assert_eq!(label_prefix("", "cat"), "cat/");
    }

    #[test]
    fn test_frame_key_layout() {
        let store = Arc::new(InMemoryObjectStore::new());
        let sink = RemoteObjectSink::new(
            store,
            "input_folder",
            SequenceSlot::new("cat", 4),
            ObjectMetadata::new(),
            fast_policy(),
        );

        assert_eq!(sink.frame_key(9), "input_folder/cat/sequence4/viewA/image9.png");
    }

    #[tokio::test]
    async fn test_list_slot_names_uses_child_prefixes() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert("input_folder/cat/sequence1/viewA/image1.png", b"x");
        store.insert("input_folder/cat/sequence1/viewA/image2.png", b"x");
        store.insert("input_folder/cat/sequence3/.slot", b"");
        store.insert("input_folder/cat/sequenceX/viewA/image1.png", b"x");
        store.insert("input_folder/catalog/sequence9/.slot", b"");

        let slots = RemoteSlotStore::new(store, "input_folder");
        let names = slots.list_slot_names("cat").await.unwrap();

        assert_eq!(names, vec!["sequence1", "sequence3", "sequenceX"]);
    }

    #[tokio::test]
    async fn test_list_slot_names_reads_delimited_prefixes() {
        let mut mock = MockObjectStore::new();
        mock.expect_list_prefixes()
            .withf(|prefix| prefix == "input_folder/cat/")
            .times(1)
            .returning(|_| {
                Ok(vec![
                    "input_folder/cat/sequence1/".to_string(),
                    "input_folder/cat/sequence7/".to_string(),
                ])
            });

        let slots = RemoteSlotStore::new(Arc::new(mock), "input_folder");
        let names = slots.list_slot_names("cat").await.unwrap();

        assert_eq!(names, vec!["sequence1", "sequence7"]);
    }

    #[tokio::test]
    async fn test_reserve_is_exclusive() {
        let store = Arc::new(InMemoryObjectStore::new());
        let slots = RemoteSlotStore::new(store.clone(), "input_folder");
        let slot = SequenceSlot::new("cat", 1);

        assert!(slots.reserve(&slot).await.unwrap());
        assert!(!slots.reserve(&slot).await.unwrap());
        assert!(store.get("input_folder/cat/sequence1/.slot").is_some());
    }

    #[tokio::test]
    async fn test_uploads_all_frames() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.set_upload_delay(Duration::from_millis(5));
        let mut metadata = ObjectMetadata::new();
        metadata.insert("sequence-name".to_string(), "morning".to_string());

        let mut sink = RemoteObjectSink::new(
            store.clone(),
            "input_folder",
            SequenceSlot::new("cat", 1),
            metadata,
            fast_policy(),
        );

        for index in 1..=10 {
            sink.write(frame(index)).await.unwrap();
        }
        let report = sink.finish().await;

        assert_eq!(report.persisted, (1..=10).collect::<Vec<_>>());
        assert!(report.is_clean());
        assert_eq!(sink.in_flight(), 0);
        for index in 1..=10 {
            let key = format!("input_folder/cat/sequence1/viewA/image{}.png", index);
            assert_eq!(store.get(&key).unwrap(), Bytes::from(format!("png-{}", index)));
        }
        assert_eq!(
            store
                .metadata("input_folder/cat/sequence1/viewA/image1.png")
                .unwrap()
                .get("sequence-name")
                .map(String::as_str),
            Some("morning")
        );
    }

    #[tokio::test]
    async fn test_every_failed_upload_is_reported() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.fail_uploads("/image2.png", usize::MAX);
        store.fail_uploads("/image5.png", usize::MAX);

        let mut sink = RemoteObjectSink::new(
            store.clone(),
            "input_folder",
            SequenceSlot::new("cat", 1),
            ObjectMetadata::new(),
            no_retry_policy(),
        );

        for index in 1..=6 {
            sink.write(frame(index)).await.unwrap();
        }
        let report = sink.finish().await;

        assert_eq!(report.persisted, vec![1, 3, 4, 6]);
        assert_eq!(report.failed_indices(), vec![2, 5]);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.fail_uploads("/image1.png", 2);

        let mut sink = RemoteObjectSink::new(
            store.clone(),
            "input_folder",
            SequenceSlot::new("cat", 1),
            ObjectMetadata::new(),
            fast_policy(),
        );

        sink.write(frame(1)).await.unwrap();
        let report = sink.finish().await;

        assert_eq!(report.persisted, vec![1]);
        assert_eq!(store.upload_attempts(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_from_mock_store() {
        let mut mock = MockObjectStore::new();
        mock.expect_upload()
            .times(1)
            .returning(|key, _, _| Err(ObjectStoreError::Cancelled(key.to_string())));

        let mut sink = RemoteObjectSink::new(
            Arc::new(mock),
            "input_folder",
            SequenceSlot::new("cat", 1),
            ObjectMetadata::new(),
            fast_policy(),
        );

        sink.write(frame(1)).await.unwrap();
        let report = sink.finish().await;

        assert!(report.persisted.is_empty());
        assert_eq!(report.failed_indices(), vec![1]);
    }

    #[tokio::test]
    async fn test_abort_reports_cancelled_uploads() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.set_upload_delay(Duration::from_secs(30));

        let mut sink = RemoteObjectSink::new(
            store,
            "input_folder",
            SequenceSlot::new("cat", 1),
            ObjectMetadata::new(),
            fast_policy(),
        );

        for index in 1..=3 {
            sink.write(frame(index)).await.unwrap();
        }
        let report = sink.abort().await;

        assert!(report.persisted.is_empty());
        assert_eq!(report.failed_indices(), vec![1, 2, 3]);
        assert!(report.failures[0].message.contains("cancelled"));
        assert_eq!(sink.write(frame(4)).await, Err(PersistenceError::Closed));
    }
}
