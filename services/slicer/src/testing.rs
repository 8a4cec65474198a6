//! Test doubles shared by the unit tests.

use crate::decoder::{DecodeError, FrameStream, VideoDecoder};
use crate::object_store::{ObjectMetadata, ObjectStore, ObjectStoreError};
use crate::png_stream::tests::fake_png;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Object store kept in memory, with failure injection.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Bytes, ObjectMetadata)>>,
    hidden_prefixes: Mutex<Vec<String>>,
    /// Key suffix -> number of upload attempts that still fail
    failures: Mutex<HashMap<String, usize>>,
    upload_delay: Mutex<Option<Duration>>,
    upload_attempts: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, body: &[u8]) {
        self.objects
            .lock()
            .insert(key.to_string(), (Bytes::copy_from_slice(body), ObjectMetadata::new()));
    }

    /// Keys under `prefix` are left out of listings.
    pub fn hide_from_listing(&self, prefix: &str) {
        self.hidden_prefixes.lock().push(prefix.to_string());
    }

    /// Fail the next `times` uploads of any key ending in `suffix`.
    pub fn fail_uploads(&self, suffix: &str, times: usize) {
        self.failures.lock().insert(suffix.to_string(), times);
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock() = Some(delay);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).map(|(body, _)| body.clone())
    }

    pub fn metadata(&self, key: &str) -> Option<ObjectMetadata> {
        self.objects.lock().get(key).map(|(_, metadata)| metadata.clone())
    }

    pub fn upload_attempts(&self) -> usize {
        self.upload_attempts.load(Ordering::SeqCst)
    }

    fn take_failure(&self, key: &str) -> bool {
        let mut failures = self.failures.lock();
        for (suffix, remaining) in failures.iter_mut() {
            if key.ends_with(suffix.as_str()) && *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.upload_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure(key) {
            return Err(ObjectStoreError::Request {
                operation: "put_object",
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }

        self.objects
            .lock()
            .insert(key.to_string(), (body, metadata.clone()));
        Ok(())
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let hidden = self.hidden_prefixes.lock().clone();
        let mut prefixes: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|key| !hidden.iter().any(|h| key.starts_with(h.as_str())))
            .filter_map(|key| key.strip_prefix(prefix))
            .filter_map(|rest| rest.split_once('/'))
            .map(|(segment, _)| format!("{}{}/", prefix, segment))
            .collect();
        prefixes.sort_unstable();
        prefixes.dedup();
        Ok(prefixes)
    }

    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<bool, ObjectStoreError> {
        let mut objects = self.objects.lock();
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), (body, ObjectMetadata::new()));
        Ok(true)
    }
}

/// Decoder that emits a fixed number of fake PNG frames, optionally followed
/// by an engine failure.
pub struct ScriptedDecoder {
    pub frames: u32,
    pub fail_after: Option<u32>,
    pub frame_delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl ScriptedDecoder {
    pub fn new(frames: u32) -> Self {
        Self {
            frames,
            fail_after: None,
            frame_delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_after(frames: u32) -> Self {
        Self {
            fail_after: Some(frames),
            ..Self::new(frames)
        }
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VideoDecoder for ScriptedDecoder {
    async fn decode(&self, _video: Bytes) -> Result<FrameStream, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (tx, stream) = FrameStream::channel(2);
        let frames = self.frames;
        let fail_after = self.fail_after;
        let frame_delay = self.frame_delay;

        tokio::spawn(async move {
            for n in 1..=frames {
                if let Some(delay) = frame_delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(Bytes::from(fake_png(n)))).await.is_err() {
                    return;
                }
            }
            if fail_after.is_some() {
                let _ = tx
                    .send(Err(DecodeError::Engine("corrupt packet".to_string())))
                    .await;
            }
        });

        Ok(stream)
    }
}
