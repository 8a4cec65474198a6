//! Local directory tree storage.
//!
//! Layout under the configured base path:
//!
//! ```text
//! {base}/{label}/sequence{N}/viewA/image{K}.png
//! {base}/{label}/sequence{N}/input.webm      (optional)
//! ```

use super::{FrameSink, PersistenceError, SinkReport};
use crate::decoder::Frame;
use crate::sequence_allocator::{AllocationError, SequenceSlot, SlotStore, VIEW_DIR};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

/// Slot listing and reservation on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalSlotStore {
    base_path: PathBuf,
}

impl LocalSlotStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn label_root(&self, label: &str) -> PathBuf {
        self.base_path.join(label)
    }

    /// Open a sink writing into an already reserved slot.
    pub fn open_sink(&self, slot: &SequenceSlot) -> LocalDirectorySink {
        LocalDirectorySink::new(self.label_root(&slot.label), slot.clone())
    }
}

#[async_trait]
impl SlotStore for LocalSlotStore {
    async fn list_slot_names(&self, label: &str) -> Result<Vec<String>, AllocationError> {
        let root = self.label_root(label);
        let listing_error = |e: std::io::Error| AllocationError::Listing {
            label: label.to_string(),
            message: format!("{}: {}", root.display(), e),
        };

        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(listing_error(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(listing_error)? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }

        Ok(names)
    }

    async fn reserve(&self, slot: &SequenceSlot) -> Result<bool, AllocationError> {
        let root = self.label_root(&slot.label);
        let slot_dir = root.join(slot.dir_name());
        let reserve_error = |e: std::io::Error| AllocationError::Reserve {
            slot: slot.to_string(),
            message: e.to_string(),
        };

        fs::create_dir_all(&root).await.map_err(reserve_error)?;

        // Exclusive create is the claim; the view directory is created after
        // so a reserved slot is always complete before it is handed out
        match fs::create_dir(&slot_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(reserve_error(e)),
        }

        fs::create_dir_all(slot_dir.join(VIEW_DIR))
            .await
            .map_err(reserve_error)?;

        Ok(true)
    }
}

/// Writes frames as PNG files into one slot directory.
pub struct LocalDirectorySink {
    label_root: PathBuf,
    slot: SequenceSlot,
    report: SinkReport,
    closed: bool,
}

impl LocalDirectorySink {
    pub fn new(label_root: PathBuf, slot: SequenceSlot) -> Self {
        Self {
            label_root,
            slot,
            report: SinkReport::default(),
            closed: false,
        }
    }

    pub fn frame_path(&self, index: u32) -> PathBuf {
        self.label_root.join(self.slot.frame_path(index))
    }

    fn take_report(&mut self) -> SinkReport {
        self.closed = true;
        let mut report = std::mem::take(&mut self.report);
        report.normalize();
        report
    }
}

/// Write and fsync a file so it is durable once this returns.
async fn write_synced(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let write_error = |e: std::io::Error| PersistenceError::Write {
        path: path.display().to_string(),
        message: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(write_error)?;
    }

    let mut file = fs::File::create(path).await.map_err(write_error)?;
    file.write_all(data).await.map_err(write_error)?;
    file.flush().await.map_err(write_error)?;
    file.sync_all().await.map_err(write_error)?;

    Ok(())
}

#[async_trait]
impl FrameSink for LocalDirectorySink {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn write_source(&mut self, video: Bytes, extension: &str) -> Result<(), PersistenceError> {
        let path = self.label_root.join(self.slot.source_path(extension));
        write_synced(&path, &video).await?;
        debug!(path = %path.display(), size_bytes = video.len(), "Source video written");
        Ok(())
    }

    async fn write(&mut self, frame: Frame) -> Result<(), PersistenceError> {
        if self.closed {
            return Err(PersistenceError::Closed);
        }

        let path = self.frame_path(frame.index);
        match write_synced(&path, &frame.data).await {
            Ok(()) => {
                self.report.record_success(frame.index);
                Ok(())
            }
            Err(e) => {
                error!(slot = %self.slot, index = frame.index, error = %e, "Frame write failed");
                self.report.record_failure(frame.index, e.to_string());
                Err(e)
            }
        }
    }

    async fn finish(&mut self) -> SinkReport {
        self.take_report()
    }

    async fn abort(&mut self) -> SinkReport {
        self.take_report()
    }
}
