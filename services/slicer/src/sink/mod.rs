//! Frame persistence targets.
//!
//! A sink is opened for one allocated [`SequenceSlot`](crate::SequenceSlot),
//! receives that upload's frames in emission order and reports, per frame
//! index, what was persisted and what failed. All sink state is owned by the
//! sink instance, so concurrent uploads never share counters.

pub mod local;
pub mod remote;

use crate::decoder::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

pub use local::{LocalDirectorySink, LocalSlotStore};
pub use remote::{RemoteObjectSink, RemoteSlotStore, UploadPolicy};

/// Errors raised while persisting a frame or the source video.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("failed to write {path}: {message}")]
    Write { path: String, message: String },

    #[error("failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("sink already closed")]
    Closed,
}

/// A frame that could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameFailure {
    pub index: u32,
    pub message: String,
}

/// Outcome of one sink's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkReport {
    /// Persisted frame indices, ascending
    pub persisted: Vec<u32>,

    /// Failed frames, ascending by index
    pub failures: Vec<FrameFailure>,
}

impl SinkReport {
    pub fn record_success(&mut self, index: u32) {
        self.persisted.push(index);
    }

    pub fn record_failure(&mut self, index: u32, message: impl Into<String>) {
        self.failures.push(FrameFailure {
            index,
            message: message.into(),
        });
    }

    /// Sort both lists by frame index.
    pub fn normalize(&mut self) {
        self.persisted.sort_unstable();
        self.persisted.dedup();
        self.failures.sort_by_key(|f| f.index);
    }

    /// Mark every index in `1..=emitted` that has no outcome yet as failed.
    pub fn record_unaccounted(&mut self, emitted: u32, message: &str) {
        let missing: Vec<u32> = (1..=emitted)
            .filter(|index| {
                !self.persisted.contains(index) && !self.failures.iter().any(|f| f.index == *index)
            })
            .collect();
        for index in missing {
            self.record_failure(index, message);
        }
        self.normalize();
    }

    pub fn persisted_count(&self) -> u32 {
        self.persisted.len() as u32
    }

    pub fn failed_indices(&self) -> Vec<u32> {
        self.failures.iter().map(|f| f.index).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Persistence target for the frames of one sequence slot.
#[async_trait]
pub trait FrameSink: Send {
    /// Sink name for logging
    fn name(&self) -> &'static str;

    /// Persist the raw uploaded video next to the frames.
    async fn write_source(&mut self, video: Bytes, extension: &str) -> Result<(), PersistenceError>;

    /// Accept one frame.
    ///
    /// An error means the sink cannot take further frames and the caller must
    /// stop feeding it.
    async fn write(&mut self, frame: Frame) -> Result<(), PersistenceError>;

    /// Wait for every accepted frame to be persisted or to fail and return
    /// the final report.
    async fn finish(&mut self) -> SinkReport;

    /// Cancel outstanding work and return what is known so far. Cancelled
    /// frames are reported as failures.
    async fn abort(&mut self) -> SinkReport;
}
