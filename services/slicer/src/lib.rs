//! Slicer Service
//!
//! Accepts video uploads, decodes them into still frames at a fixed rate and
//! stores the frames under a newly allocated, per-label sequence slot.
//!
//! ## Architecture
//!
//! ```text
//! HTTP upload            Decoder                  Storage
//! ┌──────────────┐      ┌──────────────┐         ┌──────────────────────────┐
//! │ POST         │      │ ffmpeg       │ frames  │ {label}/                 │
//! │ /api/v1/     │─────▶│ image2pipe   │────────▶│   sequence{N}/           │
//! │ upload       │      │ (png, 20fps) │         │     viewA/image{K}.png   │
//! └──────────────┘      └──────────────┘         └──────────────────────────┘
//!        │                                                  ▲
//!        ▼                                                  │
//! ┌──────────────┐      ┌──────────────┐                    │
//! │ Orchestrator │─────▶│ Sequence     │────────────────────┘
//! │              │      │ Allocator    │   reserve slot
//! └──────────────┘      └──────────────┘
//! ```
//!
//! Storage is either a local directory tree or an S3 bucket. Local writes are
//! awaited one by one; remote uploads run concurrently and their failures are
//! reported per frame index.

pub mod api;
pub mod backend;
pub mod config;
pub mod decoder;
pub mod object_store;
pub mod orchestrator;
pub mod png_stream;
pub mod sequence_allocator;
pub mod sink;

#[cfg(test)]
mod testing;

pub use api::{AppState, UploadResponse, UploadStatus};
pub use backend::StorageBackend;
pub use config::Config;
pub use decoder::{DecodeError, FfmpegDecoder, Frame, FrameStream, VideoDecoder};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use orchestrator::{
    Orchestrator, PipelineError, PipelineResult, PipelineSettings, PipelineStage, UploadRequest,
};
pub use sequence_allocator::{SequenceAllocator, SequenceSlot};
pub use sink::{FrameSink, SinkReport};
