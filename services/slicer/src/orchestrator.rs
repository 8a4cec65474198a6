//! Upload pipeline.
//!
//! One [`Orchestrator::process`] call handles one upload end to end:
//!
//! ```text
//! Validating -> Allocating -> Decoding -> Completed
//!      \             \            \
//!       +-------------+------------+---> Failed
//! ```
//!
//! Frames flow from the decoder's [`FrameStream`](crate::decoder::FrameStream)
//! straight into the slot's [`FrameSink`]. Decoding and persistence together
//! are bounded by the configured timeout; on expiry the frame stream is
//! dropped, which stops the engine, and the sink is aborted.

use crate::backend::StorageBackend;
use crate::config::Config;
use crate::decoder::{DecodeError, VideoDecoder};
use crate::object_store::ObjectMetadata;
use crate::sequence_allocator::{
    sanitize_path_component, AllocationError, SequenceAllocator, SequenceSlot,
};
use crate::sink::{FrameSink, PersistenceError, SinkReport};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const MAX_SEQUENCE_NAME_LEN: usize = 128;

/// A raw upload as received from the client.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub video: Option<Bytes>,
    pub label: Option<String>,
    pub sequence_name: Option<String>,
}

/// Upload after input validation.
#[derive(Debug, Clone)]
struct ValidatedUpload {
    video: Bytes,
    label: String,
    sequence_name: Option<String>,
}

impl UploadRequest {
    fn validate(self) -> Result<ValidatedUpload, PipelineError> {
        let video = match self.video {
            Some(video) if !video.is_empty() => video,
            _ => return Err(PipelineError::ClientInput("No file uploaded".to_string())),
        };

        let label = self
            .label
            .as_deref()
            .map(sanitize_path_component)
            .filter(|label| !label.is_empty())
            .ok_or_else(|| PipelineError::ClientInput("No label provided".to_string()))?;

        let sequence_name = match self.sequence_name.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) if name.chars().count() > MAX_SEQUENCE_NAME_LEN => {
                return Err(PipelineError::ClientInput(format!(
                    "Sequence name longer than {} characters",
                    MAX_SEQUENCE_NAME_LEN
                )))
            }
            // Sent as object metadata, which only carries printable ASCII
            Some(name) if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) => {
                return Err(PipelineError::ClientInput(
                    "Sequence name must be printable ASCII".to_string(),
                ))
            }
            Some(name) => Some(name.to_string()),
        };

        Ok(ValidatedUpload {
            video,
            label,
            sequence_name,
        })
    }
}

/// Pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Validating,
    Allocating,
    Decoding,
    Completed,
    Failed,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Validating => "validating",
            PipelineStage::Allocating => "allocating",
            PipelineStage::Decoding => "decoding",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// First fatal error of a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    ClientInput(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to persist source video: {0}")]
    Source(PersistenceError),

    #[error("failed to persist frames {indices:?}: {message}")]
    Persistence { indices: Vec<u32>, message: String },

    #[error("pipeline timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    /// True for errors caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::ClientInput(_))
    }

    /// Stage in which this error is raised.
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::ClientInput(_) => PipelineStage::Validating,
            PipelineError::Allocation(_) => PipelineStage::Allocating,
            _ => PipelineStage::Decoding,
        }
    }

    /// Short name used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ClientInput(_) => "client_input",
            PipelineError::Allocation(_) => "allocation",
            PipelineError::Decode(DecodeError::InvalidInput { .. }) => "decode_input",
            PipelineError::Decode(_) => "decode_engine",
            PipelineError::Source(_) | PipelineError::Persistence { .. } => "persistence",
            PipelineError::Timeout(_) => "timeout",
        }
    }
}

/// Summary of one pipeline run.
#[derive(Debug)]
pub struct PipelineResult {
    pub request_id: Uuid,

    /// `Completed` or `Failed`
    pub stage: PipelineStage,

    pub slot: Option<SequenceSlot>,

    /// Frames emitted by the decoder
    pub frame_count: u32,

    pub report: SinkReport,

    pub error: Option<PipelineError>,
}

impl PipelineResult {
    fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            stage: PipelineStage::Validating,
            slot: None,
            frame_count: 0,
            report: SinkReport::default(),
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.stage == PipelineStage::Completed
    }

    /// Stage the run failed in, if it failed.
    pub fn failed_stage(&self) -> Option<PipelineStage> {
        self.error.as_ref().map(PipelineError::stage)
    }

    fn fail(mut self, error: PipelineError) -> Self {
        self.stage = PipelineStage::Failed;
        self.error = Some(error);
        self
    }
}

/// Orchestrator knobs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Upper bound for decoding plus persistence
    pub timeout: Duration,
    pub persist_source_video: bool,
    /// Extension used for the persisted source video
    pub source_extension: String,
    pub max_allocation_attempts: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            persist_source_video: false,
            source_extension: "webm".to_string(),
            max_allocation_attempts: 16,
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.pipeline_timeout(),
            persist_source_video: config.storage.persist_source_video,
            source_extension: config.decoder.input_format.clone(),
            max_allocation_attempts: config.pipeline.max_allocation_attempts,
        }
    }
}

/// What the decode loop produced.
struct DriveOutcome {
    error: Option<PipelineError>,
    report: SinkReport,
}

/// Runs uploads through decode, allocation and persistence.
pub struct Orchestrator {
    decoder: Arc<dyn VideoDecoder>,
    backend: StorageBackend,
    allocator: SequenceAllocator,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        decoder: Arc<dyn VideoDecoder>,
        backend: StorageBackend,
        settings: PipelineSettings,
    ) -> Self {
        let allocator =
            SequenceAllocator::new(backend.slot_store(), settings.max_allocation_attempts);
        Self {
            decoder,
            backend,
            allocator,
            settings,
        }
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Process one upload and return its summary. Never panics on bad input;
    /// every outcome is reported through the result.
    pub async fn process(&self, request: UploadRequest) -> PipelineResult {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "upload",
            %request_id,
            label = request.label.as_deref().unwrap_or_default(),
            backend = self.backend.name(),
        );

        let started = Instant::now();
        let result = self.run(request_id, request).instrument(span).await;
        record_metrics(&result, started.elapsed());
        result
    }

    async fn run(&self, request_id: Uuid, request: UploadRequest) -> PipelineResult {
        let mut result = PipelineResult::new(request_id);

        let upload = match request.validate() {
            Ok(upload) => upload,
            Err(e) => {
                warn!(error = %e, "Rejected upload");
                return result.fail(e);
            }
        };

        result.stage = PipelineStage::Allocating;
        let slot = match self.allocator.allocate(&upload.label).await {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "Sequence allocation failed");
                return result.fail(e.into());
            }
        };
        info!(
            slot = %slot,
            sequence_name = upload.sequence_name.as_deref().unwrap_or_default(),
            size_bytes = upload.video.len(),
            "Allocated sequence"
        );
        result.slot = Some(slot.clone());

        result.stage = PipelineStage::Decoding;
        let mut sink = self
            .backend
            .open_sink(&slot, object_metadata(request_id, &slot, &upload));
        let mut emitted = 0u32;

        let timed = tokio::time::timeout(
            self.settings.timeout,
            self.drive(upload.video, sink.as_mut(), &mut emitted),
        )
        .await;

        let outcome = match timed {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    timeout = ?self.settings.timeout,
                    emitted,
                    "Pipeline timed out, aborting sink"
                );
                let mut report = sink.abort().await;
                report.record_unaccounted(emitted, "not persisted before timeout");
                DriveOutcome {
                    error: Some(PipelineError::Timeout(self.settings.timeout)),
                    report,
                }
            }
        };

        result.frame_count = emitted;
        result.report = outcome.report;

        // Decoder and timeout errors come first; persistence failures only
        // decide the outcome when nothing else went wrong
        let error = outcome.error.or_else(|| {
            result
                .report
                .failures
                .first()
                .map(|first| PipelineError::Persistence {
                    indices: result.report.failed_indices(),
                    message: first.message.clone(),
                })
        });

        match error {
            Some(e) => {
                error!(
                    slot = %slot,
                    frame_count = result.frame_count,
                    persisted = result.report.persisted_count(),
                    failed = result.report.failures.len(),
                    error = %e,
                    "Upload failed"
                );
                result.fail(e)
            }
            None => {
                info!(
                    slot = %slot,
                    frame_count = result.frame_count,
                    "Upload sliced"
                );
                result.stage = PipelineStage::Completed;
                result
            }
        }
    }

    /// Feed every decoded frame into the sink, then close it.
    async fn drive(
        &self,
        video: Bytes,
        sink: &mut dyn FrameSink,
        emitted: &mut u32,
    ) -> DriveOutcome {
        if self.settings.persist_source_video {
            if let Err(e) = sink
                .write_source(video.clone(), &self.settings.source_extension)
                .await
            {
                return DriveOutcome {
                    error: Some(PipelineError::Source(e)),
                    report: sink.finish().await,
                };
            }
        }

        let mut frames = match self.decoder.decode(video).await {
            Ok(frames) => frames,
            Err(e) => {
                return DriveOutcome {
                    error: Some(e.into()),
                    report: sink.finish().await,
                }
            }
        };

        let mut error = None;
        while let Some(next) = frames.next_frame().await {
            match next {
                Ok(frame) => {
                    *emitted = frame.index;
                    let index = frame.index;
                    if let Err(e) = sink.write(frame).await {
                        // Already recorded in the sink report
                        debug!(index, sink = sink.name(), error = %e, "Sink stopped accepting frames");
                        break;
                    }
                }
                Err(e) => {
                    error = Some(e.into());
                    break;
                }
            }
        }
        drop(frames);

        DriveOutcome {
            error,
            report: sink.finish().await,
        }
    }
}

fn object_metadata(request_id: Uuid, slot: &SequenceSlot, upload: &ValidatedUpload) -> ObjectMetadata {
    let mut metadata = ObjectMetadata::new();
    metadata.insert("label".to_string(), slot.label.clone());
    metadata.insert("sequence".to_string(), slot.sequence_number.to_string());
    metadata.insert("request-id".to_string(), request_id.to_string());
    metadata.insert("uploaded-at".to_string(), Utc::now().to_rfc3339());
    if let Some(name) = &upload.sequence_name {
        metadata.insert("sequence-name".to_string(), name.clone());
    }
    metadata
}

fn record_metrics(result: &PipelineResult, elapsed: Duration) {
    metrics::histogram!("slicer.pipeline.duration_seconds").record(elapsed.as_secs_f64());
    metrics::counter!("slicer.frames.emitted").increment(u64::from(result.frame_count));
    metrics::counter!("slicer.frames.persisted")
        .increment(u64::from(result.report.persisted_count()));
    metrics::counter!("slicer.frames.failed").increment(result.report.failures.len() as u64);

    match &result.error {
        None => metrics::counter!("slicer.uploads.completed").increment(1),
        Some(e) => metrics::counter!("slicer.uploads.failed", "kind" => e.kind()).increment(1),
    }
}
