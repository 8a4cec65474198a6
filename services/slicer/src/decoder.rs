//! Video decoding into a lazy stream of PNG frames.
//!
//! Decoding is delegated to an `ffmpeg` subprocess. The uploaded video is fed
//! through stdin, the engine resamples it to a fixed frame rate and writes one
//! PNG per sampled frame to stdout, and a reader task forwards each complete
//! image through a bounded channel. The bounded channel is what provides
//! backpressure: when persistence falls behind, the reader stops draining the
//! pipe and the engine blocks on its writes.

use crate::config::DecoderConfig;
use crate::png_stream::PngStreamSplitter;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Maximum amount of engine diagnostic text kept for error reports.
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// Read size for the engine's stdout pipe.
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// EBML header magic shared by WebM and Matroska containers.
const EBML_MAGIC: [u8; 4] = [0x1a, 0x45, 0xdf, 0xa3];

/// Errors that can occur while decoding a video.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The engine could not parse the input as the declared container.
    #[error("invalid {format} input: {message}")]
    InvalidInput { format: String, message: String },

    /// The engine failed while decoding.
    #[error("decode engine failed: {0}")]
    Engine(String),

    /// The engine process could not be started.
    #[error("failed to start decode engine `{program}`: {message}")]
    Spawn { program: String, message: String },

    /// I/O failure on the engine pipes.
    #[error("decode engine I/O error: {0}")]
    Io(String),
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 1-based position in emission order
    pub index: u32,

    /// PNG-encoded image
    pub data: Bytes,
}

/// Ordered, finite stream of frames produced by one decode.
///
/// Indices are assigned here rather than by the producer, so every consumer
/// sees 1, 2, 3, ... with no gaps. After the producer reports an error the
/// stream yields that error once and then ends; it cannot be restarted.
pub struct FrameStream {
    rx: mpsc::Receiver<Result<Bytes, DecodeError>>,
    emitted: u32,
    finished: bool,
}

impl FrameStream {
    /// Create a stream together with the sender the producer feeds.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Bytes, DecodeError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                rx,
                emitted: 0,
                finished: false,
            },
        )
    }

    /// Number of frames handed out so far.
    pub fn emitted(&self) -> u32 {
        self.emitted
    }

    /// Receive the next frame.
    pub async fn next_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        futures::future::poll_fn(|cx| self.poll_frame(cx)).await
    }

    fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Frame, DecodeError>>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(data))) => {
                self.emitted += 1;
                Poll::Ready(Some(Ok(Frame {
                    index: self.emitted,
                    data,
                })))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                self.rx.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for FrameStream {
    type Item = Result<Frame, DecodeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_frame(cx)
    }
}

/// Source of frame streams for the orchestrator.
#[async_trait]
pub trait VideoDecoder: Send + Sync {
    /// Start decoding `video`. The returned stream is driven independently of
    /// this call.
    async fn decode(&self, video: Bytes) -> Result<FrameStream, DecodeError>;
}

/// Decoder settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct DecoderSettings {
    pub ffmpeg_path: String,
    pub input_format: String,
    pub frame_rate: u32,
    pub frame_buffer: usize,
}

impl From<&DecoderConfig> for DecoderSettings {
    fn from(config: &DecoderConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            input_format: config.input_format.clone(),
            frame_rate: config.frame_rate,
            frame_buffer: config.frame_buffer,
        }
    }
}

/// `ffmpeg`-backed decoder.
pub struct FfmpegDecoder {
    settings: DecoderSettings,
}

impl FfmpegDecoder {
    pub fn new(settings: DecoderSettings) -> Self {
        Self { settings }
    }

    /// Arguments passed to the engine for one decode.
    pub fn command_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            self.settings.input_format.clone(),
            "-i".to_string(),
            "pipe:0".to_string(),
            "-vf".to_string(),
            format!("fps={}", self.settings.frame_rate),
            "-f".to_string(),
            "image2pipe".to_string(),
            "-vcodec".to_string(),
            "png".to_string(),
            "pipe:1".to_string(),
        ]
    }

    /// Reject input that cannot be the declared container before paying for a
    /// subprocess.
    fn check_container(&self, video: &[u8]) -> Result<(), DecodeError> {
        let format = self.settings.input_format.to_lowercase();
        let expects_ebml = matches!(format.as_str(), "webm" | "matroska" | "matroska,webm");

        if video.is_empty() {
            return Err(DecodeError::InvalidInput {
                format,
                message: "empty input".to_string(),
            });
        }

        if expects_ebml && !video.starts_with(&EBML_MAGIC) {
            return Err(DecodeError::InvalidInput {
                format,
                message: "missing EBML header".to_string(),
            });
        }

        Ok(())
    }

    fn spawn_engine(&self) -> Result<Child, DecodeError> {
        Command::new(&self.settings.ffmpeg_path)
            .args(self.command_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DecodeError::Spawn {
                program: self.settings.ffmpeg_path.clone(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl VideoDecoder for FfmpegDecoder {
    async fn decode(&self, video: Bytes) -> Result<FrameStream, DecodeError> {
        self.check_container(&video)?;

        let child = self.spawn_engine()?;
        let (tx, stream) = FrameStream::channel(self.settings.frame_buffer);

        info!(
            input_bytes = video.len(),
            input_format = %self.settings.input_format,
            frame_rate = self.settings.frame_rate,
            "Decode engine started"
        );

        tokio::spawn(run_engine(
            child,
            video,
            self.settings.input_format.clone(),
            tx,
        ));

        Ok(stream)
    }
}

/// Feed the engine, split its output and forward frames until it exits.
async fn run_engine(
    mut child: Child,
    video: Bytes,
    input_format: String,
    tx: mpsc::Sender<Result<Bytes, DecodeError>>,
) {
    let (Some(mut stdin), Some(mut stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = tx
            .send(Err(DecodeError::Io("engine pipes unavailable".to_string())))
            .await;
        return;
    };

    let writer = tokio::spawn(async move {
        // The engine may exit early on bad input and close its stdin; the
        // resulting broken pipe is reported through the exit status instead.
        if let Err(e) = stdin.write_all(&video).await {
            debug!(error = %e, "Decode engine closed stdin early");
        }
        drop(stdin);
    });
    let diagnostics = tokio::spawn(read_diagnostics(stderr));

    let mut splitter = PngStreamSplitter::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut emitted: u32 = 0;

    loop {
        let read = tokio::select! {
            read = stdout.read(&mut buf) => read,
            _ = tx.closed() => {
                debug!(emitted, "Frame consumer went away, stopping engine");
                abort_engine(&mut child, writer).await;
                return;
            }
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                abort_engine(&mut child, writer).await;
                let _ = tx.send(Err(DecodeError::Io(e.to_string()))).await;
                return;
            }
        };
        splitter.push(&buf[..n]);

        loop {
            match splitter.next_image() {
                Ok(Some(image)) => {
                    emitted += 1;
                    trace!(frame = emitted, size_bytes = image.len(), "Frame decoded");
                    if tx.send(Ok(image)).await.is_err() {
                        debug!(emitted, "Frame consumer went away, stopping engine");
                        abort_engine(&mut child, writer).await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    abort_engine(&mut child, writer).await;
                    let _ = tx.send(Err(DecodeError::Engine(e.to_string()))).await;
                    return;
                }
            }
        }
    }

    let status = child.wait().await;
    let _ = writer.await;
    let diagnostics = diagnostics.await.unwrap_or_default();

    let failure = match status {
        Ok(status) if status.success() => {
            if splitter.pending_len() > 0 {
                Some(DecodeError::Engine(format!(
                    "frame stream ended with {} bytes of a truncated image",
                    splitter.pending_len()
                )))
            } else {
                None
            }
        }
        Ok(status) => Some(classify_failure(
            emitted,
            &input_format,
            &diagnostics,
            &status.to_string(),
        )),
        Err(e) => Some(DecodeError::Io(e.to_string())),
    };

    match failure {
        Some(e) => {
            warn!(emitted, error = %e, "Decode engine failed");
            let _ = tx.send(Err(e)).await;
        }
        None => info!(emitted, "Decode engine finished"),
    }
}

/// An engine that exits without producing any frame could not parse the
/// input; a failure after frames were emitted is a runtime fault.
fn classify_failure(emitted: u32, input_format: &str, diagnostics: &str, status: &str) -> DecodeError {
    let message = if diagnostics.trim().is_empty() {
        format!("engine exited with {}", status)
    } else {
        diagnostics.trim().to_string()
    };

    if emitted == 0 {
        DecodeError::InvalidInput {
            format: input_format.to_string(),
            message,
        }
    } else {
        DecodeError::Engine(message)
    }
}

async fn abort_engine(child: &mut Child, writer: tokio::task::JoinHandle<()>) {
    writer.abort();
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill decode engine");
    }
}

/// Collect the tail of the engine's stderr.
async fn read_diagnostics<R: AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut raw = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut raw).await {
        debug!(error = %e, "Failed to read decode engine diagnostics");
    }

    let start = raw.len().saturating_sub(MAX_DIAGNOSTIC_BYTES);
    String::from_utf8_lossy(&raw[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DecoderSettings {
        DecoderSettings {
            ffmpeg_path: "ffmpeg".to_string(),
            input_format: "webm".to_string(),
            frame_rate: 20,
            frame_buffer: 4,
        }
    }

    #[test]
    fn test_command_args() {
        let decoder = FfmpegDecoder::new(settings());
        let args = decoder.command_args();

        let joined = args.join(" ");
        assert!(joined.contains("-f webm -i pipe:0"));
        assert!(joined.contains("-vf fps=20"));
        assert!(joined.ends_with("-f image2pipe -vcodec png pipe:1"));
    }

    #[tokio::test]
    async fn test_rejects_non_webm_input_before_spawning() {
        let mut settings = settings();
        settings.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        let decoder = FfmpegDecoder::new(settings);

        let result = decoder.decode(Bytes::from_static(b"not a video")).await;

        assert!(matches!(result, Err(DecodeError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_rejects_empty_input() {
        let decoder = FfmpegDecoder::new(settings());
        let result = decoder.decode(Bytes::new()).await;
        assert!(matches!(result, Err(DecodeError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_missing_engine_reports_spawn_error() {
        let mut settings = settings();
        settings.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        let decoder = FfmpegDecoder::new(settings);

        let mut video = EBML_MAGIC.to_vec();
        video.extend_from_slice(&[0u8; 32]);
        let result = decoder.decode(Bytes::from(video)).await;

        assert!(matches!(result, Err(DecodeError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_frame_stream_numbers_frames_and_stops_after_error() {
        let (tx, mut stream) = FrameStream::channel(8);
        tx.send(Ok(Bytes::from_static(b"a"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"b"))).await.unwrap();
        tx.send(Err(DecodeError::Engine("boom".to_string()))).await.unwrap();
        drop(tx);

        assert_eq!(stream.next_frame().await.unwrap().unwrap().index, 1);
        assert_eq!(stream.next_frame().await.unwrap().unwrap().index, 2);
        assert!(matches!(stream.next_frame().await, Some(Err(DecodeError::Engine(_)))));
        assert!(stream.next_frame().await.is_none());
        assert_eq!(stream.emitted(), 2);
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(0, "webm", "Invalid data found when processing input", "exit status: 1"),
            DecodeError::InvalidInput { .. }
        ));
        assert_eq!(
            classify_failure(3, "webm", "", "exit status: 1"),
            DecodeError::Engine("engine exited with exit status: 1".to_string())
        );
    }

    /// Runs `FfmpegDecoder` against a shell script standing in for ffmpeg.
    #[cfg(unix)]
    mod engine_process {
        use super::*;
        use crate::png_stream::tests::fake_png;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use std::time::Duration;

        const COLLECT_TIMEOUT: Duration = Duration::from_secs(10);

        fn fake_engine(dir: &Path, body: &str) -> String {
            let path = dir.join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.display().to_string()
        }

        fn frames_file(dir: &Path, count: u32, trailing: &[u8]) -> String {
            let mut data = Vec::new();
            for n in 1..=count {
                data.extend(fake_png(n));
            }
            data.extend_from_slice(trailing);

            let path = dir.join("frames.bin");
            std::fs::write(&path, data).unwrap();
            path.display().to_string()
        }

        fn webm() -> Bytes {
            let mut video = EBML_MAGIC.to_vec();
            video.extend_from_slice(&[0u8; 256]);
            Bytes::from(video)
        }

        fn decoder(engine: String) -> FfmpegDecoder {
            FfmpegDecoder::new(DecoderSettings {
                ffmpeg_path: engine,
                ..settings()
            })
        }

        async fn collect(mut stream: FrameStream) -> Vec<Result<Frame, DecodeError>> {
            tokio::time::timeout(COLLECT_TIMEOUT, async move {
                let mut items = Vec::new();
                while let Some(item) = stream.next_frame().await {
                    items.push(item);
                }
                items
            })
            .await
            .expect("frame stream did not end")
        }

        #[tokio::test]
        async fn test_engine_fault_after_frames_carries_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let frames = frames_file(dir.path(), 3, &[]);
            let engine = fake_engine(
                dir.path(),
                &format!(
                    "cat > /dev/null\ncat '{}'\necho 'corrupt packet at 3' >&2\nexit 1",
                    frames
                ),
            );

            let stream = decoder(engine).decode(webm()).await.unwrap();
            let items = collect(stream).await;

            assert_eq!(items.len(), 4);
            for (n, item) in items[..3].iter().enumerate() {
                let frame = item.as_ref().unwrap();
                assert_eq!(frame.index, n as u32 + 1);
                assert_eq!(&frame.data[..], &fake_png(n as u32 + 1)[..]);
            }
            assert_eq!(
                items[3],
                Err(DecodeError::Engine("corrupt packet at 3".to_string()))
            );
        }

        #[tokio::test]
        async fn test_engine_exit_without_frames_is_invalid_input() {
            let dir = tempfile::tempdir().unwrap();
            let engine = fake_engine(
                dir.path(),
                "cat > /dev/null\necho 'Invalid data found when processing input' >&2\nexit 1",
            );

            let stream = decoder(engine).decode(webm()).await.unwrap();
            let items = collect(stream).await;

            assert_eq!(
                items,
                vec![Err(DecodeError::InvalidInput {
                    format: "webm".to_string(),
                    message: "Invalid data found when processing input".to_string(),
                })]
            );
        }

        #[tokio::test]
        async fn test_truncated_trailing_image_is_an_engine_error() {
            let dir = tempfile::tempdir().unwrap();
            let partial = fake_png(3);
            let frames = frames_file(dir.path(), 2, &partial[..20]);
            let engine = fake_engine(
                dir.path(),
                &format!("cat > /dev/null\ncat '{}'\nexit 0", frames),
            );

            let stream = decoder(engine).decode(webm()).await.unwrap();
            let items = collect(stream).await;

            assert_eq!(items.len(), 3);
            assert_eq!(items[0].as_ref().unwrap().index, 1);
            assert_eq!(items[1].as_ref().unwrap().index, 2);
            match &items[2] {
                Err(DecodeError::Engine(message)) => assert!(message.contains("truncated")),
                other => panic!("unexpected item: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_dropping_the_stream_stops_the_engine() {
            let dir = tempfile::tempdir().unwrap();
            let frames = frames_file(dir.path(), 1, &[]);
            let pid_file = dir.path().join("engine.pid");
            let engine = fake_engine(
                dir.path(),
                &format!(
                    "echo $$ > '{}'\ncat > /dev/null\nwhile true; do cat '{}'; done",
                    pid_file.display(),
                    frames
                ),
            );

            let mut stream = decoder(engine).decode(webm()).await.unwrap();
            // Frames arrive while the engine is still running
            let first = tokio::time::timeout(COLLECT_TIMEOUT, stream.next_frame())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(first.index, 1);

            let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
            drop(stream);

            let mut stopped = false;
            for _ in 0..100 {
                let alive = std::process::Command::new("kill")
                    .args(["-0", &pid])
                    .status()
                    .map(|status| status.success())
                    .unwrap_or(false);
                if !alive {
                    stopped = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(stopped, "engine process {} still running", pid);
        }
    }
}
