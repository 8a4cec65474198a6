//! Splitting of a concatenated PNG byte stream into individual images.
//!
//! The decode engine writes every sampled frame as a complete PNG file to a
//! single pipe. PNG is self-delimiting (signature, then length-prefixed chunks
//! up to `IEND`), so frames can be cut out of the stream without decoding
//! pixel data.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// The eight-byte signature that starts every PNG file.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

const CHUNK_HEADER_LEN: usize = 8;
const CHUNK_CRC_LEN: usize = 4;

/// Errors raised while splitting the frame stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("frame stream does not start with a PNG signature (found {0:02x?})")]
    BadSignature([u8; 8]),

    #[error("PNG chunk length {0} exceeds the maximum allowed size")]
    ChunkTooLarge(usize),
}

/// Incremental splitter for a stream of back-to-back PNG files.
#[derive(Debug, Default)]
pub struct PngStreamSplitter {
    buffer: BytesMut,
    /// Offset of the next unparsed chunk inside the image at the front of
    /// `buffer`, or 0 when the signature has not been checked yet.
    cursor: usize,
}

impl PngStreamSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the engine.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes that do not yet form a complete image.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete image from the front of the buffer.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn next_image(&mut self) -> Result<Option<Bytes>, SplitError> {
        if self.cursor == 0 {
            if self.buffer.len() < PNG_SIGNATURE.len() {
                return Ok(None);
            }
            if self.buffer[..PNG_SIGNATURE.len()] != PNG_SIGNATURE {
                let mut found = [0u8; 8];
                found.copy_from_slice(&self.buffer[..PNG_SIGNATURE.len()]);
                return Err(SplitError::BadSignature(found));
            }
            self.cursor = PNG_SIGNATURE.len();
        }

        loop {
            let header_end = self.cursor + CHUNK_HEADER_LEN;
            if self.buffer.len() < header_end {
                return Ok(None);
            }

            let header = &self.buffer[self.cursor..header_end];
            let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            // PNG limits chunk lengths to 2^31 - 1
            if length > i32::MAX as usize {
                return Err(SplitError::ChunkTooLarge(length));
            }
            let is_end = &header[4..8] == b"IEND";

            let chunk_end = header_end + length + CHUNK_CRC_LEN;
            if self.buffer.len() < chunk_end {
                return Ok(None);
            }
            self.cursor = chunk_end;

            if is_end {
                let image = self.buffer.split_to(chunk_end).freeze();
                self.cursor = 0;
                return Ok(Some(image));
            }
        }
    }
}
