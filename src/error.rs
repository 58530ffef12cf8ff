//! Error kinds of the decode pipeline.
//!
//! Only `DecodeError` ever leaves a session, and only through the terminal
//! `finished` notification. `CodecError` from the incremental path is handled
//! inside the scheduler by falling back to a whole-buffer decode.

use std::time::Duration;

/// Failure reported by a chunk source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),

    #[error("source delivered no data for {0:?}")]
    Stalled(Duration),

    #[error("source went away without reporting a result")]
    Disconnected,
}

/// The codec rejected the byte stream.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed image data: {0}")]
    Malformed(String),

    #[error("PNG stream error: {0}")]
    Png(#[from] png::DecodingError),

    #[error("GIF stream error: {0}")]
    Gif(#[from] gif::DecodingError),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Terminal failure of a decode session.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("source error: {0}")]
    SourceIo(#[from] SourceError),

    #[error("whole-buffer decode failed: {0}")]
    SyncDecode(CodecError),

    #[error("failed to write temporary copy: {0}")]
    TempFile(std::io::Error),
}
