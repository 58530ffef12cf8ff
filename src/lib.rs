//! Incremental image decoding for the idxd viewer.
//!
//! Bytes arrive from a `ChunkSource` in arbitrary pieces. A `DecodeScheduler`
//! feeds them to a `StreamCodec` a bounded chunk per tick, reports the image
//! size and coalesced repaint regions to a `DocumentObserver`, falls back to a
//! whole-buffer decode when streaming fails, and hands the finished image to
//! `FormatFinalizer`. `Session` runs all of that against a live source.

pub mod clock;
pub mod coalescer;
pub mod config;
pub mod decoder;
pub mod error;
pub mod finalizer;
pub mod models;
pub mod scheduler;
pub mod session;
pub mod source;

pub use config::DecodeConfig;
pub use decoder::{DecodeSink, ImageCodec, StreamCodec};
pub use error::{CodecError, DecodeError, SourceError};
pub use models::{DocumentLocation, JpegDocument, LoadedDocument, LoadedImage, Rect};
pub use scheduler::{DecodeScheduler, DecodeState, DocumentObserver};
pub use session::Session;
pub use source::{CancellationToken, ChunkSource, ReaderChunkSource, SourceEvent};
