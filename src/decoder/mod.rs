//! Incremental decoding.
//!
//! - `StreamCodec` - a pull-based image codec fed with byte slices
//! - `DecodeSink` - callbacks a codec fires while it is being fed
//! - `IncrementalDecoder` - adapter holding the consumption contract
//! - `ImageCodec` - `StreamCodec` on top of the `image`, `png` and `gif` crates

mod gif_stream;
pub mod image_codec;
mod png_stream;

use image::{DynamicImage, ImageFormat};
use tracing::warn;

use crate::error::CodecError;
use crate::models::Rect;

pub use image_codec::ImageCodec;

/// Notifications a codec may fire during a feed, in byte-offset order.
pub trait DecodeSink {
    /// Image dimensions became known.
    fn size_known(&mut self, width: u32, height: u32);
    /// Pixels inside `rect` have new data.
    fn region_changed(&mut self, rect: Rect);
}

/// Where the codec stands after a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStep {
    /// The codec needs more input before the payload is complete.
    NeedMore,
    /// The payload ended inside the consumed bytes. Everything up to the
    /// read cursor can now be decoded with `decode_whole`.
    Complete,
}

/// Result of one feed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feed {
    /// Bytes of the supplied slice the codec took. Never more than supplied.
    pub consumed: usize,
    pub step: DecodeStep,
}

impl Feed {
    pub fn need_more(consumed: usize) -> Self {
        Self {
            consumed,
            step: DecodeStep::NeedMore,
        }
    }

    pub fn complete(consumed: usize) -> Self {
        Self {
            consumed,
            step: DecodeStep::Complete,
        }
    }
}

/// Pull-based image codec.
///
/// A codec never keeps its own copy of the payload; the caller owns the
/// bytes and hands the complete prefix to `decode_whole`.
pub trait StreamCodec {
    /// Feed the next unread bytes of the stream.
    fn push(&mut self, bytes: &[u8], sink: &mut dyn DecodeSink) -> Result<Feed, CodecError>;

    /// Decode a complete payload in one go.
    fn decode_whole(&self, data: &[u8]) -> Result<DynamicImage, CodecError>;

    /// Identify the encoded format of a payload.
    fn detect_format(&self, data: &[u8]) -> Option<ImageFormat>;
}

/// Wraps a `StreamCodec` and keeps the count of consumed bytes honest.
pub struct IncrementalDecoder<C> {
    codec: C,
}

impl<C: StreamCodec> IncrementalDecoder<C> {
    pub fn new(codec: C) -> Self {
        Self { codec }
    }

    /// Feed `bytes`, the unread suffix of the raw buffer starting at the read cursor.
    pub fn feed(&mut self, bytes: &[u8], sink: &mut dyn DecodeSink) -> Result<Feed, CodecError> {
        let mut feed = self.codec.push(bytes, sink)?;
        if feed.consumed > bytes.len() {
            warn!(
                consumed = feed.consumed,
                supplied = bytes.len(),
                "Codec reported more bytes than supplied"
            );
            feed.consumed = bytes.len();
        }
        Ok(feed)
    }

    pub fn decode_whole(&self, data: &[u8]) -> Result<DynamicImage, CodecError> {
        self.codec.decode_whole(data)
    }

    pub fn detect_format(&self, data: &[u8]) -> Option<ImageFormat> {
        self.codec.detect_format(data)
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}
