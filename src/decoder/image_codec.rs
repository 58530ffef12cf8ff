use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageReader};
use tracing::{debug, trace};

use super::gif_stream::GifStream;
use super::png_stream::PngStream;
use super::{DecodeSink, DecodeStep, Feed, StreamCodec};
use crate::error::CodecError;

/// Enough for every signature `image::guess_format` knows.
const MIN_SNIFF_BYTES: usize = 12;

/// Give up recognizing the format once this many bytes failed to match.
const MAX_SNIFF_BYTES: usize = 32;

/// Header bytes kept while waiting for dimensions of a buffered format.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// `StreamCodec` backed by the `image`, `png` and `gif` crates.
///
/// The format is sniffed from the magic bytes. PNG and GIF run through push
/// decoders that report rows as they are inflated and spot the exact end of
/// the payload. Other formats only get their dimensions from a partial
/// header; their pixels come from `decode_whole` once the stream has ended.
#[derive(Default)]
pub struct ImageCodec {
    /// Leading bytes seen before the format is known.
    prefix: Vec<u8>,
    payload: Option<Payload>,
}

enum Payload {
    Png(PngStream),
    Gif(GifStream),
    Buffered(HeaderSize),
}

impl Payload {
    fn for_format(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Png => Payload::Png(PngStream::new()),
            ImageFormat::Gif => Payload::Gif(GifStream::new()),
            other => Payload::Buffered(HeaderSize::new(other)),
        }
    }

    fn push(&mut self, bytes: &[u8], sink: &mut dyn DecodeSink) -> Result<Feed, CodecError> {
        match self {
            Payload::Png(stream) => stream.push(bytes, sink),
            Payload::Gif(stream) => stream.push(bytes, sink),
            Payload::Buffered(header) => {
                header.push(bytes, sink);
                Ok(Feed::need_more(bytes.len()))
            }
        }
    }
}

/// Collects the start of a buffered payload until its dimensions parse.
struct HeaderSize {
    format: ImageFormat,
    header: Vec<u8>,
    settled: bool,
}

impl HeaderSize {
    fn new(format: ImageFormat) -> Self {
        Self {
            format,
            header: Vec::new(),
            settled: false,
        }
    }

    fn push(&mut self, bytes: &[u8], sink: &mut dyn DecodeSink) {
        if self.settled {
            return;
        }
        let room = MAX_HEADER_BYTES - self.header.len();
        self.header.extend_from_slice(&bytes[..bytes.len().min(room)]);

        if let Some((width, height)) = header_dimensions(&self.header, self.format) {
            trace!(width, height, "Header dimensions available");
            sink.size_known(width, height);
            self.settle();
        } else if self.header.len() >= MAX_HEADER_BYTES {
            debug!(format = ?self.format, "No dimensions in leading header bytes");
            self.settle();
        }
    }

    fn settle(&mut self) {
        self.settled = true;
        self.header = Vec::new();
    }
}

impl ImageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn sniff(&mut self) -> Result<Option<ImageFormat>, CodecError> {
        if self.prefix.len() < MIN_SNIFF_BYTES {
            return Ok(None);
        }
        match image::guess_format(&self.prefix) {
            Ok(format) => {
                debug!(?format, "Detected stream format");
                Ok(Some(format))
            }
            Err(_) if self.prefix.len() < MAX_SNIFF_BYTES => Ok(None),
            Err(e) => Err(CodecError::Malformed(format!(
                "unrecognized image signature: {e}"
            ))),
        }
    }
}

impl StreamCodec for ImageCodec {
    fn push(&mut self, bytes: &[u8], sink: &mut dyn DecodeSink) -> Result<Feed, CodecError> {
        if let Some(payload) = self.payload.as_mut() {
            return payload.push(bytes, sink);
        }

        let room = MAX_SNIFF_BYTES - self.prefix.len();
        let taken = bytes.len().min(room);
        self.prefix.extend_from_slice(&bytes[..taken]);
        let Some(format) = self.sniff()? else {
            return Ok(Feed::need_more(taken));
        };

        let mut payload = Payload::for_format(format);
        let prefix = std::mem::take(&mut self.prefix);
        let earlier = prefix.len() - taken;
        let head = payload.push(&prefix, sink)?;
        let feed = if head.step == DecodeStep::Complete {
            // Bytes before this call were already reported as consumed.
            Feed::complete(head.consumed.saturating_sub(earlier))
        } else {
            let rest = payload.push(&bytes[taken..], sink)?;
            Feed {
                consumed: taken + rest.consumed,
                step: rest.step,
            }
        };
        self.payload = Some(payload);
        Ok(feed)
    }

    fn decode_whole(&self, data: &[u8]) -> Result<DynamicImage, CodecError> {
        Ok(image::load_from_memory(data)?)
    }

    fn detect_format(&self, data: &[u8]) -> Option<ImageFormat> {
        image::guess_format(data).ok()
    }
}

/// Read dimensions from a possibly partial payload.
fn header_dimensions(buf: &[u8], format: ImageFormat) -> Option<(u32, u32)> {
    ImageReader::with_format(Cursor::new(buf), format)
        .into_dimensions()
        .ok()
}
