//! Row progress for PNG payloads via `png::StreamingDecoder`.
//!
//! The streaming decoder parses chunks and inflates IDAT data as bytes
//! arrive. Inflated scanlines are only counted, never kept: a sliding window
//! holds the deflate lookback and everything older is dropped.

use png::{chunk, Decoded, StreamingDecoder, UnfilterRegion};
use tracing::trace;

use super::{DecodeSink, Feed};
use crate::error::CodecError;
use crate::models::Rect;

/// Free space guaranteed after the inflated data before each update.
const WINDOW_GROWTH: usize = 32 * 1024;

/// Drop already-counted bytes once this many are reclaimable.
const COMPACT_AT: usize = 256 * 1024;

struct RowProgress {
    width: u32,
    height: u32,
    /// Filtered row length including the filter byte.
    row_bytes: usize,
    interlaced: bool,
    reported: u32,
}

pub(super) struct PngStream {
    decoder: StreamingDecoder,
    window: Vec<u8>,
    region: UnfilterRegion,
    /// Inflated bytes already dropped from the front of `window`.
    dropped: usize,
    rows: Option<RowProgress>,
    image_done: bool,
}

impl PngStream {
    pub(super) fn new() -> Self {
        Self {
            decoder: StreamingDecoder::new(),
            window: Vec::new(),
            region: UnfilterRegion::default(),
            dropped: 0,
            rows: None,
            image_done: false,
        }
    }

    pub(super) fn push(
        &mut self,
        bytes: &[u8],
        sink: &mut dyn DecodeSink,
    ) -> Result<Feed, CodecError> {
        let mut offset = 0;
        while offset < bytes.len() {
            self.make_room();
            let (consumed, decoded) = if self.image_done {
                self.decoder.update(&bytes[offset..], None)?
            } else {
                let mut out = self.region.as_buf(&mut self.window);
                self.decoder.update(&bytes[offset..], Some(&mut out))?
            };
            offset += consumed;

            if self.rows.is_none() {
                self.read_header(sink);
            }
            match decoded {
                Decoded::ImageData => self.report_rows(sink, false),
                Decoded::ImageDataFlushed => {
                    self.image_done = true;
                    self.report_rows(sink, true);
                }
                Decoded::ChunkComplete(chunk::IEND) => return Ok(Feed::complete(offset)),
                _ => {}
            }
        }
        Ok(Feed::need_more(bytes.len()))
    }

    fn read_header(&mut self, sink: &mut dyn DecodeSink) {
        let Some(info) = self.decoder.info() else {
            return;
        };
        trace!(width = info.width, height = info.height, "PNG header parsed");
        sink.size_known(info.width, info.height);
        self.rows = Some(RowProgress {
            width: info.width,
            height: info.height,
            row_bytes: info.raw_row_length().max(1),
            interlaced: info.interlaced,
            reported: 0,
        });
    }

    fn make_room(&mut self) {
        if self.region.available >= COMPACT_AT {
            let drop = self.region.available;
            self.window.copy_within(drop..self.region.filled, 0);
            self.region.filled -= drop;
            self.region.available = 0;
            self.dropped += drop;
        }
        let wanted = self.region.filled + WINDOW_GROWTH;
        if self.window.len() < wanted {
            self.window.resize(wanted, 0);
        }
    }

    /// Report rows whose filtered bytes are fully inflated.
    ///
    /// Adam7 passes are spread over the whole image, so interlaced images
    /// only report once all image data is in.
    fn report_rows(&mut self, sink: &mut dyn DecodeSink, flushed: bool) {
        let Some(rows) = self.rows.as_mut() else {
            return;
        };
        let done = if flushed {
            rows.height
        } else if rows.interlaced {
            return;
        } else {
            let inflated = self.dropped + self.region.filled;
            (inflated / rows.row_bytes).min(rows.height as usize) as u32
        };
        if done > rows.reported {
            sink.region_changed(Rect::new(0, rows.reported, rows.width, done - rows.reported));
            rows.reported = done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodeStep;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    #[derive(Default)]
    struct Rows {
        sizes: Vec<(u32, u32)>,
        regions: Vec<Rect>,
    }

    impl DecodeSink for Rows {
        fn size_known(&mut self, width: u32, height: u32) {
            self.sizes.push((width, height));
        }

        fn region_changed(&mut self, rect: Rect) {
            self.regions.push(rect);
        }
    }

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        // Noise keeps the deflate stream long enough to arrive in pieces.
        let mut seed = 0x2545_F491u32;
        let image = RgbImage::from_fn(width, height, |_, _| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            Rgb([seed as u8, (seed >> 8) as u8, (seed >> 16) as u8])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn push_in_steps(data: &[u8], step: usize, rows: &mut Rows) -> Option<usize> {
        let mut stream = PngStream::new();
        let mut cursor = 0;
        while cursor < data.len() {
            let end = (cursor + step).min(data.len());
            let feed = stream.push(&data[cursor..end], rows).unwrap();
            cursor += feed.consumed;
            if feed.step == DecodeStep::Complete {
                return Some(cursor);
            }
        }
        None
    }

    #[test]
    fn test_rows_reported_progressively_in_order() {
        let data = noisy_png(64, 48);
        let mut rows = Rows::default();
        let end = push_in_steps(&data, 512, &mut rows).unwrap();
        assert_eq!(end, data.len());
        assert_eq!(rows.sizes, vec![(64, 48)]);
        assert!(rows.regions.len() > 1, "expected partial rows: {:?}", rows.regions);

        let mut next = 0;
        for rect in &rows.regions {
            assert_eq!((rect.x, rect.width), (0, 64));
            assert_eq!(rect.y, next);
            next = rect.bottom();
        }
        assert_eq!(next, 48);
    }

    #[test]
    fn test_completion_stops_before_trailing_bytes() {
        let mut data = noisy_png(8, 8);
        let payload = data.len();
        data.extend_from_slice(b"trailing metadata");
        let mut rows = Rows::default();
        assert_eq!(push_in_steps(&data, 4096, &mut rows), Some(payload));
    }

    #[test]
    fn test_truncated_png_never_completes() {
        let data = noisy_png(16, 16);
        let mut rows = Rows::default();
        assert_eq!(push_in_steps(&data[..data.len() - 12], 7, &mut rows), None);
        assert_eq!(rows.sizes, vec![(16, 16)]);
    }

    #[test]
    fn test_bad_signature_is_an_error() {
        let mut stream = PngStream::new();
        let mut rows = Rows::default();
        assert!(stream.push(b"\x89PNG\r\n\x1a\x0bgarbage", &mut rows).is_err());
    }
}
