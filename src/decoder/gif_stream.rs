//! Row progress for GIF payloads via `gif::streaming_decoder`.
//!
//! Only the first frame is tracked; later frames are parsed without
//! decompressing their pixel data.

use gif::streaming_decoder::{Block, Decoded, OutputBuffer, StreamingDecoder};
use tracing::trace;

use super::{DecodeSink, Feed};
use crate::error::CodecError;
use crate::models::Rect;

/// Decoded palette indices land here and are dropped after counting.
const SCRATCH_LEN: usize = 4096;

struct FrameProgress {
    bounds: Rect,
    interlaced: bool,
    decoded: usize,
    reported: u32,
}

pub(super) struct GifStream {
    decoder: StreamingDecoder,
    scratch: Vec<u8>,
    frame: Option<FrameProgress>,
    first_frame_done: bool,
}

impl GifStream {
    pub(super) fn new() -> Self {
        Self {
            decoder: StreamingDecoder::new(),
            scratch: vec![0; SCRATCH_LEN],
            frame: None,
            first_frame_done: false,
        }
    }

    pub(super) fn push(
        &mut self,
        bytes: &[u8],
        sink: &mut dyn DecodeSink,
    ) -> Result<Feed, CodecError> {
        let mut offset = 0;
        while offset < bytes.len() {
            let (consumed, decoded) = if self.first_frame_done {
                self.decoder.update(&bytes[offset..], &mut OutputBuffer::None)?
            } else {
                let mut out = OutputBuffer::Slice(self.scratch.as_mut_slice());
                self.decoder.update(&bytes[offset..], &mut out)?
            };
            offset += consumed;

            match decoded {
                Decoded::HeaderEnd => {
                    let (width, height) = (self.decoder.width(), self.decoder.height());
                    trace!(width, height, "GIF screen descriptor parsed");
                    sink.size_known(u32::from(width), u32::from(height));
                }
                Decoded::FrameMetadata(_) if !self.first_frame_done => {
                    let frame = self.decoder.current_frame();
                    self.frame = Some(FrameProgress {
                        bounds: Rect::new(
                            u32::from(frame.left),
                            u32::from(frame.top),
                            u32::from(frame.width),
                            u32::from(frame.height),
                        ),
                        interlaced: frame.interlaced,
                        decoded: 0,
                        reported: 0,
                    });
                }
                Decoded::BytesDecoded(count) => self.report_rows(sink, count.get(), false),
                Decoded::DataEnd if !self.first_frame_done => {
                    self.report_rows(sink, 0, true);
                    self.first_frame_done = true;
                }
                // The trailer is the final event; the decoder must not be fed past it.
                Decoded::BlockStart(Block::Trailer) => return Ok(Feed::complete(offset)),
                _ => {}
            }
        }
        Ok(Feed::need_more(bytes.len()))
    }

    /// Interlaced rows arrive in four passes, so those frames report once.
    fn report_rows(&mut self, sink: &mut dyn DecodeSink, count: usize, frame_end: bool) {
        let Some(frame) = self.frame.as_mut() else {
            return;
        };
        frame.decoded += count;
        let height = frame.bounds.height;
        let done = if frame_end {
            height
        } else if frame.interlaced {
            return;
        } else {
            let width = frame.bounds.width.max(1) as usize;
            (frame.decoded / width).min(height as usize) as u32
        };
        if done > frame.reported {
            sink.region_changed(Rect::new(
                frame.bounds.x,
                frame.bounds.y + frame.reported,
                frame.bounds.width,
                done - frame.reported,
            ));
            frame.reported = done;
        }
    }
}
