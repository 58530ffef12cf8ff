//! Decode session state machine.
//!
//! One `DecodeScheduler` drives one document from first byte to a loaded
//! document (or a failure). It is single-threaded and cooperative: bytes and
//! source results are pushed in with `on_data_chunk` / `on_source_finished`,
//! and decode work happens only inside `tick()`. Whoever owns the scheduler
//! keeps calling `tick()` while `wants_tick()` is true; suspension simply
//! withholds ticks.
//!
//! ```text
//! Idle -> Streaming <-> Suspended
//!            |  \
//!            |   decoder error / stream ended early
//!            |     \
//!            |   SyncFallback <-> Suspended
//!            |     |       \
//!            v     v        v
//!          Finished        Failed
//! ```
//!
//! A source failure moves any non-terminal state straight to `Failed`.
//! An image decoded before the source has ended is held back until the
//! source reports success, so a late source error still fails the session.

use image::{DynamicImage, GenericImageView};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::coalescer::ProgressCoalescer;
use crate::config::DecodeConfig;
use crate::decoder::{DecodeSink, DecodeStep, IncrementalDecoder, StreamCodec};
use crate::error::{DecodeError, SourceError};
use crate::finalizer::{normalize_depth, FormatFinalizer};
use crate::models::{DocumentLocation, LoadedDocument, Rect};
use crate::source::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    Streaming,
    Suspended,
    SyncFallback,
    Finished,
    Failed,
}

impl DecodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Receiver of a session's progress and its single terminal result.
pub trait DocumentObserver {
    fn size_known(&mut self, width: u32, height: u32);
    fn region_updated(&mut self, rect: Rect);
    /// Called exactly once per session unless the session was cancelled.
    fn finished(&mut self, result: Result<LoadedDocument, DecodeError>);
}

pub struct DecodeScheduler<C, O> {
    location: DocumentLocation,
    config: DecodeConfig,
    decoder: IncrementalDecoder<C>,
    coalescer: ProgressCoalescer,
    observer: O,
    clock: Box<dyn Clock>,
    raw: Vec<u8>,
    cursor: usize,
    state: DecodeState,
    /// State to return to from `Suspended`.
    resume_state: DecodeState,
    source_active: bool,
    tick_armed: bool,
    size_reported: bool,
    regions_seen: bool,
    used_fallback: bool,
    cancel: CancellationToken,
    /// Image decoded from a complete payload, held until the source ends.
    decoded: Option<DynamicImage>,
}

impl<C: StreamCodec, O: DocumentObserver> DecodeScheduler<C, O> {
    pub fn new(location: DocumentLocation, codec: C, observer: O, config: DecodeConfig) -> Self {
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let coalescer = ProgressCoalescer::new(config.region_flush_interval, clock.now());
        Self {
            location,
            config,
            decoder: IncrementalDecoder::new(codec),
            coalescer,
            observer,
            clock,
            raw: Vec::new(),
            cursor: 0,
            state: DecodeState::Idle,
            resume_state: DecodeState::Streaming,
            source_active: false,
            tick_armed: false,
            size_reported: false,
            regions_seen: false,
            used_fallback: false,
            cancel: CancellationToken::new(),
            decoded: None,
        }
    }

    /// Replace the time source used for progress coalescing.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self.coalescer.reset(self.clock.now());
        self
    }

    /// Begin the session.
    ///
    /// Returns the token the chunk source must honor. Calling this again is a no-op.
    pub fn start(&mut self) -> CancellationToken {
        if self.state == DecodeState::Idle {
            info!(location = %self.location.display_name(), "Starting decode session");
            self.state = DecodeState::Streaming;
            self.source_active = true;
            self.coalescer.reset(self.clock.now());
        }
        self.cancel.clone()
    }

    /// Append bytes delivered by the source.
    pub fn on_data_chunk(&mut self, bytes: &[u8]) {
        if self.is_silenced() {
            return;
        }
        if self.state == DecodeState::Idle {
            warn!(len = bytes.len(), "Data received before the session started");
            return;
        }
        self.raw.extend_from_slice(bytes);
        trace!(len = bytes.len(), total = self.raw.len(), "Data received");
        if self.state != DecodeState::Suspended {
            self.tick_armed = true;
        }
    }

    /// Record the source's terminal result.
    pub fn on_source_finished(&mut self, result: Result<(), SourceError>) {
        if self.is_silenced() || !self.source_active {
            return;
        }
        self.source_active = false;
        match result {
            Ok(()) => {
                debug!(bytes = self.raw.len(), "Source completed");
                if self.state != DecodeState::Suspended {
                    self.tick_armed = true;
                }
            }
            Err(err) => {
                warn!(error = %err, bytes = self.raw.len(), "Source failed");
                self.fail(DecodeError::SourceIo(err));
            }
        }
    }

    /// Do one unit of decode work.
    pub fn tick(&mut self) {
        if !self.tick_armed || self.is_silenced() {
            return;
        }
        match self.state {
            DecodeState::Streaming => self.stream_step(),
            DecodeState::SyncFallback => self.sync_step(),
            _ => self.tick_armed = false,
        }
    }

    /// Pause decoding without dropping any state.
    pub fn suspend_loading(&mut self) {
        if matches!(self.state, DecodeState::Streaming | DecodeState::SyncFallback) {
            debug!(cursor = self.cursor, state = ?self.state, "Suspending decode");
            self.resume_state = self.state;
            self.state = DecodeState::Suspended;
            self.tick_armed = false;
        }
    }

    /// Continue exactly where `suspend_loading` stopped.
    pub fn resume_loading(&mut self) {
        if self.state != DecodeState::Suspended {
            return;
        }
        debug!(cursor = self.cursor, state = ?self.resume_state, "Resuming decode");
        self.state = self.resume_state;
        if self.cursor < self.raw.len() || !self.source_active {
            self.tick_armed = true;
        }
    }

    /// Stop the session for good. No notification is emitted afterwards.
    pub fn cancel(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!(state = ?self.state, "Cancelling decode session");
        }
        self.cancel.cancel();
        self.tick_armed = false;
    }

    pub fn wants_tick(&self) -> bool {
        self.tick_armed && !self.is_silenced()
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn read_cursor(&self) -> usize {
        self.cursor
    }

    pub fn buffered_len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the whole-buffer fallback was entered.
    pub fn used_fallback(&self) -> bool {
        self.used_fallback
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn codec(&self) -> &C {
        self.decoder.codec()
    }

    fn is_silenced(&self) -> bool {
        self.state.is_terminal() || self.cancel.is_cancelled()
    }

    fn stream_step(&mut self) {
        if self.decoded.is_some() {
            self.settle_decoded();
            return;
        }
        let available = self.raw.len() - self.cursor;
        let mut progressed = false;

        if available > 0 {
            let end = self.cursor + available.min(self.config.chunk_size);
            let mut sink = SchedulerSink {
                observer: &mut self.observer,
                coalescer: &mut self.coalescer,
                clock: self.clock.as_ref(),
                cancel: &self.cancel,
                size_reported: &mut self.size_reported,
                regions_seen: &mut self.regions_seen,
            };
            match self.decoder.feed(&self.raw[self.cursor..end], &mut sink) {
                Ok(feed) => {
                    self.cursor += feed.consumed;
                    progressed = feed.consumed > 0;
                    if feed.step == DecodeStep::Complete {
                        self.decode_payload();
                        return;
                    }
                }
                Err(err) => {
                    debug!(error = %err, cursor = self.cursor, "Incremental decode failed");
                    self.enter_fallback();
                    return;
                }
            }
        }

        if progressed && self.cursor < self.raw.len() {
            return;
        }
        if self.source_active {
            trace!(cursor = self.cursor, "Waiting for more data");
            self.tick_armed = false;
            return;
        }
        debug!(
            cursor = self.cursor,
            bytes = self.raw.len(),
            "Stream ended before the decoder completed"
        );
        self.enter_fallback();
    }

    /// Decode the payload the codec just completed, up to the read cursor.
    fn decode_payload(&mut self) {
        match self.decoder.decode_whole(&self.raw[..self.cursor]) {
            Ok(image) => {
                self.decoded = Some(image);
                self.settle_decoded();
            }
            Err(err) => {
                debug!(error = %err, cursor = self.cursor, "Completed payload failed to decode");
                self.enter_fallback();
            }
        }
    }

    /// Finish with the held image once the source has ended cleanly.
    fn settle_decoded(&mut self) {
        if self.source_active {
            trace!(
                cursor = self.cursor,
                bytes = self.raw.len(),
                "Payload complete, waiting for the source"
            );
            self.tick_armed = false;
            return;
        }
        if let Some(image) = self.decoded.take() {
            let repaint_all = !self.regions_seen;
            self.finish(image, repaint_all);
        }
    }

    fn enter_fallback(&mut self) {
        info!(bytes = self.raw.len(), "Falling back to whole-buffer decode");
        self.state = DecodeState::SyncFallback;
        self.used_fallback = true;
        self.sync_step();
    }

    fn sync_step(&mut self) {
        if self.source_active {
            // Needs the complete payload.
            self.tick_armed = false;
            return;
        }
        self.cursor = self.raw.len();
        match self.decoder.decode_whole(&self.raw) {
            Ok(image) => self.finish(image, true),
            Err(err) => {
                warn!(error = %err, bytes = self.raw.len(), "Whole-buffer decode failed");
                self.fail(DecodeError::SyncDecode(err));
            }
        }
    }

    fn finish(&mut self, image: DynamicImage, mut repaint_all: bool) {
        self.tick_armed = false;

        if let Some(rect) = self.coalescer.flush(self.clock.now()) {
            self.emit_region(rect);
        }

        let (image, converted) = normalize_depth(image);
        repaint_all |= converted;
        let (width, height) = image.dimensions();
        if !self.size_reported {
            self.size_reported = true;
            self.emit_size(width, height);
        }
        if repaint_all {
            self.emit_region(Rect::from_size(width, height));
        }

        let Some(format) = self.decoder.detect_format(&self.raw) else {
            panic!(
                "decoded {}x{} image from {} has no detectable format",
                width,
                height,
                self.location.display_name()
            );
        };

        let raw = std::mem::take(&mut self.raw);
        let bytes = raw.len();
        match FormatFinalizer::from_config(&self.config).finalize(format, image, raw, &self.location)
        {
            Ok(document) => {
                info!(?format, width, height, bytes, "Decode finished");
                self.state = DecodeState::Finished;
                self.notify_finished(Ok(document));
            }
            Err(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: DecodeError) {
        if self.state.is_terminal() {
            return;
        }
        self.state = DecodeState::Failed;
        self.tick_armed = false;
        self.raw = Vec::new();
        self.decoded = None;
        self.notify_finished(Err(err));
    }

    fn emit_size(&mut self, width: u32, height: u32) {
        if !self.cancel.is_cancelled() {
            self.observer.size_known(width, height);
        }
    }

    fn emit_region(&mut self, rect: Rect) {
        if !self.cancel.is_cancelled() {
            self.observer.region_updated(rect);
        }
    }

    fn notify_finished(&mut self, result: Result<LoadedDocument, DecodeError>) {
        if !self.cancel.is_cancelled() {
            self.observer.finished(result);
        }
    }
}

impl<C, O> Drop for DecodeScheduler<C, O> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Routes codec callbacks into the coalescer and observer during a feed.
struct SchedulerSink<'a, O> {
    observer: &'a mut O,
    coalescer: &'a mut ProgressCoalescer,
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
    size_reported: &'a mut bool,
    regions_seen: &'a mut bool,
}

impl<O: DocumentObserver> DecodeSink for SchedulerSink<'_, O> {
    fn size_known(&mut self, width: u32, height: u32) {
        if *self.size_reported || self.cancel.is_cancelled() {
            return;
        }
        *self.size_reported = true;
        self.observer.size_known(width, height);
    }

    fn region_changed(&mut self, rect: Rect) {
        *self.regions_seen = true;
        if let Some(rect) = self.coalescer.region_changed(rect, self.clock.now()) {
            if !self.cancel.is_cancelled() {
                self.observer.region_updated(rect);
            }
        }
    }
}
