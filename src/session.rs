//! Drives a `DecodeScheduler` from a `ChunkSource` on the current thread.
//!
//! The session owns the receiving end of the source channel. It drains
//! whatever has arrived, ticks the scheduler while it has work, and blocks on
//! the channel only when the scheduler is waiting for data.

use std::time::Duration;

use anyhow::{Context, Result};
use flume::{Receiver, RecvTimeoutError, TryRecvError};
use tracing::{debug, warn};

use crate::config::DecodeConfig;
use crate::decoder::StreamCodec;
use crate::error::SourceError;
use crate::models::DocumentLocation;
use crate::scheduler::{DecodeScheduler, DecodeState, DocumentObserver};
use crate::source::{ChunkSource, SourceEvent};

pub struct Session<C, O> {
    scheduler: DecodeScheduler<C, O>,
    events: Receiver<SourceEvent>,
    source_done: bool,
    stall_timeout: Option<Duration>,
}

impl<C: StreamCodec, O: DocumentObserver> Session<C, O> {
    /// Start a session for `location` and open its source.
    pub fn open(
        location: DocumentLocation,
        codec: C,
        observer: O,
        config: DecodeConfig,
        source: &dyn ChunkSource,
    ) -> Result<Self> {
        let stall_timeout = config.stall_timeout;
        let mut scheduler = DecodeScheduler::new(location.clone(), codec, observer, config);
        let cancel = scheduler.start();
        let events = source
            .open(&location, cancel)
            .with_context(|| format!("Failed to open source for {}", location.display_name()))?;
        Ok(Self {
            scheduler,
            events,
            source_done: false,
            stall_timeout,
        })
    }

    /// Deliver everything already queued and run at most one tick.
    ///
    /// Never blocks. Returns whether any event or tick was processed.
    pub fn step(&mut self) -> bool {
        let mut progressed = false;
        while !self.source_done {
            match self.events.try_recv() {
                Ok(event) => {
                    self.deliver(event);
                    progressed = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.source_failed(SourceError::Disconnected);
                    progressed = true;
                }
            }
        }
        if self.scheduler.wants_tick() {
            self.scheduler.tick();
            progressed = true;
        }
        progressed
    }

    /// Run until the session is terminal or nothing else can happen.
    ///
    /// A suspended session keeps buffering until its source completes and is
    /// then returned still `Suspended`.
    pub fn run(&mut self) -> DecodeState {
        loop {
            while self.step() {
                if self.scheduler.is_terminal() {
                    return self.scheduler.state();
                }
            }
            if self.scheduler.is_terminal() || self.source_done {
                return self.scheduler.state();
            }

            let received = match self.stall_timeout {
                Some(timeout) => self.events.recv_timeout(timeout).map_err(|e| match e {
                    RecvTimeoutError::Timeout => SourceError::Stalled(timeout),
                    RecvTimeoutError::Disconnected => SourceError::Disconnected,
                }),
                None => self.events.recv().map_err(|_| SourceError::Disconnected),
            };
            match received {
                Ok(event) => self.deliver(event),
                Err(err) => self.source_failed(err),
            }
        }
    }

    pub fn suspend(&mut self) {
        self.scheduler.suspend_loading();
    }

    pub fn resume(&mut self) {
        self.scheduler.resume_loading();
    }

    /// Stop the session and its source. No further notifications are sent.
    pub fn cancel(&mut self) {
        self.scheduler.cancel();
    }

    pub fn state(&self) -> DecodeState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &DecodeScheduler<C, O> {
        &self.scheduler
    }

    pub fn observer(&self) -> &O {
        self.scheduler.observer()
    }

    pub fn into_observer(self) -> O
    where
        O: Default,
    {
        let mut scheduler = self.scheduler;
        std::mem::take(scheduler.observer_mut())
    }

    fn deliver(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Data(bytes) => self.scheduler.on_data_chunk(&bytes),
            SourceEvent::Finished(result) => {
                debug!(ok = result.is_ok(), "Source reported completion");
                self.source_done = true;
                self.scheduler.on_source_finished(result);
            }
        }
    }

    fn source_failed(&mut self, err: SourceError) {
        warn!(error = %err, "Source stopped delivering");
        self.source_done = true;
        self.scheduler.on_source_finished(Err(err));
        // Stop the reader thread as well.
        self.scheduler.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ImageCodec;
    use crate::error::DecodeError;
    use crate::models::{LoadedDocument, Rect};
    use crate::source::{CancellationToken, ReaderChunkSource};
    use flume::Sender;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use parking_lot::Mutex;
    use std::io::Cursor;

    #[derive(Default)]
    struct Collect {
        sizes: Vec<(u32, u32)>,
        regions: Vec<Rect>,
        results: Vec<Result<LoadedDocument, DecodeError>>,
    }

    impl DocumentObserver for Collect {
        fn size_known(&mut self, width: u32, height: u32) {
            self.sizes.push((width, height));
        }

        fn region_updated(&mut self, rect: Rect) {
            self.regions.push(rect);
        }

        fn finished(&mut self, result: Result<LoadedDocument, DecodeError>) {
            self.results.push(result);
        }
    }

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(48, 32, |x, y| {
            Rgb([x as u8 * 5, y as u8 * 7, 99])
        }));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn small_reads(dir: &tempfile::TempDir) -> DecodeConfig {
        DecodeConfig::default()
            .with_read_block_size(256)
            .with_chunk_size(512)
            .with_temp_dir(dir.path().join("temp"))
    }

    /// Serves fixed bytes for any location.
    struct BytesSource {
        bytes: Vec<u8>,
        reader: ReaderChunkSource,
    }

    impl ChunkSource for BytesSource {
        fn open(
            &self,
            _location: &DocumentLocation,
            cancel: CancellationToken,
        ) -> Result<Receiver<SourceEvent>> {
            self.reader
                .spawn_reader("bytes", Cursor::new(self.bytes.clone()), cancel)
        }
    }

    /// Keeps the channel open without ever sending.
    #[derive(Default)]
    struct SilentSource {
        senders: Mutex<Vec<Sender<SourceEvent>>>,
    }

    impl ChunkSource for SilentSource {
        fn open(
            &self,
            _location: &DocumentLocation,
            _cancel: CancellationToken,
        ) -> Result<Receiver<SourceEvent>> {
            let (tx, rx) = flume::unbounded();
            self.senders.lock().push(tx);
            Ok(rx)
        }
    }

    /// Drops its sender right away.
    struct VanishingSource;

    impl ChunkSource for VanishingSource {
        fn open(
            &self,
            _location: &DocumentLocation,
            _cancel: CancellationToken,
        ) -> Result<Receiver<SourceEvent>> {
            let (_tx, rx) = flume::unbounded();
            Ok(rx)
        }
    }

    #[test]
    fn test_local_png_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = encoded(ImageFormat::Png);
        let path = dir.path().join("pic.png");
        std::fs::write(&path, &data).unwrap();

        let config = small_reads(&dir);
        let source = ReaderChunkSource::new(&config);
        let mut session = Session::open(
            DocumentLocation::Local(path),
            ImageCodec::new(),
            Collect::default(),
            config,
            &source,
        )
        .unwrap();
        assert_eq!(session.run(), DecodeState::Finished);

        let collect = session.into_observer();
        assert_eq!(collect.sizes, vec![(48, 32)]);
        assert_eq!(collect.results.len(), 1);
        let document = collect.results[0].as_ref().unwrap();
        let expected = image::load_from_memory(&data).unwrap();
        assert_eq!(document.image().as_bytes(), expected.as_bytes());
        let covered = collect
            .regions
            .iter()
            .fold(Rect::default(), |acc, r| acc.union(r));
        assert_eq!(covered, Rect::from_size(48, 32));
    }

    #[test]
    fn test_local_jpeg_file_keeps_source_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, encoded(ImageFormat::Jpeg)).unwrap();

        let config = small_reads(&dir);
        let source = ReaderChunkSource::new(&config);
        let mut session = Session::open(
            DocumentLocation::Local(path.clone()),
            ImageCodec::new(),
            Collect::default(),
            config,
            &source,
        )
        .unwrap();
        assert_eq!(session.run(), DecodeState::Finished);

        let jpeg = session.observer().results[0].as_ref().unwrap().as_jpeg().unwrap();
        assert_eq!(jpeg.editable_path(), Some(path.as_path()));
        assert!(!dir.path().join("temp").exists());
    }

    #[test]
    fn test_remote_jpeg_gets_temp_copy() {
        let dir = tempfile::tempdir().unwrap();
        let data = encoded(ImageFormat::Jpeg);
        let config = small_reads(&dir);
        let source = BytesSource {
            bytes: data.clone(),
            reader: ReaderChunkSource::new(&config),
        };
        let mut session = Session::open(
            DocumentLocation::parse("https://example.org/photo.jpg"),
            ImageCodec::new(),
            Collect::default(),
            config,
            &source,
        )
        .unwrap();
        assert_eq!(session.run(), DecodeState::Finished);

        let jpeg = session.observer().results[0].as_ref().unwrap().as_jpeg().unwrap();
        let temp = jpeg.temp_path.as_ref().unwrap();
        assert!(temp.starts_with(dir.path().join("temp")));
        assert_eq!(std::fs::read(temp).unwrap(), data);
    }

    #[test]
    fn test_truncated_source_fails_once() {
        let dir = tempfile::tempdir().unwrap();
        let data = encoded(ImageFormat::Png);
        let config = small_reads(&dir);
        let source = BytesSource {
            bytes: data[..data.len() * 2 / 3].to_vec(),
            reader: ReaderChunkSource::new(&config),
        };
        let mut session = Session::open(
            DocumentLocation::parse("-"),
            ImageCodec::new(),
            Collect::default(),
            config,
            &source,
        )
        .unwrap();
        assert_eq!(session.run(), DecodeState::Failed);
        assert!(session.scheduler().used_fallback());

        let results = &session.observer().results;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(DecodeError::SyncDecode(_))));
    }

    #[test]
    fn test_suspended_session_buffers_until_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let data = encoded(ImageFormat::Png);
        let config = small_reads(&dir);
        let source = BytesSource {
            bytes: data.clone(),
            reader: ReaderChunkSource::new(&config),
        };
        let mut session = Session::open(
            DocumentLocation::parse("https://example.org/pic.png"),
            ImageCodec::new(),
            Collect::default(),
            config,
            &source,
        )
        .unwrap();
        session.suspend();
        assert_eq!(session.run(), DecodeState::Suspended);
        assert_eq!(session.scheduler().buffered_len(), data.len());
        assert_eq!(session.scheduler().read_cursor(), 0);
        assert!(session.observer().results.is_empty());

        session.resume();
        assert_eq!(session.run(), DecodeState::Finished);
        assert_eq!(session.observer().results.len(), 1);
    }

    #[test]
    fn test_stalled_source_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_reads(&dir).with_stall_timeout(Some(Duration::from_millis(50)));
        let source = SilentSource::default();
        let mut session = Session::open(
            DocumentLocation::parse("https://example.org/slow.png"),
            ImageCodec::new(),
            Collect::default(),
            config,
            &source,
        )
        .unwrap();
        assert_eq!(session.run(), DecodeState::Failed);
        let results = &session.observer().results;
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(DecodeError::SourceIo(SourceError::Stalled(_)))
        ));
    }

    #[test]
    fn test_vanished_source_is_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::open(
            DocumentLocation::parse("https://example.org/gone.png"),
            ImageCodec::new(),
            Collect::default(),
            small_reads(&dir),
            &VanishingSource,
        )
        .unwrap();
        assert_eq!(session.run(), DecodeState::Failed);
        assert!(matches!(
            session.observer().results[0],
            Err(DecodeError::SourceIo(SourceError::Disconnected))
        ));
    }

    #[test]
    fn test_missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_reads(&dir);
        let source = ReaderChunkSource::new(&config);
        let result = Session::open(
            DocumentLocation::Local(dir.path().join("nope.png")),
            ImageCodec::new(),
            Collect::default(),
            config,
            &source,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_cancelled_session_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_reads(&dir);
        let source = BytesSource {
            bytes: encoded(ImageFormat::Png),
            reader: ReaderChunkSource::new(&config),
        };
        let mut session = Session::open(
            DocumentLocation::parse("https://example.org/pic.png"),
            ImageCodec::new(),
            Collect::default(),
            config,
            &source,
        )
        .unwrap();
        session.cancel();
        session.run();
        assert!(session.observer().results.is_empty());
        assert!(session.observer().sizes.is_empty());
    }
}
