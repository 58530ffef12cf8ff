//! Chunk sources: where a session's bytes come from.
//!
//! - `ChunkSource` - opens a document and streams `SourceEvent`s over a channel
//! - `CancellationToken` - shared flag the session sets when it goes away
//! - `ReaderChunkSource` - reads local files or stdin on a worker thread
//!
//! Sources never touch session state. They only send events, and they check
//! the token before every read and every send so nothing arrives for a
//! session that was dropped.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use flume::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::config::DecodeConfig;
use crate::error::SourceError;
use crate::models::DocumentLocation;

/// Cooperative cancellation flag shared between a session and its source.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Message from a source to its session.
#[derive(Debug)]
pub enum SourceEvent {
    /// More bytes, in stream order.
    Data(Vec<u8>),
    /// Terminal result. Nothing follows.
    Finished(Result<(), SourceError>),
}

/// Provider of the bytes of one document.
pub trait ChunkSource {
    /// Start fetching `location`. Delivery stops once `cancel` is set.
    fn open(&self, location: &DocumentLocation, cancel: CancellationToken)
        -> Result<Receiver<SourceEvent>>;
}

/// Streams a local file or standard input from a background thread.
#[derive(Debug, Clone)]
pub struct ReaderChunkSource {
    block_size: usize,
    queue: usize,
}

impl ReaderChunkSource {
    pub fn new(config: &DecodeConfig) -> Self {
        Self {
            block_size: config.read_block_size.max(1),
            queue: config.source_queue.max(1),
        }
    }

    /// Stream any reader on a named worker thread.
    pub fn spawn_reader<R>(
        &self,
        name: &str,
        reader: R,
        cancel: CancellationToken,
    ) -> Result<Receiver<SourceEvent>>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = flume::bounded(self.queue);
        let block_size = self.block_size;
        thread::Builder::new()
            .name(format!("source-{}", name))
            .spawn(move || read_loop(reader, block_size, tx, cancel))
            .context("Failed to spawn source reader thread")?;
        Ok(rx)
    }
}

impl ChunkSource for ReaderChunkSource {
    fn open(
        &self,
        location: &DocumentLocation,
        cancel: CancellationToken,
    ) -> Result<Receiver<SourceEvent>> {
        match location {
            DocumentLocation::Local(path) => {
                let file = File::open(path)
                    .with_context(|| format!("Failed to open image: {:?}", path))?;
                debug!(?path, "Opened local source");
                self.spawn_reader("file", file, cancel)
            }
            DocumentLocation::Stdin => {
                debug!("Reading document from stdin");
                self.spawn_reader("stdin", std::io::stdin(), cancel)
            }
            DocumentLocation::Remote(url) => {
                bail!("No reader available for remote location: {}", url)
            }
        }
    }
}

fn read_loop<R: Read>(
    mut reader: R,
    block_size: usize,
    tx: Sender<SourceEvent>,
    cancel: CancellationToken,
) {
    let mut total = 0usize;
    loop {
        if cancel.is_cancelled() {
            debug!(total, "Source cancelled");
            return;
        }

        let mut block = vec![0u8; block_size];
        let event = match reader.read(&mut block) {
            Ok(0) => {
                debug!(total, "Source finished");
                SourceEvent::Finished(Ok(()))
            }
            Ok(n) => {
                block.truncate(n);
                total += n;
                trace!(n, total, "Read block");
                SourceEvent::Data(block)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = ?e, total, "Source read failed");
                SourceEvent::Finished(Err(SourceError::Io(e)))
            }
        };

        let terminal = matches!(event, SourceEvent::Finished(_));
        if cancel.is_cancelled() || tx.send(event).is_err() || terminal {
            return;
        }
    }
}
