//! Tunables for decode sessions.
//!
//! Defaults match the viewer's interactive behavior. Every field can be
//! overridden from the environment (`IDXD_*`) and, in the binary, from flags.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

/// Bytes handed to the incremental decoder per tick.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Minimum spacing between coalesced region notifications.
pub const DEFAULT_REGION_FLUSH_MS: u64 = 100;

/// Size of the blocks a reader source pulls from its input.
const DEFAULT_READ_BLOCK_KB: usize = 64;

/// Bounded channel depth between a source thread and the session loop.
const DEFAULT_SOURCE_QUEUE: usize = 16;

#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Bytes fed to the decoder per tick.
    pub chunk_size: usize,
    /// Region notifications closer together than this are coalesced.
    pub region_flush_interval: Duration,
    /// Fail the session when the source stays silent this long. `None` waits forever.
    pub stall_timeout: Option<Duration>,
    /// Directory for temporary copies of remote JPEGs. `None` picks a default.
    pub temp_dir: Option<PathBuf>,
    /// Read size used by reader-backed chunk sources.
    pub read_block_size: usize,
    /// Channel capacity between source thread and session.
    pub source_queue: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            region_flush_interval: Duration::from_millis(DEFAULT_REGION_FLUSH_MS),
            stall_timeout: None,
            temp_dir: None,
            read_block_size: DEFAULT_READ_BLOCK_KB * 1024,
            source_queue: DEFAULT_SOURCE_QUEUE,
        }
    }
}

impl DecodeConfig {
    /// Defaults with any `IDXD_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = env_usize("IDXD_DECODE_CHUNK_SIZE") {
            config.chunk_size = size;
        }
        if let Some(ms) = env_u64("IDXD_REGION_FLUSH_MS") {
            config.region_flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("IDXD_STALL_TIMEOUT_MS") {
            config.stall_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(kb) = env_usize("IDXD_READ_BLOCK_KB") {
            config.read_block_size = kb * 1024;
        }
        if let Ok(dir) = std::env::var("IDXD_TEMP_DIR") {
            if !dir.trim().is_empty() {
                config.temp_dir = Some(PathBuf::from(dir));
            }
        }
        config
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_temp_dir(mut self, dir: PathBuf) -> Self {
        self.temp_dir = Some(dir);
        self
    }

    pub fn with_read_block_size(mut self, size: usize) -> Self {
        self.read_block_size = size.max(1);
        self
    }

    /// Directory temporary copies are written to.
    ///
    /// Falls back to `XDG_CACHE_HOME/idxd/remote`, then to the system temp dir.
    pub fn resolved_temp_dir(&self) -> PathBuf {
        if let Some(dir) = &self.temp_dir {
            return dir.clone();
        }
        ProjectDirs::from("", "", "idxd")
            .map(|dirs| dirs.cache_dir().join("remote"))
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}
