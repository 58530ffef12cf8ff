//! Hand-off from a finished decode to the loaded-document representation.

use std::io::Write;
use std::path::PathBuf;

use image::{DynamicImage, ImageFormat};
use tracing::{debug, info};

use crate::config::DecodeConfig;
use crate::error::DecodeError;
use crate::models::{DocumentLocation, JpegDocument, LoadedDocument, LoadedImage};

const TEMP_PREFIX: &str = "idxd-remote-";

/// Promote images with an alpha channel to at least 32 bits per pixel.
///
/// Returns the image and whether it was converted. Images without alpha keep
/// the decoder's native depth.
pub fn normalize_depth(image: DynamicImage) -> (DynamicImage, bool) {
    let color = image.color();
    if color.has_alpha() && color.bits_per_pixel() < 32 {
        debug!(?color, "Converting to RGBA8 for compositing");
        return (DynamicImage::ImageRgba8(image.to_rgba8()), true);
    }
    (image, false)
}

/// Builds the next-stage document for a decoded image.
pub struct FormatFinalizer {
    temp_dir: PathBuf,
}

impl FormatFinalizer {
    pub fn new(temp_dir: PathBuf) -> Self {
        Self { temp_dir }
    }

    pub fn from_config(config: &DecodeConfig) -> Self {
        Self::new(config.resolved_temp_dir())
    }

    /// Consume the decoded image and raw bytes.
    ///
    /// JPEGs keep their raw bytes and get a local file for metadata editing:
    /// the source itself when it is local, otherwise a temporary copy.
    pub fn finalize(
        &self,
        format: ImageFormat,
        image: DynamicImage,
        raw: Vec<u8>,
        location: &DocumentLocation,
    ) -> Result<LoadedDocument, DecodeError> {
        if format != ImageFormat::Jpeg {
            return Ok(LoadedDocument::Image(LoadedImage { format, image }));
        }

        let (temp_path, source_path) = match location.local_path() {
            Some(path) => (None, Some(path.to_path_buf())),
            None => {
                let path = self
                    .persist_temp_copy(&raw)
                    .map_err(DecodeError::TempFile)?;
                info!(?path, bytes = raw.len(), "Wrote local copy of remote JPEG");
                (Some(path), None)
            }
        };

        Ok(LoadedDocument::Jpeg(JpegDocument {
            image,
            raw,
            temp_path,
            source_path,
        }))
    }

    /// Write `raw` to a new file under the temp dir and keep it on disk.
    fn persist_temp_copy(&self, raw: &[u8]) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.temp_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".jpg")
            .tempfile_in(&self.temp_dir)?;
        file.write_all(raw)?;
        file.flush()?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }
}
