use std::path::{Path, PathBuf};

use image::{DynamicImage, GenericImageView, ImageFormat};

/// Where a document's bytes come from.
///
/// Only the local/non-local distinction matters to the decode core: it decides
/// whether a JPEG needs a temporary local copy for metadata editing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentLocation {
    /// A file on the local file system.
    Local(PathBuf),
    /// The process's standard input.
    Stdin,
    /// A URL with any scheme other than `file`.
    Remote(String),
}

impl DocumentLocation {
    /// Interpret a command-line style location.
    ///
    /// `file://` URLs and bare paths are local, `-` is standard input, and
    /// any other `scheme://` URL is remote.
    pub fn parse(input: &str) -> Self {
        if input == "-" {
            return Self::Stdin;
        }
        if let Some(rest) = input.strip_prefix("file://") {
            let rest = rest.strip_prefix("localhost").unwrap_or(rest);
            return Self::Local(PathBuf::from(rest));
        }
        if input.contains("://") {
            return Self::Remote(input.to_string());
        }
        Self::Local(PathBuf::from(input))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path),
            Self::Stdin | Self::Remote(_) => None,
        }
    }

    /// Human-readable form for logs.
    pub fn display_name(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::Stdin => "stdin".to_string(),
            Self::Remote(url) => url.clone(),
        }
    }
}

/// A decoded document of any format without extra artifacts.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub format: ImageFormat,
    pub image: DynamicImage,
}

/// A decoded JPEG document.
///
/// Keeps the original bytes and a local path so comment/metadata editing can
/// operate on a file. The temporary file, when present, belongs to this value's
/// owner from now on; the decode core never deletes it.
#[derive(Debug, Clone)]
pub struct JpegDocument {
    pub image: DynamicImage,
    pub raw: Vec<u8>,
    /// Temporary local copy written for non-local sources.
    pub temp_path: Option<PathBuf>,
    /// The source's own path for local sources.
    pub source_path: Option<PathBuf>,
}

impl JpegDocument {
    /// Local file the metadata editor should operate on.
    pub fn editable_path(&self) -> Option<&Path> {
        self.temp_path.as_deref().or(self.source_path.as_deref())
    }
}

/// Next-stage representation produced when a decode session succeeds.
#[derive(Debug, Clone)]
pub enum LoadedDocument {
    Image(LoadedImage),
    Jpeg(JpegDocument),
}

impl LoadedDocument {
    pub fn format(&self) -> ImageFormat {
        match self {
            Self::Image(loaded) => loaded.format,
            Self::Jpeg(_) => ImageFormat::Jpeg,
        }
    }

    pub fn image(&self) -> &DynamicImage {
        match self {
            Self::Image(loaded) => &loaded.image,
            Self::Jpeg(jpeg) => &jpeg.image,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image().dimensions()
    }

    pub fn as_jpeg(&self) -> Option<&JpegDocument> {
        match self {
            Self::Jpeg(jpeg) => Some(jpeg),
            Self::Image(_) => None,
        }
    }
}
