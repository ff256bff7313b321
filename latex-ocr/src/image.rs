//! Preconditions shared by every OCR request.
//!
//! Validation runs before any process or network call, so a bad path never
//! turns into an adapter-level timeout.

use std::path::{Path, PathBuf};

use log::debug;

use crate::backends::OcrError;

/// Raster formats Pillow can open on the server side.
/// Compared against the dot-stripped extension, case-sensitive.
pub const IMAGE_EXTENSIONS: [&str; 12] = [
    "png", "jpg", "jpeg", "bmp", "dib", "eps", "gif", "ppm", "pbm", "pgm", "pnm", "webp",
];

/// An image path that passed [`validate_image`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ImageFile {
    /// File name for notices, e.g. `formula.png`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.to_string_lossy().to_string())
    }
}

pub fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Check extension, existence and size, in that order.
pub fn validate_image(path: &Path) -> Result<ImageFile, OcrError> {
    if !is_supported_extension(path) {
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        return Err(OcrError::UnsupportedExtension(ext));
    }

    if !path.exists() {
        return Err(OcrError::FileNotFound(path.to_path_buf()));
    }

    let size_bytes = std::fs::metadata(path)?.len();
    debug!("Image {:?}: {} bytes", path, size_bytes);
    if size_bytes == 0 {
        return Err(OcrError::EmptyFile(path.to_path_buf()));
    }

    Ok(ImageFile {
        path: path.to_path_buf(),
        size_bytes,
    })
}

/// Surround recognized LaTeX with the configured delimiter (`$$`, `$` or nothing).
pub fn wrap_latex(delimiter: &str, latex: &str) -> String {
    format!("{}{}{}", delimiter, latex, delimiter)
}
