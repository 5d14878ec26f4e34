use std::path::PathBuf;

use docview_core::{SourceFile, ViewerConfig, ViewerError};
use tracing::warn;

#[derive(Debug, Default)]
pub struct Picked {
    pub accepted: Vec<SourceFile>,
    pub rejected: Vec<ViewerError>,
}

/// Splits candidate paths into files of the accepted media type and rejects.
/// Rejected files are reported, never loaded.
pub fn partition_by_media_type(paths: Vec<PathBuf>, config: &ViewerConfig) -> Picked {
    let mut picked = Picked::default();
    for path in paths {
        let shown = path.display().to_string();
        if !config.accepts(&path) {
            warn!(path = %shown, "skipping file of unsupported type");
            picked.rejected.push(ViewerError::UnsupportedFile(shown));
            continue;
        }
        match SourceFile::from_path(path) {
            Ok(file) => picked.accepted.push(file),
            Err(err) => {
                warn!(path = %shown, error = %err, "skipping unusable path");
                picked.rejected.push(ViewerError::UnsupportedFile(shown));
            }
        }
    }
    picked
}
