use std::path::{Path, PathBuf};

use common::SlideRecord;
use log::{info, warn};

use crate::{
    api::{ApiError, SlideService},
    store::{SlideStore, StoreError},
};

/// Whole-slide image formats the backend knows how to tile.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "svs"];

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
pub struct IntakeReport {
    /// New queued records, in file order.
    pub uploaded: Vec<SlideRecord>,
    pub failed: Vec<(PathBuf, IntakeError)>,
}

pub fn is_accepted(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |ext| {
            ACCEPTED_EXTENSIONS
                .iter()
                .any(|accepted| ext.eq_ignore_ascii_case(accepted))
        })
}

async fn upload_one(
    service: &dyn SlideService,
    store: &SlideStore,
    path: &Path,
) -> Result<SlideRecord, IntakeError> {
    if !is_accepted(path) {
        return Err(IntakeError::Unsupported(path.to_path_buf()));
    }
    let response = service.upload(path).await?;
    Ok(store.append_upload(response)?)
}

/// Uploads one file at a time. Every success appends a queued record; a
/// failure is logged and the rest of the batch carries on. `on_progress`
/// gets `(done, total)` after each file.
pub async fn upload_batch<P: AsRef<Path>>(
    service: &dyn SlideService,
    store: &SlideStore,
    paths: &[P],
    mut on_progress: impl FnMut(usize, usize),
) -> IntakeReport {
    let total = paths.len();
    let mut report = IntakeReport::default();
    for (i, path) in paths.iter().enumerate() {
        let path = path.as_ref();
        match upload_one(service, store, path).await {
            Ok(record) => {
                info!("uploaded {} as {}", path.display(), record.file_id);
                report.uploaded.push(record);
            }
            Err(e) => {
                warn!("upload of {} failed: {e}", path.display());
                report.failed.push((path.to_path_buf(), e));
            }
        }
        on_progress(i + 1, total);
    }
    report
}
