use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use common::{
    payloads::{MetadataMap, MetadataUpdate},
    Priority, SavedMeta, SlideRecord, SlideState, Status,
};
use log::{debug, error, info, warn};

use crate::{api::SlideService, store::SlideStore};

/// Where slide priority and status survive restarts.
#[async_trait]
pub trait MetadataPort: Send + Sync {
    /// Mirrors `{priority, status, uploadTime}` of every record. Failures are logged and
    /// skipped; returns how many records were saved.
    async fn save(&self, records: &[SlideRecord]) -> usize;

    /// Everything saved so far, keyed by file id. Empty if unreadable.
    async fn load_all(&self) -> MetadataMap;
}

/// Keeps metadata on the backend's metadata endpoint.
pub struct RemoteMetadata {
    service: Arc<dyn SlideService>,
}

impl RemoteMetadata {
    pub fn new(service: Arc<dyn SlideService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MetadataPort for RemoteMetadata {
    async fn save(&self, records: &[SlideRecord]) -> usize {
        let mut saved = 0;
        for record in records {
            let update = MetadataUpdate {
                priority: record.priority,
                status: record.status(),
                upload_time: record.upload_time,
            };
            match self.service.save_metadata(&record.file_id, &update).await {
                Ok(()) => saved += 1,
                Err(e) => warn!("failed to save metadata for {}: {e}", record.file_id),
            }
        }
        saved
    }

    async fn load_all(&self) -> MetadataMap {
        match self.service.load_metadata().await {
            Ok(map) => map,
            Err(e) => {
                warn!("failed to load metadata, using defaults: {e}");
                MetadataMap::new()
            }
        }
    }
}

/// The backend stores uploads as `<file_id><ext>`.
pub fn file_id_of(saved_as: &str) -> Option<&str> {
    if saved_as.starts_with('.') {
        return None;
    }
    saved_as.split('.').next().filter(|id| !id.is_empty())
}

fn restored_state(status: Option<Status>) -> SlideState {
    match status {
        // a scan in flight when the last session ended lost its slot
        None | Some(Status::Queued) | Some(Status::Scanning) => SlideState::Queued,
        Some(Status::Completed) => SlideState::Completed { result: None },
        Some(Status::Failed) => SlideState::Failed {
            reason: "failed in an earlier session".to_string(),
        },
    }
}

fn parse_label<T: std::str::FromStr>(file_id: &str, raw: Option<&str>) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = raw?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("{file_id}: ignoring saved metadata: {e}");
            None
        }
    }
}

/// Builds records from the backend listing, overlaying saved metadata.
///
/// Missing or unreadable metadata falls back to `normal` priority, `queued`
/// status and `fallback_time + position` as upload time. Pure, so applying it
/// twice to the same inputs gives the same records.
pub fn hydrate(listing: &[String], saved: &MetadataMap, fallback_time: u64) -> Vec<SlideRecord> {
    let empty = SavedMeta::default();
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(listing.len());
    for (index, name) in listing.iter().enumerate() {
        let Some(file_id) = file_id_of(name) else {
            debug!("skipping {name:?} in slide listing");
            continue;
        };
        if !seen.insert(file_id) {
            warn!("file id {file_id} listed twice; keeping the first");
            continue;
        }
        let meta = saved.get(file_id).unwrap_or(&empty);
        let priority: Priority =
            parse_label(file_id, meta.priority.as_deref()).unwrap_or_default();
        let status: Option<Status> = parse_label(file_id, meta.status.as_deref());
        let upload_time = meta
            .upload_time
            .unwrap_or_else(|| fallback_time.saturating_add(index as u64));
        records.push(SlideRecord {
            file_id: file_id.to_string(),
            filename: name.clone(),
            saved_as: name.clone(),
            priority,
            upload_time,
            state: restored_state(status),
        });
    }
    records
}

/// Lists the backend's slides, overlays saved metadata and builds a store.
/// Any failure leaves the affected part at its defaults.
pub async fn load_store(
    service: &dyn SlideService,
    port: &dyn MetadataPort,
    now: u64,
) -> SlideStore {
    let listing = match service.list_slides().await {
        Ok(listing) => listing,
        Err(e) => {
            warn!("failed to list slides, starting empty: {e}");
            Vec::new()
        }
    };
    let saved = port.load_all().await;
    let records = hydrate(&listing, &saved, now);
    info!("loaded {} slides", records.len());
    SlideStore::with_records(records).unwrap_or_else(|e| {
        error!("hydrated slides are inconsistent, starting empty: {e}");
        SlideStore::default()
    })
}
