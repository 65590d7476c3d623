use std::{
    slice,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_stream::stream;
use common::{payloads::PredictResponse, ScanResult, SlideRecord, SlideState};
use futures_util::{pin_mut, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::{
    select,
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{ApiError, SlideService},
    persistence::MetadataPort,
    store::{next_queued, SlideStore, StoreError},
};

#[derive(Clone, Copy, Debug)]
pub struct ScanSettings {
    /// How often the queue looks for the next slide.
    pub poll_interval: Duration,
    /// Delay between two steps of the progress animation.
    pub progress_tick: Duration,
    /// Percentage added per animation step.
    pub progress_step: u8,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1500),
            progress_tick: Duration::from_millis(80),
            progress_step: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    Failed(String),
    /// The slide was cancelled (or vanished) before the scan settled.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("backend refused to delete {id}: {source}")]
    Delete {
        id: String,
        #[source]
        source: ApiError,
    },
}

/// Reason recorded for a scan cut short by shutdown.
pub const INTERRUPTED: &str = "scan interrupted";

struct ActiveScan {
    file_id: String,
    cancel: CancellationToken,
    /// Fires once the scan task has settled the record and freed the slot.
    done: CancellationToken,
}

/// Cosmetic scan animation: `step`, `2 * step`, ... capped at 100, one value
/// per `tick`. Ends after yielding 100.
pub fn progress_ticks(tick: Duration, step: u8) -> impl Stream<Item = u8> {
    let tick = tick.max(Duration::from_millis(1));
    let step = step.max(1);
    stream! {
        let mut timer = interval(tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer.tick().await; // the first tick completes immediately
        let mut progress: u8 = 0;
        while progress < 100 {
            timer.tick().await;
            progress = progress.saturating_add(step).min(100);
            yield progress;
        }
    }
}

/// Drives queued slides through the single scan slot.
///
/// Clones share the store, the backend and the slot.
#[derive(Clone)]
pub struct ScanQueue {
    store: SlideStore,
    service: Arc<dyn SlideService>,
    metadata: Arc<dyn MetadataPort>,
    settings: ScanSettings,
    slot: Arc<Mutex<Option<ActiveScan>>>,
}

impl ScanQueue {
    pub fn new(
        store: SlideStore,
        service: Arc<dyn SlideService>,
        metadata: Arc<dyn MetadataPort>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            store,
            service,
            metadata,
            settings,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &SlideStore {
        &self.store
    }

    pub fn settings(&self) -> ScanSettings {
        self.settings
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<ActiveScan>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// File id of the slide holding the scan slot.
    pub fn active(&self) -> Option<String> {
        self.lock_slot().as_ref().map(|a| a.file_id.clone())
    }

    /// Nothing scanning and nothing left to scan.
    pub fn is_idle(&self) -> bool {
        self.active().is_none() && next_queued(&self.store.snapshot()).is_none()
    }

    /// One poll of the queue. If the slot is free and a slide is queued, the
    /// best one (priority, then upload time) starts scanning and the handle
    /// of its scan is returned.
    pub fn tick(&self) -> Option<JoinHandle<ScanOutcome>> {
        let mut slot = self.lock_slot();
        if slot.is_some() {
            return None;
        }
        let snapshot = self.store.snapshot();
        let next = next_queued(&snapshot)?;
        let record = match self.store.begin_scan(&next.file_id) {
            Ok(record) => record,
            Err(e) => {
                warn!("could not start scan of {}: {e}", next.file_id);
                return None;
            }
        };
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        *slot = Some(ActiveScan {
            file_id: record.file_id.clone(),
            cancel: cancel.clone(),
            done: done.clone(),
        });
        drop(slot);

        info!("scanning {} ({})", record.file_id, record.filename);
        let queue = self.clone();
        let finished = done.drop_guard();
        Some(tokio::spawn(async move {
            let _finished = finished;
            queue.scan(record, cancel).await
        }))
    }

    /// Polls every `poll_interval` until `shutdown` fires. A scan still in
    /// flight at that point is interrupted: its slide is marked failed and
    /// saved before this returns, so the queue can be run again.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut timer = interval(self.settings.poll_interval.max(Duration::from_millis(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            select! {
                _ = timer.tick() => {
                    self.tick();
                }
                _ = shutdown.cancelled() => break,
            }
        }
        let active = self
            .lock_slot()
            .as_ref()
            .map(|a| (a.file_id.clone(), a.cancel.clone(), a.done.clone()));
        if let Some((id, cancel, done)) = active {
            info!("stopping; interrupting scan of {id}");
            cancel.cancel();
            done.cancelled().await;
        }
    }

    async fn scan(self, record: SlideRecord, cancel: CancellationToken) -> ScanOutcome {
        let id = record.file_id.clone();
        let started = Instant::now();
        // The animation and the prediction both have to finish.
        let work = async {
            let (_, _, prediction) = tokio::join!(
                self.metadata.save(slice::from_ref(&record)),
                self.animate(&id),
                self.service.predict(&id),
            );
            prediction
        };
        let settled = select! {
            _ = cancel.cancelled() => None,
            prediction = work => Some(settle(&id, prediction, started)),
        };
        let Some(state) = settled else {
            // A cancelled slide is already gone from the store; one that is
            // still here was interrupted by shutdown.
            let interrupted = SlideState::Failed {
                reason: INTERRUPTED.to_string(),
            };
            let outcome = match self.store.finish_scan(&id, interrupted) {
                Ok(record) => {
                    warn!("scan of {id} interrupted");
                    self.metadata.save(slice::from_ref(&record)).await;
                    ScanOutcome::Failed(INTERRUPTED.to_string())
                }
                Err(_) => {
                    info!("scan of {id} cancelled");
                    ScanOutcome::Cancelled
                }
            };
            self.release(&id);
            return outcome;
        };

        let outcome = match &state {
            SlideState::Failed { reason } => ScanOutcome::Failed(reason.clone()),
            _ => ScanOutcome::Completed,
        };
        // The slot is held until the outcome is saved, so an idle queue has
        // nothing left in flight.
        let outcome = match self.store.finish_scan(&id, state) {
            Ok(record) => {
                self.metadata.save(slice::from_ref(&record)).await;
                outcome
            }
            Err(e) => {
                warn!("dropping scan result for {id}: {e}");
                ScanOutcome::Cancelled
            }
        };
        self.release(&id);
        outcome
    }

    async fn animate(&self, id: &str) {
        let ticks = progress_ticks(self.settings.progress_tick, self.settings.progress_step);
        pin_mut!(ticks);
        while let Some(progress) = ticks.next().await {
            if let Err(e) = self.store.set_progress(id, progress) {
                debug!("stopping animation for {id}: {e}");
                break;
            }
        }
    }

    fn release(&self, id: &str) {
        let mut slot = self.lock_slot();
        if slot.as_ref().map_or(false, |a| a.file_id == id) {
            *slot = None;
        }
    }

    /// Moves a queued slide to the front of its class. Idempotent.
    pub async fn prioritise(&self, id: &str) -> Result<SlideRecord, ActionError> {
        let record = self.store.prioritise(id)?;
        info!("prioritised {id}");
        self.metadata.save(slice::from_ref(&record)).await;
        Ok(record)
    }

    /// Removes a slide that has not finished. If it holds the scan slot, the
    /// prediction request is aborted and the slot freed. The backend is not
    /// told.
    pub fn cancel(&self, id: &str) -> Result<SlideRecord, ActionError> {
        let record = self.store.cancel(id)?;
        let mut slot = self.lock_slot();
        if slot.as_ref().map_or(false, |a| a.file_id == id) {
            if let Some(active) = slot.take() {
                active.cancel.cancel();
                info!("aborted in-flight scan of {id}");
            }
        }
        info!("cancelled {id}");
        Ok(record)
    }

    /// Deletes a finished slide from the backend, then from the store. If the
    /// backend refuses, the slide stays.
    pub async fn delete(&self, id: &str) -> Result<SlideRecord, ActionError> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !record.status().is_terminal() {
            return Err(StoreError::NotFinished {
                id: id.to_string(),
                status: record.status(),
            }
            .into());
        }
        if let Err(source) = self.service.delete(id).await {
            warn!("delete of {id} failed: {source}");
            return Err(ActionError::Delete {
                id: id.to_string(),
                source,
            });
        }
        info!("deleted {id}");
        Ok(self.store.remove_finished(id)?)
    }
}

fn settle(id: &str, prediction: Result<PredictResponse, ApiError>, started: Instant) -> SlideState {
    let reason = match prediction.map(PredictResponse::into_outcome) {
        Ok(Ok(p)) => {
            let processing_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            info!("scan of {id} completed in {processing_ms}ms");
            return SlideState::Completed {
                result: Some(ScanResult {
                    heatmap_url: p.heatmap,
                    model_info: p.model_info,
                    qc_metrics: p.qc_metrics,
                    processing_ms,
                }),
            };
        }
        Ok(Err(reason)) => reason,
        Err(e) => e.to_string(),
    };
    warn!("scan of {id} failed: {reason}");
    SlideState::Failed { reason }
}
