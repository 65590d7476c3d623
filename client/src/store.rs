use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use common::{payloads::UploadResponse, Priority, SlideRecord, SlideState, Status};
use log::debug;
use tokio::sync::watch;

pub type Snapshot = Arc<Vec<SlideRecord>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no slide with id {0}")]
    NotFound(String),
    #[error("slide {0} is already in the store")]
    DuplicateId(String),
    #[error("slide {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: Status, to: Status },
    #[error("slide {0} is holding the scan slot")]
    SlotBusy(String),
    #[error("slide {id} is {status}, not queued")]
    NotQueued { id: String, status: Status },
    #[error("slide {id} is still {status}")]
    NotFinished { id: String, status: Status },
    #[error("slide {id} has already finished ({status})")]
    AlreadyFinished { id: String, status: Status },
}

/// Milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// The single source of truth for slide records.
///
/// Every mutation reads the latest snapshot, builds the next one and commits
/// it while holding the channel's write lock, so concurrent handlers never
/// lose each other's updates. Rejected mutations leave the snapshot (and
/// subscribers) untouched. Clones share the same store.
#[derive(Clone, Debug)]
pub struct SlideStore {
    tx: Arc<watch::Sender<Snapshot>>,
    clock: Arc<AtomicU64>,
}

impl Default for SlideStore {
    fn default() -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            tx: Arc::new(tx),
            clock: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl SlideStore {
    pub fn with_records(records: Vec<SlideRecord>) -> Result<Self, StoreError> {
        let store = Self::default();
        store.replace_all(records)?;
        Ok(store)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    /// A receiver that observes every committed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<SlideRecord> {
        self.tx.borrow().iter().find(|s| s.file_id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical upload timestamp: wall clock, but always later than anything
    /// handed out before so same-millisecond uploads keep their order.
    pub fn next_upload_time(&self) -> u64 {
        let now = now_ms();
        let prev = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            });
        match prev {
            Ok(last) | Err(last) => now.max(last.saturating_add(1)),
        }
    }

    fn apply<T>(
        &self,
        f: impl FnOnce(&mut Vec<SlideRecord>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut outcome = None;
        self.tx.send_if_modified(|current| {
            let mut next = current.as_ref().clone();
            let result = f(&mut next);
            let commit = result.is_ok();
            if commit {
                *current = Arc::new(next);
            }
            outcome = Some(result);
            commit
        });
        outcome.unwrap_or_else(|| unreachable!("send_if_modified runs its closure"))
    }

    pub fn append(&self, record: SlideRecord) -> Result<(), StoreError> {
        self.clock.fetch_max(record.upload_time, Ordering::SeqCst);
        self.apply(|slides| {
            if slides.iter().any(|s| s.file_id == record.file_id) {
                return Err(StoreError::DuplicateId(record.file_id));
            }
            debug!("appending slide {} ({})", record.file_id, record.status());
            slides.push(record);
            Ok(())
        })
    }

    /// Turns a successful upload into a new queued record.
    pub fn append_upload(&self, upload: UploadResponse) -> Result<SlideRecord, StoreError> {
        let record = SlideRecord::queued(
            upload.file_id,
            upload.filename,
            upload.saved_as,
            self.next_upload_time(),
        );
        self.append(record.clone())?;
        Ok(record)
    }

    pub fn replace_all(&self, records: Vec<SlideRecord>) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        let mut scanning = None;
        for record in &records {
            if !seen.insert(record.file_id.as_str()) {
                return Err(StoreError::DuplicateId(record.file_id.clone()));
            }
            if record.status() == Status::Scanning {
                if let Some(other) = scanning.replace(record.file_id.as_str()) {
                    return Err(StoreError::SlotBusy(other.to_string()));
                }
            }
        }
        if let Some(latest) = records.iter().map(|r| r.upload_time).max() {
            self.clock.fetch_max(latest, Ordering::SeqCst);
        }
        self.apply(|slides| {
            *slides = records;
            Ok(())
        })
    }

    /// Moves a queued slide into the scan slot.
    pub fn begin_scan(&self, id: &str) -> Result<SlideRecord, StoreError> {
        self.apply(|slides| {
            if let Some(busy) = slides.iter().find(|s| s.status() == Status::Scanning) {
                return Err(StoreError::SlotBusy(busy.file_id.clone()));
            }
            let slide = find_mut(slides, id)?;
            check_transition(slide, Status::Scanning)?;
            slide.state = SlideState::Scanning { progress: 0 };
            debug!("slide {id} is scanning");
            Ok(slide.clone())
        })
    }

    pub fn set_progress(&self, id: &str, progress: u8) -> Result<(), StoreError> {
        self.apply(|slides| {
            let slide = find_mut(slides, id)?;
            match &mut slide.state {
                SlideState::Scanning { progress: p } => {
                    *p = progress.min(100);
                    Ok(())
                }
                other => Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: other.status(),
                    to: Status::Scanning,
                }),
            }
        })
    }

    /// Moves the scanning slide into a terminal state.
    pub fn finish_scan(&self, id: &str, state: SlideState) -> Result<SlideRecord, StoreError> {
        self.apply(|slides| {
            let slide = find_mut(slides, id)?;
            check_transition(slide, state.status())?;
            debug!("slide {id} is {}", state.status());
            slide.state = state;
            Ok(slide.clone())
        })
    }

    /// Escalates a queued slide to high priority. Idempotent.
    pub fn prioritise(&self, id: &str) -> Result<SlideRecord, StoreError> {
        self.apply(|slides| {
            let slide = find_mut(slides, id)?;
            if slide.status() != Status::Queued {
                return Err(StoreError::NotQueued {
                    id: id.to_string(),
                    status: slide.status(),
                });
            }
            slide.priority = Priority::High;
            Ok(slide.clone())
        })
    }

    /// Drops a slide that has not finished yet.
    pub fn cancel(&self, id: &str) -> Result<SlideRecord, StoreError> {
        self.remove_if(id, |status| {
            if status.is_terminal() {
                Err(StoreError::AlreadyFinished {
                    id: id.to_string(),
                    status,
                })
            } else {
                Ok(())
            }
        })
    }

    /// Drops a completed or failed slide.
    pub fn remove_finished(&self, id: &str) -> Result<SlideRecord, StoreError> {
        self.remove_if(id, |status| {
            if status.is_terminal() {
                Ok(())
            } else {
                Err(StoreError::NotFinished {
                    id: id.to_string(),
                    status,
                })
            }
        })
    }

    fn remove_if(
        &self,
        id: &str,
        allowed: impl FnOnce(Status) -> Result<(), StoreError>,
    ) -> Result<SlideRecord, StoreError> {
        self.apply(|slides| {
            let idx = slides
                .iter()
                .position(|s| s.file_id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            allowed(slides[idx].status())?;
            debug!("removing slide {id}");
            Ok(slides.remove(idx))
        })
    }
}

fn find_mut<'a>(slides: &'a mut [SlideRecord], id: &str) -> Result<&'a mut SlideRecord, StoreError> {
    slides
        .iter_mut()
        .find(|s| s.file_id == id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

fn check_transition(slide: &SlideRecord, to: Status) -> Result<(), StoreError> {
    let from = slide.status();
    if from.can_advance_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id: slide.file_id.clone(),
            from,
            to,
        })
    }
}

/// The slide the scheduler should pick next: smallest `(priority rank,
/// upload time)` among queued slides, earliest in the list on a tie.
pub fn next_queued(slides: &[SlideRecord]) -> Option<&SlideRecord> {
    slides
        .iter()
        .filter(|s| s.status() == Status::Queued)
        .min_by_key(|s| s.queue_key())
}

pub fn scanning(slides: &[SlideRecord]) -> Option<&SlideRecord> {
    slides.iter().find(|s| s.status() == Status::Scanning)
}
