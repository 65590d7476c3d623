use std::fmt;

use common::{SlideRecord, SlideState, Status};

/// The engineer's default screen: what is waiting, what is scanning, and
/// what already went through.
pub struct QueueView<'a> {
    slides: &'a [SlideRecord],
}

impl<'a> QueueView<'a> {
    pub fn new(slides: &'a [SlideRecord]) -> Self {
        Self { slides }
    }

    /// Scanning slide first, then queued slides in the order they will be
    /// picked up.
    pub fn pending(&self) -> Vec<&'a SlideRecord> {
        let mut pending: Vec<_> = self
            .slides
            .iter()
            .filter(|s| !s.status().is_terminal())
            .collect();
        pending.sort_by_key(|s| (s.status() != Status::Scanning, s.queue_key()));
        pending
    }

    pub fn with_status(&self, status: Status) -> Vec<&'a SlideRecord> {
        self.slides.iter().filter(|s| s.status() == status).collect()
    }
}

impl fmt::Display for QueueView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending();
        writeln!(f, "Scan Queue ({})", pending.len())?;
        for (index, slide) in pending.iter().enumerate() {
            let state = match slide.state {
                SlideState::Scanning { progress } => format!("scanning {progress}%"),
                _ => "queued".to_string(),
            };
            writeln!(
                f,
                "  L15-{:<4} {:<8} {:<36} {:<32} {state}",
                50 + index,
                format!("[{}]", slide.priority),
                slide.file_id,
                slide.filename,
            )?;
        }

        let completed = self.with_status(Status::Completed);
        writeln!(f, "Scanned Slides ({})", completed.len())?;
        for slide in completed {
            writeln!(
                f,
                "  {:<36} {:<32} {}",
                slide.file_id,
                slide.filename,
                slide.priority.as_str().to_uppercase()
            )?;
        }

        let failed = self.with_status(Status::Failed);
        if !failed.is_empty() {
            writeln!(f, "Failed ({})", failed.len())?;
            for slide in failed {
                if let SlideState::Failed { reason } = &slide.state {
                    writeln!(f, "  {:<36} {:<32} {reason}", slide.file_id, slide.filename)?;
                }
            }
        }
        Ok(())
    }
}
