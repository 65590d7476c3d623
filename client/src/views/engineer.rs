use std::fmt;

use common::{SlideRecord, Status};

use super::pathologist::{as_percent, metric};

/// Aggregates over the scanned slides, shown above the queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dashboard {
    /// Mean model accuracy in percent.
    pub accuracy: Option<f64>,
    pub avg_processing_ms: Option<f64>,
    /// Mean tissue quality in percent.
    pub quality: Option<f64>,
    pub queued: usize,
    pub scanning: usize,
    pub completed: usize,
    pub failed: usize,
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0u32), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / f64::from(n))
}

impl Dashboard {
    pub fn from_records(slides: &[SlideRecord]) -> Self {
        let count = |status: Status| slides.iter().filter(|s| s.status() == status).count();
        let results: Vec<_> = slides.iter().filter_map(SlideRecord::result).collect();
        Self {
            accuracy: mean(
                results
                    .iter()
                    .filter_map(|r| metric(&r.model_info, &["accuracy"]))
                    .map(as_percent),
            ),
            avg_processing_ms: mean(results.iter().map(|r| r.processing_ms as f64)),
            quality: mean(
                results
                    .iter()
                    .filter_map(|r| metric(&r.qc_metrics, &["quality", "tissue_quality"]))
                    .map(as_percent),
            ),
            queued: count(Status::Queued),
            scanning: count(Status::Scanning),
            completed: count(Status::Completed),
            failed: count(Status::Failed),
        }
    }
}

impl fmt::Display for Dashboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dash = || "--".to_string();
        let rows = [
            (
                "Model Accuracy",
                self.accuracy.map_or_else(dash, |v| format!("{v:.1}%")),
                "Model performs well on recent scans.",
            ),
            (
                "Avg Processing Time",
                self.avg_processing_ms
                    .map_or_else(dash, |v| format!("{:.1}s", v / 1000.0)),
                "Single scan slot; see queue below.",
            ),
            (
                "Tissue Quality",
                self.quality.map_or_else(dash, |v| format!("{v:.1}%")),
                "Quality threshold acceptable.",
            ),
        ];
        for (label, value, insight) in rows {
            writeln!(f, "{label:<20} {value:>7}  {insight}")?;
        }
        writeln!(
            f,
            "{} queued, {} scanning, {} completed, {} failed",
            self.queued, self.scanning, self.completed, self.failed
        )
    }
}
