use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} label `{value}`")]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub value: String,
}

/// Scheduling weight of a slide. `High` is serviced first.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Older clients called this `urgent`.
    #[serde(alias = "urgent")]
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "urgent" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(UnknownLabel {
                kind: "priority",
                value: s.to_string(),
            }),
        }
    }
}

/// Flat status label, as stored by the metadata endpoint.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting for the scan slot.
    Queued,
    /// Holding the scan slot; the prediction request is in flight.
    Scanning,
    /// The prediction succeeded. Terminal.
    #[serde(alias = "complete")]
    Completed,
    /// The prediction failed or could not be read. Terminal.
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Scanning => "scanning",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The only legal moves are `queued -> scanning -> completed | failed`.
    pub fn can_advance_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Scanning)
                | (Self::Scanning, Self::Completed)
                | (Self::Scanning, Self::Failed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Status {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "scanning" => Ok(Self::Scanning),
            "completed" | "complete" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownLabel {
                kind: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// What a successful prediction attaches to a slide.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ScanResult {
    pub heatmap_url: String,
    pub model_info: Value,
    pub qc_metrics: Value,
    /// Wall time between taking the scan slot and the prediction landing.
    pub processing_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SlideState {
    Queued,
    Scanning {
        /// Cosmetic percentage, 0..=100.
        progress: u8,
    },
    Completed {
        /// `None` when the record was rebuilt from saved metadata, which does
        /// not keep prediction payloads.
        result: Option<ScanResult>,
    },
    Failed {
        reason: String,
    },
}

impl SlideState {
    pub fn status(&self) -> Status {
        match self {
            Self::Queued => Status::Queued,
            Self::Scanning { .. } => Status::Scanning,
            Self::Completed { .. } => Status::Completed,
            Self::Failed { .. } => Status::Failed,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SlideRecord {
    /** Stable id handed out by the backend at upload time */
    pub file_id: String,
    /** Name the user uploaded */
    pub filename: String,
    /** Name the backend stored the file under */
    pub saved_as: String,
    pub priority: Priority,
    /** Logical ordering timestamp in milliseconds; tie-break for equal priorities */
    pub upload_time: u64,
    pub state: SlideState,
}

impl SlideRecord {
    pub fn queued(
        file_id: String,
        filename: String,
        saved_as: String,
        upload_time: u64,
    ) -> Self {
        Self {
            file_id,
            filename,
            saved_as,
            priority: Priority::Normal,
            upload_time,
            state: SlideState::Queued,
        }
    }

    pub fn status(&self) -> Status {
        self.state.status()
    }

    /// Smaller keys are scanned first.
    pub fn queue_key(&self) -> (u8, u64) {
        (self.priority.rank(), self.upload_time)
    }

    pub fn result(&self) -> Option<&ScanResult> {
        match &self.state {
            SlideState::Completed { result } => result.as_ref(),
            _ => None,
        }
    }

    pub fn heatmap_url(&self) -> Option<&str> {
        self.result().map(|r| r.heatmap_url.as_str())
    }

    pub fn progress(&self) -> Option<u8> {
        match self.state {
            SlideState::Scanning { progress } => Some(progress),
            _ => None,
        }
    }
}

/// Metadata as the backend keeps it. Labels stay raw strings so that one
/// unexpected value does not make the whole map unreadable.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SavedMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, rename = "uploadTime", skip_serializing_if = "Option::is_none")]
    pub upload_time: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::{Priority, SavedMeta, SlideRecord, SlideState, Status};

    #[test]
    fn status_serialization() {
        let tests = [
            (Status::Queued, "queued"),
            (Status::Scanning, "scanning"),
            (Status::Completed, "completed"),
            (Status::Failed, "failed"),
        ];
        for (src, expected) in tests {
            assert_eq!(
                serde_json::from_str::<Status>(&serde_json::to_string(&src).unwrap()).unwrap(),
                src
            );
            assert_eq!(format!("{}", &src), expected);
            assert_eq!(serde_json::to_value(src).unwrap().as_str().unwrap(), expected);
            assert_eq!(expected.parse::<Status>().unwrap(), src);
        }
    }

    #[test]
    fn legacy_labels_are_accepted() {
        assert_eq!(serde_json::from_str::<Status>("\"complete\"").unwrap(), Status::Completed);
        assert_eq!(serde_json::from_str::<Priority>("\"urgent\"").unwrap(), Priority::High);
        assert_eq!("URGENT".parse::<Priority>().unwrap(), Priority::High);
        assert!("processing".parse::<Status>().is_err());
    }

    #[test]
    fn only_forward_transitions() {
        use Status::*;
        let all = [Queued, Scanning, Completed, Failed];
        for from in all {
            for to in all {
                let expected = matches!(
                    (from, to),
                    (Queued, Scanning) | (Scanning, Completed) | (Scanning, Failed)
                );
                assert_eq!(from.can_advance_to(to), expected, "{from} -> {to}");
            }
        }
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!Queued.is_terminal() && !Scanning.is_terminal());
    }

    #[test]
    fn queue_key_orders_priority_before_time() {
        let mut early_low = SlideRecord::queued("a".into(), "a.png".into(), "a.png".into(), 1);
        early_low.priority = Priority::Low;
        let mut late_high = SlideRecord::queued("b".into(), "b.png".into(), "b.png".into(), 9);
        late_high.priority = Priority::High;
        assert!(late_high.queue_key() < early_low.queue_key());
    }

    #[test]
    fn state_is_tagged_by_status() {
        let value = serde_json::to_value(SlideState::Scanning { progress: 40 }).unwrap();
        assert_eq!(value, serde_json::json!({"status": "scanning", "progress": 40}));
        let failed: SlideState =
            serde_json::from_value(serde_json::json!({"status": "failed", "reason": "x"})).unwrap();
        assert_eq!(failed.status(), Status::Failed);
    }

    #[test]
    fn saved_meta_tolerates_unknown_labels() {
        let meta: SavedMeta =
            serde_json::from_str(r#"{"priority": "high", "status": "processing"}"#).unwrap();
        assert_eq!(meta.status.as_deref(), Some("processing"));
        assert_eq!(meta.upload_time, None);
    }
}
