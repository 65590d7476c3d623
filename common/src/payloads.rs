use std::collections::HashMap;

use crate::data::{Priority, SavedMeta, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Response payloads

/// `GET /slides`: names of the files the backend currently stores.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SlideListing {
    pub slides: Vec<String>,
}

/// `GET /slides/metadata/all`, keyed by file id.
pub type MetadataMap = HashMap<String, SavedMeta>;

/// `POST /upload`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadResponse {
    pub file_id: String,
    pub filename: String,
    pub saved_as: String,
}

/// `POST /predict?file_id=...`. Either a success with the result payloads
/// or `{"success": false, "error": ...}`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PredictResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub heatmap: Option<String>,
    #[serde(default)]
    pub model_info: Option<Value>,
    #[serde(default)]
    pub qc_metrics: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prediction {
    pub heatmap: String,
    pub model_info: Value,
    pub qc_metrics: Value,
}

impl PredictResponse {
    /// Err carries the reason the scan should be marked failed.
    pub fn into_outcome(self) -> Result<Prediction, String> {
        if !self.success {
            return Err(self.error.unwrap_or_else(|| "prediction failed".to_string()));
        }
        match self.heatmap {
            Some(heatmap) => Ok(Prediction {
                heatmap,
                model_info: self.model_info.unwrap_or(Value::Null),
                qc_metrics: self.qc_metrics.unwrap_or(Value::Null),
            }),
            None => Err("prediction response has no heatmap".to_string()),
        }
    }
}

/// Generic acknowledgement for writes and deletes. A body without a
/// `success` flag counts as accepted.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Ack {
    #[serde(default = "accepted")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn accepted() -> bool {
    true
}

// Request payloads

/// `POST /slides/{fileId}/metadata`. The backend keeps the body as sent, so
/// the upload time rides along to keep the queue order across sessions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MetadataUpdate {
    pub priority: Priority,
    pub status: Status,
    #[serde(rename = "uploadTime")]
    pub upload_time: u64,
}

#[cfg(test)]
mod tests {
    use super::{Ack, MetadataUpdate, PredictResponse};
    use crate::data::{Priority, Status};
    use serde_json::json;

    #[test]
    fn failed_prediction_carries_reason() {
        let resp: PredictResponse =
            serde_json::from_value(json!({"success": false, "error": "x"})).unwrap();
        assert_eq!(resp.into_outcome(), Err("x".to_string()));
    }

    #[test]
    fn successful_prediction_needs_heatmap() {
        let resp: PredictResponse = serde_json::from_value(json!({
            "success": true,
            "heatmap": "/heatmaps/abc.png",
            "model_info": {"accuracy": 0.9},
        }))
        .unwrap();
        let prediction = resp.into_outcome().unwrap();
        assert_eq!(prediction.heatmap, "/heatmaps/abc.png");
        assert!(prediction.qc_metrics.is_null());

        let bare: PredictResponse = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(bare.into_outcome().is_err());
    }

    #[test]
    fn ack_defaults_to_success() {
        let ack: Ack = serde_json::from_str("{}").unwrap();
        assert!(ack.success);
        let ack: Ack =
            serde_json::from_str(r#"{"success": false, "message": "File not found"}"#).unwrap();
        assert!(!ack.success);
        assert_eq!(ack.message.as_deref(), Some("File not found"));
    }

    #[test]
    fn metadata_update_wire_shape() {
        let update = MetadataUpdate {
            priority: Priority::High,
            status: Status::Queued,
            upload_time: 1_700_000_000_000,
        };
        assert_eq!(
            serde_json::to_value(update).unwrap(),
            json!({"priority": "high", "status": "queued", "uploadTime": 1_700_000_000_000u64})
        );
    }
}
