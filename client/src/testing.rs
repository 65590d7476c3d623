//! In-memory backend for unit tests.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use common::{
    payloads::{MetadataMap, MetadataUpdate, PredictResponse, UploadResponse},
    SavedMeta,
};
use serde_json::json;

use crate::api::{ApiError, SlideService};

#[derive(Default)]
struct State {
    listing: Vec<String>,
    metadata: MetadataMap,
    metadata_down: bool,
    saved: Vec<(String, MetadataUpdate)>,
    failing: HashSet<String>,
    predictions: HashMap<String, PredictResponse>,
    predict_delay: Duration,
    save_delay: Duration,
    predicted: Vec<String>,
    deleted: Vec<String>,
    uploaded: usize,
}

#[derive(Default)]
pub(crate) struct FakeService {
    state: Mutex<State>,
}

impl FakeService {
    /// Calls naming this file id (or upload file name) fail with a 500.
    pub fn fail(&self, id: &str) {
        self.state.lock().unwrap().failing.insert(id.to_string());
    }

    pub fn fail_metadata(&self) {
        self.state.lock().unwrap().metadata_down = true;
    }

    pub fn set_listing(&self, names: &[&str]) {
        self.state.lock().unwrap().listing = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn put_metadata(&self, id: &str, meta: SavedMeta) {
        self.state.lock().unwrap().metadata.insert(id.to_string(), meta);
    }

    pub fn set_prediction(&self, id: &str, response: PredictResponse) {
        self.state
            .lock()
            .unwrap()
            .predictions
            .insert(id.to_string(), response);
    }

    pub fn set_predict_delay(&self, delay: Duration) {
        self.state.lock().unwrap().predict_delay = delay;
    }

    pub fn set_save_delay(&self, delay: Duration) {
        self.state.lock().unwrap().save_delay = delay;
    }

    pub fn saved(&self) -> Vec<(String, MetadataUpdate)> {
        self.state.lock().unwrap().saved.clone()
    }

    pub fn predicted(&self) -> Vec<String> {
        self.state.lock().unwrap().predicted.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    fn check(&self, id: &str) -> Result<(), ApiError> {
        if self.state.lock().unwrap().failing.contains(id) {
            Err(ApiError::BadStatusCode(500))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SlideService for FakeService {
    async fn upload(&self, path: &Path) -> Result<UploadResponse, ApiError> {
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        self.check(&name)?;
        let mut state = self.state.lock().unwrap();
        state.uploaded += 1;
        let file_id = format!("id{}", state.uploaded);
        let ext = path.extension().unwrap().to_str().unwrap();
        let saved_as = format!("{file_id}.{ext}");
        state.listing.push(saved_as.clone());
        Ok(UploadResponse {
            file_id,
            filename: name,
            saved_as,
        })
    }

    async fn list_slides(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.state.lock().unwrap().listing.clone())
    }

    async fn load_metadata(&self) -> Result<MetadataMap, ApiError> {
        let state = self.state.lock().unwrap();
        if state.metadata_down {
            return Err(ApiError::BadStatusCode(503));
        }
        Ok(state.metadata.clone())
    }

    async fn save_metadata(&self, file_id: &str, update: &MetadataUpdate) -> Result<(), ApiError> {
        let delay = self.state.lock().unwrap().save_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check(file_id)?;
        let mut state = self.state.lock().unwrap();
        state.saved.push((file_id.to_string(), update.clone()));
        state.metadata.insert(
            file_id.to_string(),
            SavedMeta {
                priority: Some(update.priority.as_str().to_string()),
                status: Some(update.status.as_str().to_string()),
                upload_time: Some(update.upload_time),
            },
        );
        Ok(())
    }

    async fn predict(&self, file_id: &str) -> Result<PredictResponse, ApiError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.predicted.push(file_id.to_string());
            state.predict_delay
        };
        tokio::time::sleep(delay).await;
        self.check(file_id)?;
        let canned = self.state.lock().unwrap().predictions.get(file_id).cloned();
        Ok(canned.unwrap_or_else(|| PredictResponse {
            success: true,
            heatmap: Some(format!("/heatmaps/{file_id}.png")),
            model_info: Some(json!({"name": "fake", "accuracy": 0.9})),
            qc_metrics: Some(json!({"quality": 0.8})),
            error: None,
        }))
    }

    async fn delete(&self, file_id: &str) -> Result<(), ApiError> {
        self.state.lock().unwrap().deleted.push(file_id.to_string());
        self.check(file_id)
    }
}
