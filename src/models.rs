use crate::adapters::{Candidate, ListingDescription};
use crate::session::{DescriptionStatus, EnhancementStatus, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub session_id: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize)]
pub struct EnhancementView {
    pub strategy: String,
    pub image: String,
    #[serde(flatten)]
    pub status: EnhancementStatus,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub session_id: String,
    pub enhancement_1: EnhancementView,
    pub enhancement_2: EnhancementView,
    pub enhancement_3: EnhancementView,
    pub no_background_image: String,
    pub original_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<Candidate>,
    pub used_full_frame: bool,
    pub cached: bool,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectRequest {
    #[serde(alias = "option_number")]
    pub option_number: i64,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectResponse {
    pub chosen_image: String,
    pub chosen_status: EnhancementStatus,
    pub option_number: u8,
    pub description: ListingDescription,
    pub description_status: DescriptionStatus,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub active_session_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
    pub used_full_frame: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_index: Option<u8>,
    pub enhancements: Vec<SlotSummary>,
}

#[derive(Debug, Serialize)]
pub struct SlotSummary {
    pub strategy: String,
    #[serde(flatten)]
    pub status: EnhancementStatus,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
}
