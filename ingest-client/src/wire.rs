use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    ExtractingText,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultSummary {
    pub products_created: usize,
    pub product_ids: Vec<String>,
    pub created_category_ids: Vec<String>,
    pub created_component_ids: Vec<String>,
    pub products_extracted: usize,
    pub materialized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureReason {
    pub code: String,
    pub message: String,
}

/// Body of `GET /api/v1/sessions/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub store_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub products_created: Option<usize>,
    #[serde(default)]
    pub result_summary: Option<ResultSummary>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Body of a `202 Accepted` upload response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: String,
}
