use std::time::Duration;

use chrono::Duration as ChronoDuration;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::source_descriptor::SourceDescriptor;

pub const FAILURE_EXTRACTION: &str = "extraction_failed";
pub const FAILURE_EXTRACTION_TIMEOUT: &str = "extraction_timeout";
pub const FAILURE_UNPARSEABLE: &str = "unparseable_document";
pub const FAILURE_EMPTY_DRAFT: &str = "empty_draft";
pub const FAILURE_SOURCE_UNAVAILABLE: &str = "source_unavailable";
pub const FAILURE_MATERIALIZATION: &str = "materialization_failed";
pub const FAILURE_LEASE_EXPIRED: &str = "worker_lease_expired";

/// One record per claimed session, keyed by the session id.
const CLAIM_TABLE: &str = "session_claim";
/// Pending sessions tried per sweep claim before giving up.
const SWEEP_CANDIDATES: usize = 8;

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    #[default]
    Pending,
    ExtractingText,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::ExtractingText => "EXTRACTING_TEXT",
            SessionStatus::Processing => "PROCESSING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// States in which a worker holds the session.
    pub fn working_states() -> [&'static str; 2] {
        [
            SessionStatus::ExtractingText.as_str(),
            SessionStatus::Processing.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ProcessingFlags {
    #[serde(default = "default_true")]
    pub auto_process: bool,
    #[serde(default = "default_true")]
    pub extract_components: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProcessingFlags {
    fn default() -> Self {
        Self {
            auto_process: true,
            extract_components: true,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub products_created: usize,
    pub product_ids: Vec<String>,
    pub created_category_ids: Vec<String>,
    pub created_component_ids: Vec<String>,
    pub products_extracted: usize,
    /// `false` for preview imports where the draft was kept but nothing was written.
    pub materialized: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FailureReason {
    pub code: String,
    pub message: String,
}

impl FailureReason {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Read-only projection served to polling clients.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusView {
    pub session_id: String,
    pub store_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub products_created: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<ResultSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy)]
enum SessionTransition {
    Claim,
    StartProcessing,
    Complete,
    Fail,
}

impl SessionTransition {
    fn as_str(&self) -> &'static str {
        match self {
            SessionTransition::Claim => "claim",
            SessionTransition::StartProcessing => "start_processing",
            SessionTransition::Complete => "complete",
            SessionTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: SessionLifecycleMachine,
        initial: Pending,
        states: [Pending, ExtractingText, Processing, Completed, Failed],
        events {
            claim {
                transition: { from: Pending, to: ExtractingText }
            }
            start_processing {
                transition: { from: ExtractingText, to: Processing }
            }
            complete {
                transition: { from: Processing, to: Completed }
            }
            fail {
                transition: { from: ExtractingText, to: Failed }
                transition: { from: Processing, to: Failed }
            }
        }
    }

    pub(super) fn pending() -> SessionLifecycleMachine<(), Pending> {
        SessionLifecycleMachine::new(())
    }

    pub(super) fn extracting_text() -> Option<SessionLifecycleMachine<(), ExtractingText>> {
        pending().claim().ok()
    }

    pub(super) fn processing() -> Option<SessionLifecycleMachine<(), Processing>> {
        extracting_text()?.start_processing().ok()
    }
}

/// Errors a losing claimant sees: the claim record already exists, or the
/// storage engine aborted one of two racing writes.
fn is_claim_contention(err: &surrealdb::Error) -> bool {
    let message = err.to_string();
    message.contains("already exists") || message.contains("conflict")
}

fn invalid_transition(status: SessionStatus, event: SessionTransition) -> AppError {
    AppError::InvalidTransition(format!("{} -> {}", status.as_str(), event.as_str()))
}

/// Checks `event` against the lifecycle machine. Terminal states accept nothing.
fn compute_next_state(
    status: SessionStatus,
    event: SessionTransition,
) -> Result<SessionStatus, AppError> {
    use lifecycle::*;

    let next = match (status, event) {
        (SessionStatus::Pending, SessionTransition::Claim) => pending()
            .claim()
            .ok()
            .map(|_| SessionStatus::ExtractingText),
        (SessionStatus::ExtractingText, SessionTransition::StartProcessing) => extracting_text()
            .and_then(|m| m.start_processing().ok())
            .map(|_| SessionStatus::Processing),
        (SessionStatus::ExtractingText, SessionTransition::Fail) => extracting_text()
            .and_then(|m| m.fail().ok())
            .map(|_| SessionStatus::Failed),
        (SessionStatus::Processing, SessionTransition::Complete) => processing()
            .and_then(|m| m.complete().ok())
            .map(|_| SessionStatus::Completed),
        (SessionStatus::Processing, SessionTransition::Fail) => processing()
            .and_then(|m| m.fail().ok())
            .map(|_| SessionStatus::Failed),
        _ => None,
    };

    next.ok_or_else(|| invalid_transition(status, event))
}

stored_object!(ProcessingSession, "processing_session", {
    store_id: String,
    status: SessionStatus,
    source: SourceDescriptor,
    #[serde(default)]
    flags: ProcessingFlags,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(default)]
    result_summary: Option<ResultSummary>,
    #[serde(default)]
    failure_reason: Option<FailureReason>,
    #[serde(default)]
    draft: Option<serde_json::Value>
});

impl ProcessingSession {
    pub fn new(store_id: String, source: SourceDescriptor, flags: ProcessingFlags) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), store_id, source, flags)
    }

    /// The gateway reserves the id first so the upload can be stored under it.
    pub fn with_id(
        id: String,
        store_id: String,
        source: SourceDescriptor,
        flags: ProcessingFlags,
    ) -> Self {
        let now = Utc::now();

        Self {
            id,
            created_at: now,
            updated_at: now,
            store_id,
            status: SessionStatus::Pending,
            source,
            flags,
            worker_id: None,
            result_summary: None,
            failure_reason: None,
            draft: None,
        }
    }

    pub async fn create_and_add_to_db(
        store_id: String,
        source: SourceDescriptor,
        flags: ProcessingFlags,
        db: &SurrealDbClient,
    ) -> Result<ProcessingSession, AppError> {
        let session = Self::new(store_id, source, flags);
        db.store_item(session.clone()).await?;
        Ok(session)
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Option<ProcessingSession>, AppError> {
        Ok(db.get_item::<ProcessingSession>(id).await?)
    }

    pub async fn list_for_store(
        store_id: &str,
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<ProcessingSession>, AppError> {
        let sessions: Vec<ProcessingSession> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE store_id = $store_id
                 ORDER BY created_at DESC
                 LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("store_id", store_id.to_string()))
            .bind(("limit", limit))
            .await?
            .take(0)?;

        Ok(sessions)
    }

    /// Atomically moves a pending session to `EXTRACTING_TEXT` for `worker_id`.
    ///
    /// Returns `None` when the session is missing or another worker already claimed it.
    pub async fn claim(
        id: &str,
        worker_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<ProcessingSession>, AppError> {
        debug_assert!(compute_next_state(SessionStatus::Pending, SessionTransition::Claim).is_ok());

        match Self::get(id, db).await? {
            Some(session) if session.status == SessionStatus::Pending => {}
            _ => return Ok(None),
        }

        if !Self::reserve_claim(id, worker_id, db).await? {
            debug!(session_id = %id, %worker_id, "session claimed by another worker");
            return Ok(None);
        }

        const CLAIM_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $extracting,
                worker_id = $worker_id,
                updated_at = $now
            WHERE status = $pending
            RETURN AFTER;
        "#;

        let claimed = async {
            let mut result = db
                .client
                .query(CLAIM_QUERY)
                .bind(("table", Self::table_name()))
                .bind(("id", id.to_string()))
                .bind(("extracting", SessionStatus::ExtractingText.as_str()))
                .bind(("pending", SessionStatus::Pending.as_str()))
                .bind(("worker_id", worker_id.to_string()))
                .bind(("now", SurrealDatetime::from(Utc::now())))
                .await?;
            let session: Option<ProcessingSession> = result.take(0)?;
            Ok::<_, AppError>(session)
        }
        .await;

        match claimed {
            Ok(Some(session)) => Ok(Some(session)),
            other => {
                // Give the session back so a later sweep can retry it.
                Self::release_claim(id, db).await;
                other
            }
        }
    }

    /// Writes the session's claim record. Its id is the session id, so only
    /// one worker's write can succeed.
    async fn reserve_claim(
        id: &str,
        worker_id: &str,
        db: &SurrealDbClient,
    ) -> Result<bool, AppError> {
        const RESERVE_QUERY: &str = r#"
            CREATE type::thing($claims, $id)
            SET worker_id = $worker_id,
                claimed_at = $now
            RETURN NONE;
        "#;

        let outcome = match db
            .client
            .query(RESERVE_QUERY)
            .bind(("claims", CLAIM_TABLE))
            .bind(("id", id.to_string()))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await
        {
            Ok(response) => response.check().map(|_| ()),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => Ok(true),
            Err(err) if is_claim_contention(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn release_claim(id: &str, db: &SurrealDbClient) {
        if let Err(err) = db
            .client
            .query("DELETE type::thing($claims, $id);")
            .bind(("claims", CLAIM_TABLE))
            .bind(("id", id.to_string()))
            .await
            .and_then(|response| response.check())
        {
            warn!(session_id = %id, error = %err, "failed to release session claim");
        }
    }

    /// Claims the oldest pending session, picking up sessions whose dispatch never arrived.
    pub async fn claim_next_pending(
        worker_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<ProcessingSession>, AppError> {
        let candidates: Vec<ProcessingSession> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE status = $pending
                 ORDER BY created_at ASC
                 LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("pending", SessionStatus::Pending.as_str()))
            .bind(("limit", SWEEP_CANDIDATES))
            .await?
            .take(0)?;

        for candidate in candidates {
            if let Some(claimed) = Self::claim(&candidate.id, worker_id, db).await? {
                return Ok(Some(claimed));
            }
        }

        Ok(None)
    }

    /// Pushes `updated_at` forward so the reaper leaves a live session alone.
    ///
    /// Returns `false` once the session is no longer held by `worker_id`.
    pub async fn renew_lease(
        id: &str,
        worker_id: &str,
        db: &SurrealDbClient,
    ) -> Result<bool, AppError> {
        const RENEW_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET updated_at = $now
            WHERE status IN $working AND worker_id = $worker_id
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(RENEW_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("working", SessionStatus::working_states().to_vec()))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let renewed: Option<ProcessingSession> = result.take(0)?;
        Ok(renewed.is_some())
    }

    /// Records what `worker_id` wrote before the reaper failed its session.
    ///
    /// Only a `FAILED` session still attributed to that worker and carrying no
    /// summary is updated.
    pub async fn record_reaped_summary(
        id: &str,
        worker_id: &str,
        summary: ResultSummary,
        db: &SurrealDbClient,
    ) -> Result<Option<ProcessingSession>, AppError> {
        const REAPED_SUMMARY_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET result_summary = $summary,
                updated_at = $now
            WHERE status = $failed AND worker_id = $worker_id AND !result_summary
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(REAPED_SUMMARY_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("failed", SessionStatus::Failed.as_str()))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("summary", summary))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<ProcessingSession> = result.take(0)?;
        Ok(updated)
    }

    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<ProcessingSession, AppError> {
        let next = compute_next_state(self.status, SessionTransition::StartProcessing)?;
        debug_assert_eq!(next, SessionStatus::Processing);

        const START_PROCESSING_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $processing,
                updated_at = $now
            WHERE status = $extracting AND worker_id = $worker_id
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(START_PROCESSING_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("processing", SessionStatus::Processing.as_str()))
            .bind(("extracting", SessionStatus::ExtractingText.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<ProcessingSession> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(self.status, SessionTransition::StartProcessing))
    }

    pub async fn mark_completed(
        &self,
        summary: ResultSummary,
        draft: Option<serde_json::Value>,
        db: &SurrealDbClient,
    ) -> Result<ProcessingSession, AppError> {
        let next = compute_next_state(self.status, SessionTransition::Complete)?;
        debug_assert_eq!(next, SessionStatus::Completed);

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $completed,
                updated_at = $now,
                result_summary = $summary,
                draft = $draft,
                failure_reason = NONE
            WHERE status = $processing AND worker_id = $worker_id
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(COMPLETE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("completed", SessionStatus::Completed.as_str()))
            .bind(("processing", SessionStatus::Processing.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("summary", summary))
            .bind(("draft", draft))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<ProcessingSession> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(self.status, SessionTransition::Complete))
    }

    /// Records `reason` and moves the session to `FAILED`.
    ///
    /// `partial_summary` carries whatever a partially successful materialization produced.
    pub async fn mark_failed(
        &self,
        reason: FailureReason,
        partial_summary: Option<ResultSummary>,
        db: &SurrealDbClient,
    ) -> Result<ProcessingSession, AppError> {
        let next = compute_next_state(self.status, SessionTransition::Fail)?;
        debug_assert_eq!(next, SessionStatus::Failed);

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $failed,
                updated_at = $now,
                failure_reason = $reason,
                result_summary = $summary
            WHERE status IN $working AND worker_id = $worker_id
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", SessionStatus::Failed.as_str()))
            .bind(("working", SessionStatus::working_states().to_vec()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("reason", reason))
            .bind(("summary", partial_summary))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<ProcessingSession> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(self.status, SessionTransition::Fail))
    }

    /// Fails every working session that has not moved for `lease`.
    ///
    /// A worker that died mid-extraction would otherwise leave its session stuck.
    pub async fn fail_stale(
        lease: Duration,
        db: &SurrealDbClient,
    ) -> Result<Vec<ProcessingSession>, AppError> {
        let now = Utc::now();
        let cutoff = ChronoDuration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "session lease of {} seconds is out of range",
                    lease.as_secs()
                ))
            })?;
        let reason = FailureReason::new(
            FAILURE_LEASE_EXPIRED,
            format!(
                "No progress for {} seconds; the worker is presumed lost",
                lease.as_secs()
            ),
        );

        const REAP_QUERY: &str = r#"
            UPDATE type::table($table)
            SET status = $failed,
                updated_at = $now,
                failure_reason = $reason
            WHERE status IN $working AND updated_at < $cutoff
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(REAP_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("failed", SessionStatus::Failed.as_str()))
            .bind(("working", SessionStatus::working_states().to_vec()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("cutoff", SurrealDatetime::from(cutoff)))
            .bind(("reason", reason))
            .await?;

        let reaped: Vec<ProcessingSession> = result.take(0)?;
        Ok(reaped)
    }

    pub fn status_view(&self) -> SessionStatusView {
        let terminal = self.status.is_terminal();
        let result_summary = if terminal {
            self.result_summary.clone()
        } else {
            None
        };

        SessionStatusView {
            session_id: self.id.clone(),
            store_id: self.store_id.clone(),
            status: self.status,
            products_created: result_summary.as_ref().map(|s| s.products_created),
            result_summary,
            failure_reason: if self.status == SessionStatus::Failed {
                self.failure_reason.clone()
            } else {
                None
            },
            updated_at: self.updated_at,
        }
    }
}
