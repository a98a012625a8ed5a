use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use axum_typed_multipart::{BaseMultipart, FieldData, TryFromMultipart};
use bytes::Bytes;
use common::{
    error::AppError,
    storage::types::{
        processing_session::{ProcessingFlags, ProcessingSession, SessionStatusView},
        source_descriptor::SourceDescriptor,
    },
    utils::ingest_limits::{resolve_media_type, validate_upload},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{api_state::ApiState, error::ApiError};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, TryFromMultipart)]
pub struct SubmitDocumentParams {
    pub store_id: String,
    #[form_data(limit = "unlimited")]
    pub document: FieldData<Bytes>,
    pub auto_process: Option<bool>,
    pub extract_components: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitDocumentResponse {
    pub session_id: String,
    pub status: &'static str,
}

/// Stores the document, records a pending session and hands it to the worker.
///
/// Responds before extraction starts.
pub async fn submit_document(
    State(state): State<ApiState>,
    input: BaseMultipart<SubmitDocumentParams, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let SubmitDocumentParams {
        store_id,
        document,
        auto_process,
        extract_components,
    } = input.data;

    let file_name = document
        .metadata
        .file_name
        .clone()
        .unwrap_or_else(|| "document".to_string());
    let declared = resolve_media_type(
        document.metadata.content_type.as_deref(),
        Some(file_name.as_str()),
    );
    let media_type = validate_upload(
        &state.config,
        &store_id,
        declared.as_deref(),
        document.contents.len(),
    )?;

    let session_id = Uuid::new_v4().to_string();
    let store_id = store_id.trim().to_string();
    let size_bytes = document.contents.len();

    let source = SourceDescriptor::store_upload(
        &session_id,
        &file_name,
        &media_type,
        document.contents,
        &state.storage,
    )
    .await?;

    let flags = ProcessingFlags {
        auto_process: auto_process.unwrap_or(true),
        extract_components: extract_components.unwrap_or(true),
    };
    let session = ProcessingSession::with_id(session_id, store_id, source, flags);
    if let Err(err) = state.db.store_item(session.clone()).await {
        if let Err(cleanup) = state
            .storage
            .delete_prefix(&format!("sessions/{}", session.id))
            .await
        {
            warn!(session_id = %session.id, error = %cleanup, "failed to remove orphaned upload");
        }
        return Err(ApiError::from(AppError::from(err)));
    }

    info!(
        session_id = %session.id,
        store_id = %session.store_id,
        %media_type,
        size_bytes,
        auto_process = flags.auto_process,
        extract_components = flags.extract_components,
        "document accepted for ingestion"
    );

    state.dispatcher.dispatch(&session.id);

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitDocumentResponse {
            session_id: session.id,
            status: session.status.as_str(),
        }),
    ))
}

pub async fn get_session_status(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatusView>, ApiError> {
    let session = ProcessingSession::get(&session_id, &state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))?;

    Ok(Json(session.status_view()))
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsParams {
    pub limit: Option<usize>,
}

pub async fn list_store_sessions(
    State(state): State<ApiState>,
    Path(store_id): Path<String>,
    Query(params): Query<ListSessionsParams>,
) -> Result<Json<Vec<SessionStatusView>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let sessions = ProcessingSession::list_for_store(&store_id, limit, &state.db).await?;

    Ok(Json(
        sessions
            .iter()
            .map(ProcessingSession::status_view)
            .collect(),
    ))
}
