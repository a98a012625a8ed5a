use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use tracing::debug;

use crate::{
    error::PollError,
    wire::{ErrorBody, StatusSnapshot, SubmitResponse},
};

/// Where the polling client reads session status from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, session_id: &str) -> Result<StatusSnapshot, PollError>;
}

/// A document to hand to the upload gateway.
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub store_id: String,
    pub file_name: String,
    pub media_type: String,
    pub contents: Bytes,
    pub auto_process: Option<bool>,
    pub extract_components: Option<bool>,
}

impl DocumentUpload {
    pub fn new(
        store_id: impl Into<String>,
        file_name: impl Into<String>,
        media_type: impl Into<String>,
        contents: impl Into<Bytes>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            file_name: file_name.into(),
            media_type: media_type.into(),
            contents: contents.into(),
            auto_process: None,
            extract_components: None,
        }
    }
}

/// Talks to the session API over HTTP, e.g. `http://localhost:3000/api/v1`.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    client: Client,
    base_url: String,
}

impl HttpStatusSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Posts the document to the upload gateway and returns the accepted session.
    pub async fn submit_document(
        &self,
        upload: DocumentUpload,
    ) -> Result<SubmitResponse, PollError> {
        let part = Part::bytes(upload.contents.to_vec())
            .file_name(upload.file_name)
            .mime_str(&upload.media_type)
            .map_err(|err| PollError::Transport(err.to_string()))?;

        let mut form = Form::new()
            .text("store_id", upload.store_id)
            .part("document", part);
        if let Some(auto_process) = upload.auto_process {
            form = form.text("auto_process", auto_process.to_string());
        }
        if let Some(extract_components) = upload.extract_components {
            form = form.text("extract_components", extract_components.to_string());
        }

        let response = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .multipart(form)
            .send()
            .await?;

        let accepted: SubmitResponse = ensure_success(response).await?.json().await?;
        debug!(session_id = %accepted.session_id, "document submitted");

        Ok(accepted)
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch_status(&self, session_id: &str) -> Result<StatusSnapshot, PollError> {
        let response = self
            .client
            .get(format!("{}/sessions/{session_id}", self.base_url))
            .send()
            .await?;

        Ok(ensure_success(response).await?.json().await?)
    }
}

async fn ensure_success(response: Response) -> Result<Response, PollError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body).map_or(body, |parsed| parsed.error);

    Err(PollError::Rejected {
        status: status.as_u16(),
        message,
    })
}
