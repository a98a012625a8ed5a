use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ResponseFormat,
    ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::types::source_descriptor::SourceDescriptor,
    utils::{config::AppConfig, ingest_limits::MIME_XLSX},
};

use super::draft::CatalogDraft;
use crate::utils::{
    document_text::{decode_csv, extract_pdf_text, flatten_xlsx},
    image_parsing::transcribe_image,
    llm_instructions::{get_catalog_draft_schema, CATALOG_DRAFT_SYSTEM_MESSAGE},
};

/// Longest document text forwarded to the drafting model.
const DRAFT_INPUT_CHAR_LIMIT: usize = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Image,
    Spreadsheet,
    Csv,
}

impl DocumentKind {
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            "application/pdf" => Some(Self::Pdf),
            "image/jpeg" | "image/png" => Some(Self::Image),
            MIME_XLSX => Some(Self::Spreadsheet),
            "text/csv" => Some(Self::Csv),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Spreadsheet => "spreadsheet",
            Self::Csv => "csv",
        }
    }
}

/// Raw text recovered from a source document.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDocument {
    pub kind: DocumentKind,
    pub file_name: String,
    pub text: String,
}

/// External collaborators of the extraction worker.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn extract_document(
        &self,
        source: &SourceDescriptor,
        bytes: Bytes,
    ) -> Result<ExtractedDocument, AppError>;

    async fn build_draft(&self, document: &ExtractedDocument) -> Result<CatalogDraft, AppError>;
}

pub struct DefaultPipelineServices {
    openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    config: AppConfig,
}

impl DefaultPipelineServices {
    pub fn new(
        openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        config: AppConfig,
    ) -> Self {
        Self {
            openai_client,
            config,
        }
    }

    fn prepare_llm_request(
        &self,
        document: &ExtractedDocument,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let text = truncate_chars(&document.text, DRAFT_INPUT_CHAR_LIMIT);
        let user_message = format!(
            "Source kind: {}\nFile name: {}\nDocument content:\n{}",
            document.kind.as_str(),
            document.file_name,
            text
        );

        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some("Catalog items found in the submitted document".into()),
                name: "catalog_draft".into(),
                schema: Some(get_catalog_draft_schema()),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.config.processing_model)
            .messages([
                ChatCompletionRequestSystemMessage::from(CATALOG_DRAFT_SYSTEM_MESSAGE).into(),
                ChatCompletionRequestUserMessage::from(user_message).into(),
            ])
            .response_format(response_format)
            .build()?;

        Ok(request)
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn extract_document(
        &self,
        source: &SourceDescriptor,
        bytes: Bytes,
    ) -> Result<ExtractedDocument, AppError> {
        let kind = DocumentKind::from_media_type(&source.media_type).ok_or_else(|| {
            AppError::UnparseableDocument(format!(
                "no extractor for media type {}",
                source.media_type
            ))
        })?;

        let text = match kind {
            DocumentKind::Pdf => extract_pdf_text(bytes).await?,
            DocumentKind::Csv => decode_csv(&bytes)?,
            DocumentKind::Spreadsheet => flatten_xlsx(bytes).await?,
            DocumentKind::Image => {
                transcribe_image(
                    &bytes,
                    &source.media_type,
                    &self.config.vision_model,
                    &self.openai_client,
                )
                .await?
            }
        };

        Ok(ExtractedDocument {
            kind,
            file_name: source.file_name.clone(),
            text,
        })
    }

    async fn build_draft(&self, document: &ExtractedDocument) -> Result<CatalogDraft, AppError> {
        let request = self.prepare_llm_request(document)?;
        let response = self
            .openai_client
            .chat()
            .create(request)
            .await
            .map_err(|err| AppError::Extraction(format!("catalog draft request failed: {err}")))?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or(AppError::LLMParsing(
                "No content found in LLM response".into(),
            ))?;

        serde_json::from_str::<CatalogDraft>(content).map_err(|e| {
            AppError::LLMParsing(format!("Failed to parse LLM response into a catalog draft: {e}"))
        })
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use common::storage::types::processing_session::FAILURE_EXTRACTION;

    use super::*;

    #[test]
    fn media_types_map_to_extractors() {
        assert_eq!(
            DocumentKind::from_media_type("application/pdf"),
            Some(DocumentKind::Pdf)
        );
        assert_eq!(
            DocumentKind::from_media_type("image/jpeg"),
            Some(DocumentKind::Image)
        );
        assert_eq!(
            DocumentKind::from_media_type(MIME_XLSX),
            Some(DocumentKind::Spreadsheet)
        );
        assert_eq!(DocumentKind::from_media_type("text/html"), None);
    }

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("café au lait", 4), "café");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn request_uses_processing_model_and_strict_schema() {
        let config = AppConfig {
            processing_model: "draft-model".into(),
            ..Default::default()
        };
        let services = DefaultPipelineServices::new(
            Arc::new(async_openai::Client::with_config(
                async_openai::config::OpenAIConfig::new().with_api_key("test"),
            )),
            config,
        );
        let document = ExtractedDocument {
            kind: DocumentKind::Csv,
            file_name: "menu.csv".into(),
            text: "name,price\nLatte,4.5".into(),
        };

        let request = services.prepare_llm_request(&document).expect("request");

        assert_eq!(request.model, "draft-model");
        assert!(matches!(
            request.response_format,
            Some(ResponseFormat::JsonSchema { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_model_service_is_an_extraction_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let services = DefaultPipelineServices::new(
            Arc::new(async_openai::Client::with_config(
                async_openai::config::OpenAIConfig::new()
                    .with_api_key("test")
                    .with_api_base(format!("http://127.0.0.1:{port}/v1")),
            )),
            AppConfig::default(),
        );
        let document = ExtractedDocument {
            kind: DocumentKind::Csv,
            file_name: "menu.csv".into(),
            text: "name,price\nLatte,4.5".into(),
        };

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            services.build_draft(&document),
        )
        .await
        .expect("request settles")
        .expect_err("no model service listening");

        assert!(matches!(err, AppError::Extraction(_)), "{err:?}");
        assert_eq!(crate::pipeline::failure_code(&err), FAILURE_EXTRACTION);
    }
}
