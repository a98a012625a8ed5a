use common::{
    error::AppError,
    storage::{
        store::StorageManager,
        types::{
            processing_session::{ProcessingFlags, ProcessingSession, ResultSummary},
            source_descriptor::SourceDescriptor,
        },
    },
};
use tracing::error;

use super::{
    config::IngestionConfig,
    draft::CatalogDraft,
    materializer::{CatalogMaterializer, SessionLease},
    services::{ExtractedDocument, PipelineServices},
};

/// An aborted run, carrying whatever was already written to the catalog.
#[derive(Debug)]
pub struct PipelineFailure {
    pub error: AppError,
    pub partial_summary: Option<ResultSummary>,
}

/// What a finished run records on the session.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub summary: ResultSummary,
    pub draft: Option<serde_json::Value>,
}

pub struct PipelineContext<'a> {
    pub session_id: String,
    pub store_id: String,
    pub worker_id: String,
    pub flags: ProcessingFlags,
    pub source: SourceDescriptor,
    pub storage: &'a StorageManager,
    pub pipeline_config: &'a IngestionConfig,
    pub services: &'a dyn PipelineServices,
    pub materializer: &'a CatalogMaterializer,
    pub lease: &'a dyn SessionLease,
    pub document: Option<ExtractedDocument>,
    pub draft: Option<CatalogDraft>,
    pub summary: Option<ResultSummary>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        session: &ProcessingSession,
        storage: &'a StorageManager,
        pipeline_config: &'a IngestionConfig,
        services: &'a dyn PipelineServices,
        materializer: &'a CatalogMaterializer,
        lease: &'a dyn SessionLease,
    ) -> Self {
        Self {
            session_id: session.id.clone(),
            store_id: session.store_id.clone(),
            worker_id: session.worker_id.clone().unwrap_or_default(),
            flags: session.flags,
            source: session.source.clone(),
            storage,
            pipeline_config,
            services,
            materializer,
            lease,
            document: None,
            draft: None,
            summary: None,
        }
    }

    pub fn document(&self) -> Result<&ExtractedDocument, AppError> {
        self.document
            .as_ref()
            .ok_or_else(|| AppError::InternalError("extracted document expected to be available".into()))
    }

    pub fn draft(&self) -> Result<&CatalogDraft, AppError> {
        self.draft
            .as_ref()
            .ok_or_else(|| AppError::InternalError("catalog draft expected to be available".into()))
    }

    /// Consumes the run's results once every stage has finished.
    pub fn into_outcome(self) -> Result<PipelineOutcome, AppError> {
        let summary = self.summary.ok_or_else(|| {
            AppError::InternalError("result summary expected after materialization".into())
        })?;

        let draft = if summary.materialized {
            None
        } else {
            self.draft
                .map(|draft| serde_json::to_value(draft))
                .transpose()
                .map_err(|err| AppError::InternalError(format!("failed to encode draft: {err}")))?
        };

        Ok(PipelineOutcome { summary, draft })
    }

    pub fn abort(&mut self, err: AppError) -> PipelineFailure {
        error!(
            session_id = %self.session_id,
            worker_id = %self.worker_id,
            error = %err,
            "extraction pipeline aborted"
        );
        PipelineFailure {
            error: err,
            partial_summary: self.summary.take(),
        }
    }
}
