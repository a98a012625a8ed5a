mod config;
mod context;
pub mod draft;
pub mod materializer;
mod services;
mod stages;
mod state;

pub use config::{IngestionConfig, IngestionTuning};
pub use context::{PipelineFailure, PipelineOutcome};
pub use draft::{
    CatalogDraft, ExtractedComponent, ExtractedOption, ExtractedProduct, ExtractedStep,
    ExtractedVariation,
};
pub use materializer::{
    CatalogMaterializer, CatalogWriter, MaterializationFailure, MaterializationSummary,
    SessionLease, SurrealCatalogWriter, WorkerLease,
};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, DocumentKind, ExtractedDocument, PipelineServices};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_openai::Client;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::processing_session::{
            FailureReason, ProcessingSession, ResultSummary, FAILURE_EMPTY_DRAFT,
            FAILURE_EXTRACTION, FAILURE_EXTRACTION_TIMEOUT, FAILURE_LEASE_EXPIRED,
            FAILURE_MATERIALIZATION, FAILURE_SOURCE_UNAVAILABLE, FAILURE_UNPARSEABLE,
        },
    },
    utils::config::AppConfig,
};
use tracing::{debug, info, warn};

use self::{
    context::PipelineContext,
    stages::{build_draft, extract_text, materialize},
    state::ready,
};

#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    pipeline_config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
    materializer: CatalogMaterializer,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        openai_client: Arc<Client<async_openai::config::OpenAIConfig>>,
        config: AppConfig,
        storage: StorageManager,
    ) -> Self {
        let pipeline_config = IngestionConfig::from_app_config(&config);
        let services = DefaultPipelineServices::new(openai_client, config);

        Self::with_services(db, storage, pipeline_config, Arc::new(services))
    }

    pub fn with_services(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        pipeline_config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        let materializer =
            CatalogMaterializer::new(Arc::new(SurrealCatalogWriter::new(Arc::clone(&db))));

        Self {
            db,
            storage,
            pipeline_config,
            services,
            materializer,
        }
    }

    /// Replaces the catalog writer used by the materializer.
    #[must_use]
    pub fn with_catalog_writer(mut self, writer: Arc<dyn CatalogWriter>) -> Self {
        self.materializer = CatalogMaterializer::new(writer);
        self
    }

    pub fn pipeline_config(&self) -> &IngestionConfig {
        &self.pipeline_config
    }

    /// Claims `session_id` for `worker_id` and runs it to a terminal state.
    ///
    /// Returns `None` when another worker already holds the session.
    pub async fn process_session(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Result<Option<ProcessingSession>, AppError> {
        let Some(session) = ProcessingSession::claim(session_id, worker_id, &self.db).await? else {
            debug!(%session_id, %worker_id, "session not claimable; skipping");
            return Ok(None);
        };

        self.run_claimed(session).await.map(Some)
    }

    /// Drives an already claimed session through extraction, drafting and materialization.
    ///
    /// Pipeline failures are recorded on the session and reported as `Ok`
    /// with the failed session; `Err` means the session store itself refused a transition.
    #[tracing::instrument(
        skip_all,
        fields(
            session_id = %session.id,
            store_id = %session.store_id,
            worker_id = session.worker_id.as_deref().unwrap_or("unknown-worker")
        )
    )]
    pub async fn run_claimed(
        &self,
        session: ProcessingSession,
    ) -> Result<ProcessingSession, AppError> {
        let lease = WorkerLease::new(
            Arc::clone(&self.db),
            session.id.clone(),
            session.worker_id.clone().unwrap_or_default(),
        );
        let mut ctx = PipelineContext::new(
            &session,
            &self.storage,
            &self.pipeline_config,
            self.services.as_ref(),
            &self.materializer,
            &lease,
        );

        let machine = ready();
        let pipeline_started = Instant::now();

        let stage_start = Instant::now();
        let machine = match extract_text(machine, &mut ctx).await {
            Ok(machine) => machine,
            Err(err) => return self.record_failure(&session, ctx.abort(err)).await,
        };
        let extract_duration = stage_start.elapsed();

        let session = match session.mark_processing(&self.db).await {
            Ok(session) => session,
            Err(AppError::InvalidTransition(_)) => {
                return self.keep_reaped_outcome(&session, None).await
            }
            Err(err) => return Err(err),
        };

        let stage_start = Instant::now();
        let machine = match build_draft(machine, &mut ctx).await {
            Ok(machine) => machine,
            Err(err) => return self.record_failure(&session, ctx.abort(err)).await,
        };
        let draft_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let _machine = match materialize(machine, &mut ctx).await {
            Ok(machine) => machine,
            Err(err) => return self.record_failure(&session, ctx.abort(err)).await,
        };
        let materialize_duration = stage_start.elapsed();

        let outcome = ctx.into_outcome()?;
        let products_created = outcome.summary.products_created;
        let summary = outcome.summary.clone();
        let completed = match session
            .mark_completed(outcome.summary, outcome.draft, &self.db)
            .await
        {
            Ok(completed) => completed,
            Err(AppError::InvalidTransition(_)) => {
                return self.keep_reaped_outcome(&session, Some(summary)).await
            }
            Err(err) => return Err(err),
        };

        info!(
            session_id = %completed.id,
            products_created,
            total_ms = Self::duration_millis(pipeline_started.elapsed()),
            extract_ms = Self::duration_millis(extract_duration),
            draft_ms = Self::duration_millis(draft_duration),
            materialize_ms = Self::duration_millis(materialize_duration),
            "ingestion session completed"
        );

        Ok(completed)
    }

    async fn record_failure(
        &self,
        session: &ProcessingSession,
        failure: PipelineFailure,
    ) -> Result<ProcessingSession, AppError> {
        let reason = FailureReason::new(failure_code(&failure.error), failure.error.to_string());
        let partial_summary = failure.partial_summary;
        let failed = match session
            .mark_failed(reason, partial_summary.clone(), &self.db)
            .await
        {
            Ok(failed) => failed,
            Err(AppError::InvalidTransition(_)) => {
                return self.keep_reaped_outcome(session, partial_summary).await
            }
            Err(err) => return Err(err),
        };

        warn!(
            session_id = %failed.id,
            code = failed.failure_reason.as_ref().map_or("", |r| r.code.as_str()),
            products_created = failed
                .result_summary
                .as_ref()
                .map_or(0, |summary| summary.products_created),
            "ingestion session failed"
        );

        Ok(failed)
    }

    /// The reaper failed the session while this worker still ran it. Whatever
    /// was written goes onto the failed session so the catalog and the
    /// session summary agree.
    async fn keep_reaped_outcome(
        &self,
        session: &ProcessingSession,
        summary: Option<ResultSummary>,
    ) -> Result<ProcessingSession, AppError> {
        let worker_id = session.worker_id.as_deref().unwrap_or_default();

        if let Some(summary) = summary {
            if let Some(updated) =
                ProcessingSession::record_reaped_summary(&session.id, worker_id, summary, &self.db)
                    .await?
            {
                warn!(
                    session_id = %updated.id,
                    %worker_id,
                    products_created = updated
                        .result_summary
                        .as_ref()
                        .map_or(0, |summary| summary.products_created),
                    "session was reaped mid-run; kept the summary of what was written"
                );
                return Ok(updated);
            }
        }

        ProcessingSession::get(&session.id, &self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {}", session.id)))
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Machine-readable failure code recorded on the session.
pub fn failure_code(err: &AppError) -> &'static str {
    match err {
        AppError::ExtractionTimeout(_) => FAILURE_EXTRACTION_TIMEOUT,
        AppError::UnparseableDocument(_) => FAILURE_UNPARSEABLE,
        AppError::Storage(_) => FAILURE_SOURCE_UNAVAILABLE,
        AppError::Validation(_) => FAILURE_EMPTY_DRAFT,
        AppError::Materialization(_) => FAILURE_MATERIALIZATION,
        AppError::LeaseLost(_) => FAILURE_LEASE_EXPIRED,
        _ => FAILURE_EXTRACTION,
    }
}

#[cfg(test)]
mod tests;
