use std::{future::Future, time::Duration};

use common::{error::AppError, storage::types::processing_session::ResultSummary};
use state_machines::core::GuardError;
use tracing::{debug, info, instrument};

use super::{
    context::PipelineContext,
    state::{Drafted, ExtractionMachine, Materialized, Ready, TextExtracted},
};

#[instrument(
    level = "trace",
    skip_all,
    fields(session_id = %ctx.session_id, store_id = %ctx.store_id)
)]
pub async fn extract_text(
    machine: ExtractionMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<ExtractionMachine<(), TextExtracted>, AppError> {
    let bytes = ctx.source.load(ctx.storage).await?;
    let document = with_extraction_timeout(
        ctx.pipeline_config.extraction_timeout,
        ctx.services.extract_document(&ctx.source, bytes),
    )
    .await?;

    if document.text.trim().is_empty() {
        return Err(AppError::UnparseableDocument(
            "no text could be extracted from the document".into(),
        ));
    }

    let text_chars = document.text.chars().count();
    let preview: String = document.text.chars().take(120).collect();
    info!(
        session_id = %ctx.session_id,
        kind = document.kind.as_str(),
        media_type = %ctx.source.media_type,
        text_chars,
        "document text extracted"
    );
    debug!(
        session_id = %ctx.session_id,
        preview = %preview.replace('\n', " "),
        "document text preview"
    );

    ctx.document = Some(document);

    machine
        .extract()
        .map_err(|(_, guard)| map_guard_error("extract", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(session_id = %ctx.session_id, store_id = %ctx.store_id)
)]
pub async fn build_draft(
    machine: ExtractionMachine<(), TextExtracted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<ExtractionMachine<(), Drafted>, AppError> {
    let document = ctx.document()?;
    let draft = with_extraction_timeout(
        ctx.pipeline_config.extraction_timeout,
        ctx.services.build_draft(document),
    )
    .await?
    .normalized();

    draft.validate()?;

    debug!(
        session_id = %ctx.session_id,
        products = draft.products.len(),
        components = draft.components.len(),
        "catalog draft built"
    );

    ctx.draft = Some(draft);

    machine
        .draft()
        .map_err(|(_, guard)| map_guard_error("draft", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(session_id = %ctx.session_id, store_id = %ctx.store_id)
)]
pub async fn materialize(
    machine: ExtractionMachine<(), Drafted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<ExtractionMachine<(), Materialized>, AppError> {
    if !ctx.flags.auto_process {
        let products_extracted = ctx.draft()?.products.len();
        info!(
            session_id = %ctx.session_id,
            products_extracted,
            "preview import; draft kept without materializing"
        );
        ctx.summary = Some(ResultSummary {
            products_extracted,
            materialized: false,
            ..Default::default()
        });
        return machine
            .materialize()
            .map_err(|(_, guard)| map_guard_error("materialize", &guard));
    }

    let result = ctx
        .materializer
        .materialize(
            &ctx.store_id,
            &ctx.session_id,
            ctx.draft()?,
            ctx.flags.extract_components,
            ctx.lease,
        )
        .await;

    match result {
        Ok(summary) => {
            ctx.summary = Some(summary.to_result_summary());
        }
        Err(failure) => {
            ctx.summary = Some(failure.summary.to_result_summary());
            return Err(match failure.error {
                err @ (AppError::Materialization(_) | AppError::LeaseLost(_)) => err,
                other => AppError::Materialization(other.to_string()),
            });
        }
    }

    machine
        .materialize()
        .map_err(|(_, guard)| map_guard_error("materialize", &guard))
}

async fn with_extraction_timeout<T, F>(timeout: Duration, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| AppError::ExtractionTimeout(timeout.as_secs()))?
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid extraction pipeline transition during {event}: {guard:?}"
    ))
}
