#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod pipeline;
pub mod utils;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::processing_session::ProcessingSession},
};
pub use pipeline::{IngestionConfig, IngestionPipeline, IngestionTuning};
use std::sync::Arc;
use tokio::{
    sync::{mpsc::UnboundedReceiver, Semaphore},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runs the extraction worker until the process exits.
///
/// Session ids arrive over `dispatch_rx`. A periodic sweep additionally claims
/// pending sessions whose dispatch never arrived and fails sessions whose
/// worker stopped making progress. At most `worker_concurrency` sessions run
/// at once; each runs on its own task.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    ingestion_pipeline: Arc<IngestionPipeline>,
    mut dispatch_rx: Option<UnboundedReceiver<String>>,
) -> Result<(), AppError> {
    let worker_id = format!("extraction-worker-{}", Uuid::new_v4());
    let tuning = ingestion_pipeline.pipeline_config().tuning.clone();
    let permits = Arc::new(Semaphore::new(tuning.worker_concurrency));

    let mut sweep = interval(tuning.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        %worker_id,
        concurrency = tuning.worker_concurrency,
        sweep_secs = tuning.sweep_interval.as_secs(),
        "extraction worker started"
    );

    loop {
        let mut channel_closed = false;

        tokio::select! {
            dispatched = next_dispatched(&mut dispatch_rx) => {
                match dispatched {
                    Some(session_id) => {
                        let permits = Arc::clone(&permits);
                        let pipeline = Arc::clone(&ingestion_pipeline);
                        let worker_id = worker_id.clone();
                        // Waits for a permit off the loop so sweeps and reaping keep running.
                        tokio::spawn(async move {
                            let Ok(_permit) = permits.acquire_owned().await else {
                                return;
                            };
                            match pipeline.process_session(&session_id, &worker_id).await {
                                Ok(Some(session)) => debug!(
                                    %worker_id,
                                    session_id = %session.id,
                                    status = session.status.as_str(),
                                    "dispatched session finished"
                                ),
                                Ok(None) => {}
                                Err(err) => error!(
                                    %worker_id,
                                    %session_id,
                                    error = %err,
                                    "dispatched session could not be finalized"
                                ),
                            }
                        });
                    }
                    None => channel_closed = true,
                }
            }
            _ = sweep.tick() => {
                reap_stale_sessions(&db, &tuning).await;
                sweep_pending(&db, &ingestion_pipeline, &permits, &worker_id).await;
            }
        }

        if channel_closed {
            warn!(%worker_id, "dispatch channel closed; relying on the pending sweep");
            dispatch_rx = None;
        }
    }
}

async fn next_dispatched(rx: &mut Option<UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn reap_stale_sessions(db: &SurrealDbClient, tuning: &IngestionTuning) {
    match ProcessingSession::fail_stale(tuning.session_lease, db).await {
        Ok(reaped) if !reaped.is_empty() => {
            for session in &reaped {
                warn!(
                    session_id = %session.id,
                    worker_id = session.worker_id.as_deref().unwrap_or("unknown-worker"),
                    "failed session whose worker lease expired"
                );
            }
        }
        Ok(_) => {}
        Err(err) => error!(error = %err, "failed to reap stale sessions"),
    }
}

/// Claims pending sessions while permits are free.
async fn sweep_pending(
    db: &Arc<SurrealDbClient>,
    ingestion_pipeline: &Arc<IngestionPipeline>,
    permits: &Arc<Semaphore>,
    worker_id: &str,
) {
    loop {
        let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
            return;
        };

        let session = match ProcessingSession::claim_next_pending(worker_id, db).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim pending session");
                return;
            }
        };

        info!(
            %worker_id,
            session_id = %session.id,
            "claimed undispatched session"
        );

        let pipeline = Arc::clone(ingestion_pipeline);
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            let session_id = session.id.clone();
            if let Err(err) = pipeline.run_claimed(session).await {
                error!(
                    %worker_id,
                    %session_id,
                    error = %err,
                    "swept session could not be finalized"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use common::{
        storage::{
            store::StorageManager,
            types::{
                processing_session::{ProcessingFlags, SessionStatus, FAILURE_LEASE_EXPIRED},
                source_descriptor::SourceDescriptor,
            },
        },
        utils::dispatch::SessionDispatcher,
    };

    use super::*;
    use crate::pipeline::{
        CatalogDraft, DocumentKind, ExtractedDocument, ExtractedProduct, PipelineServices,
    };

    struct SingleProductServices;

    #[async_trait]
    impl PipelineServices for SingleProductServices {
        async fn extract_document(
            &self,
            source: &SourceDescriptor,
            _bytes: Bytes,
        ) -> Result<ExtractedDocument, AppError> {
            Ok(ExtractedDocument {
                kind: DocumentKind::Csv,
                file_name: source.file_name.clone(),
                text: "Latte,4.5".into(),
            })
        }

        async fn build_draft(
            &self,
            _document: &ExtractedDocument,
        ) -> Result<CatalogDraft, AppError> {
            Ok(CatalogDraft {
                products: vec![ExtractedProduct {
                    name: "Latte".into(),
                    ..Default::default()
                }],
                components: vec![],
            })
        }
    }

    struct HangingServices;

    #[async_trait]
    impl PipelineServices for HangingServices {
        async fn extract_document(
            &self,
            _source: &SourceDescriptor,
            _bytes: Bytes,
        ) -> Result<ExtractedDocument, AppError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(AppError::Extraction("extraction service never answered".into()))
        }

        async fn build_draft(
            &self,
            _document: &ExtractedDocument,
        ) -> Result<CatalogDraft, AppError> {
            Ok(CatalogDraft::default())
        }
    }

    async fn create_session(db: &SurrealDbClient, storage: &StorageManager) -> ProcessingSession {
        let session_id = Uuid::new_v4().to_string();
        let source = SourceDescriptor::store_upload(
            &session_id,
            "menu.csv",
            "text/csv",
            Bytes::from_static(b"Latte,4.5"),
            storage,
        )
        .await
        .expect("upload");
        let session = ProcessingSession::with_id(
            session_id,
            "store-1".into(),
            source,
            ProcessingFlags::default(),
        );
        db.store_item(session.clone()).await.expect("store session");
        session
    }

    async fn wait_for_terminal(db: &SurrealDbClient, id: &str) -> ProcessingSession {
        for _ in 0..200 {
            let session = ProcessingSession::get(id, db)
                .await
                .expect("fetch")
                .expect("exists");
            if session.status.is_terminal() {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session {id} did not reach a terminal state");
    }

    fn test_pipeline(
        db: &Arc<SurrealDbClient>,
        storage: &StorageManager,
        sweep_interval: Duration,
    ) -> Arc<IngestionPipeline> {
        let config = IngestionConfig {
            tuning: IngestionTuning {
                worker_concurrency: 2,
                sweep_interval,
                ..Default::default()
            },
            ..Default::default()
        };
        Arc::new(IngestionPipeline::with_services(
            Arc::clone(db),
            storage.clone(),
            config,
            Arc::new(SingleProductServices),
        ))
    }

    async fn memory_db() -> Arc<SurrealDbClient> {
        Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        )
    }

    #[tokio::test]
    async fn dispatched_sessions_are_processed() {
        let db = memory_db().await;
        let storage = StorageManager::memory();
        let pipeline = test_pipeline(&db, &storage, Duration::from_secs(3600));
        let (dispatcher, receiver) = SessionDispatcher::channel();

        let worker = tokio::spawn(run_worker_loop(
            Arc::clone(&db),
            pipeline,
            Some(receiver),
        ));

        let session = create_session(&db, &storage).await;
        dispatcher.dispatch(&session.id);

        let finished = wait_for_terminal(&db, &session.id).await;
        worker.abort();

        assert_eq!(finished.status, SessionStatus::Completed);
        assert_eq!(
            finished.result_summary.map(|s| s.products_created),
            Some(1)
        );
    }

    #[tokio::test]
    async fn reaper_keeps_running_while_dispatched_sessions_wait_for_a_permit() {
        let db = memory_db().await;
        let storage = StorageManager::memory();
        let config = IngestionConfig {
            tuning: IngestionTuning {
                worker_concurrency: 1,
                sweep_interval: Duration::from_millis(50),
                session_lease: Duration::from_millis(300),
            },
            ..Default::default()
        };
        let pipeline = Arc::new(IngestionPipeline::with_services(
            Arc::clone(&db),
            storage.clone(),
            config,
            Arc::new(HangingServices),
        ));

        let orphaned = create_session(&db, &storage).await;
        ProcessingSession::claim(&orphaned.id, "dead-worker", &db)
            .await
            .expect("claim")
            .expect("claimed");

        let (dispatcher, receiver) = SessionDispatcher::channel();
        let worker = tokio::spawn(run_worker_loop(
            Arc::clone(&db),
            pipeline,
            Some(receiver),
        ));

        for _ in 0..3 {
            let session = create_session(&db, &storage).await;
            dispatcher.dispatch(&session.id);
        }

        let reaped = wait_for_terminal(&db, &orphaned.id).await;
        worker.abort();

        assert_eq!(reaped.status, SessionStatus::Failed);
        assert_eq!(
            reaped.failure_reason.map(|reason| reason.code),
            Some(FAILURE_LEASE_EXPIRED.to_string())
        );
    }

    #[tokio::test]
    async fn sweep_picks_up_sessions_that_were_never_dispatched() {
        let db = memory_db().await;
        let storage = StorageManager::memory();
        let pipeline = test_pipeline(&db, &storage, Duration::from_millis(50));
        let session = create_session(&db, &storage).await;

        let worker = tokio::spawn(run_worker_loop(Arc::clone(&db), pipeline, None));

        let finished = wait_for_terminal(&db, &session.id).await;
        worker.abort();

        assert_eq!(finished.status, SessionStatus::Completed);
    }
}
