use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            category::Category,
            component::Component,
            processing_session::{
                ProcessingFlags, ProcessingSession, SessionStatus, FAILURE_EMPTY_DRAFT,
                FAILURE_EXTRACTION, FAILURE_EXTRACTION_TIMEOUT, FAILURE_LEASE_EXPIRED,
                FAILURE_MATERIALIZATION, FAILURE_SOURCE_UNAVAILABLE,
            },
            product::Product,
            source_descriptor::SourceDescriptor,
        },
    },
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    config::IngestionConfig,
    draft::{CatalogDraft, ExtractedOption, ExtractedProduct, ExtractedStep},
    materializer::{CatalogWriter, SurrealCatalogWriter},
    services::{DocumentKind, ExtractedDocument, PipelineServices},
    IngestionPipeline,
};

enum Behaviour {
    Succeed,
    FailExtraction,
    HangExtraction,
}

struct MockServices {
    db: Arc<SurrealDbClient>,
    behaviour: Behaviour,
    draft: CatalogDraft,
    calls: Mutex<Vec<&'static str>>,
    observed: Mutex<Vec<SessionStatus>>,
    last_location: Mutex<Option<String>>,
}

impl MockServices {
    fn new(db: &Arc<SurrealDbClient>, behaviour: Behaviour, draft: CatalogDraft) -> Self {
        Self {
            db: Arc::clone(db),
            behaviour,
            draft,
            calls: Mutex::new(Vec::new()),
            observed: Mutex::new(Vec::new()),
            last_location: Mutex::new(None),
        }
    }

    /// Records the stored status of the session a source belongs to.
    async fn observe(&self, stage: &'static str, location: &str) {
        self.calls.lock().await.push(stage);
        let session_id = location.split('/').nth(1).unwrap_or_default();
        if let Ok(Some(session)) = ProcessingSession::get(session_id, &self.db).await {
            self.observed.lock().await.push(session.status);
        }
    }
}

#[async_trait]
impl PipelineServices for MockServices {
    async fn extract_document(
        &self,
        source: &SourceDescriptor,
        bytes: Bytes,
    ) -> Result<ExtractedDocument, AppError> {
        *self.last_location.lock().await = Some(source.location.clone());
        self.observe("extract", &source.location).await;
        match self.behaviour {
            Behaviour::Succeed => Ok(ExtractedDocument {
                kind: DocumentKind::Csv,
                file_name: source.file_name.clone(),
                text: String::from_utf8_lossy(&bytes).into_owned(),
            }),
            Behaviour::FailExtraction => Err(AppError::Extraction(
                "extraction service returned 503".into(),
            )),
            Behaviour::HangExtraction => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(AppError::Extraction("unreachable".into()))
            }
        }
    }

    async fn build_draft(&self, _document: &ExtractedDocument) -> Result<CatalogDraft, AppError> {
        let location = self.last_location.lock().await.clone().unwrap_or_default();
        self.observe("draft", &location).await;
        Ok(self.draft.clone())
    }
}

/// Fails every product insert after the first `succeed_products`.
struct FlakyWriter {
    inner: SurrealCatalogWriter,
    succeed_products: usize,
    seen: AtomicUsize,
}

#[async_trait]
impl CatalogWriter for FlakyWriter {
    async fn load_categories(&self, store_id: &str) -> Result<Vec<Category>, AppError> {
        self.inner.load_categories(store_id).await
    }

    async fn load_components(&self, store_id: &str) -> Result<Vec<Component>, AppError> {
        self.inner.load_components(store_id).await
    }

    async fn create_category(&self, category: Category) -> Result<Category, AppError> {
        self.inner.create_category(category).await
    }

    async fn create_component(&self, component: Component) -> Result<Component, AppError> {
        self.inner.create_component(component).await
    }

    async fn create_product(&self, product: Product) -> Result<Product, AppError> {
        if self.seen.fetch_add(1, Ordering::SeqCst) >= self.succeed_products {
            return Err(AppError::InternalError("catalog write rejected".into()));
        }
        self.inner.create_product(product).await
    }
}

/// Runs the stale-session reaper from inside product writes.
///
/// Every insert waits `delay` and then reaps sessions idle for longer than
/// `lease`. Inserts from `reap_from` onward instead wait past the lease first,
/// so the session under write goes stale.
struct ReapingWriter {
    inner: SurrealCatalogWriter,
    db: Arc<SurrealDbClient>,
    delay: Duration,
    lease: Duration,
    reap_from: usize,
    seen: AtomicUsize,
}

#[async_trait]
impl CatalogWriter for ReapingWriter {
    async fn load_categories(&self, store_id: &str) -> Result<Vec<Category>, AppError> {
        self.inner.load_categories(store_id).await
    }

    async fn load_components(&self, store_id: &str) -> Result<Vec<Component>, AppError> {
        self.inner.load_components(store_id).await
    }

    async fn create_category(&self, category: Category) -> Result<Category, AppError> {
        self.inner.create_category(category).await
    }

    async fn create_component(&self, component: Component) -> Result<Component, AppError> {
        self.inner.create_component(component).await
    }

    async fn create_product(&self, product: Product) -> Result<Product, AppError> {
        let delay = if self.seen.fetch_add(1, Ordering::SeqCst) >= self.reap_from {
            self.lease * 4
        } else {
            self.delay
        };
        tokio::time::sleep(delay).await;
        ProcessingSession::fail_stale(self.lease, &self.db).await?;
        self.inner.create_product(product).await
    }
}

fn menu_draft(products: usize) -> CatalogDraft {
    CatalogDraft {
        products: (0..products)
            .map(|i| ExtractedProduct {
                name: format!("Bowl {i}"),
                category: Some("Bowls".into()),
                steps: vec![ExtractedStep {
                    name: "Base".into(),
                    min_selections: 1,
                    max_selections: Some(1),
                    options: vec![ExtractedOption {
                        name: "Rice".into(),
                        component: Some("Rice".into()),
                        price_delta: None,
                    }],
                }],
                ..Default::default()
            })
            .collect(),
        components: vec![],
    }
}

async fn setup_db() -> Arc<SurrealDbClient> {
    let namespace = "test_ns";
    let database = Uuid::new_v4().to_string();
    let db = SurrealDbClient::memory(namespace, &database)
        .await
        .expect("Failed to create in-memory surrealdb");
    Arc::new(db)
}

async fn pending_session(
    db: &SurrealDbClient,
    storage: &StorageManager,
    flags: ProcessingFlags,
) -> ProcessingSession {
    let session_id = Uuid::new_v4().to_string();
    let source = SourceDescriptor::store_upload(
        &session_id,
        "menu.csv",
        "text/csv",
        Bytes::from_static(b"name,price\nBowl,12\n"),
        storage,
    )
    .await
    .expect("store upload");
    let session = ProcessingSession::with_id(session_id, "store-1".into(), source, flags);
    db.store_item(session.clone()).await.expect("store session");
    session
}

fn pipeline_with(
    db: &Arc<SurrealDbClient>,
    storage: &StorageManager,
    services: Arc<MockServices>,
    pipeline_config: IngestionConfig,
) -> IngestionPipeline {
    IngestionPipeline::with_services(Arc::clone(db), storage.clone(), pipeline_config, services)
}

#[tokio::test]
async fn happy_path_moves_forward_and_materializes_every_product() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(&db, Behaviour::Succeed, menu_draft(12)));
    let pipeline = pipeline_with(&db, &storage, services.clone(), IngestionConfig::default());
    let session = pending_session(&db, &storage, ProcessingFlags::default()).await;

    let completed = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run")
        .expect("session claimed");

    assert_eq!(completed.status, SessionStatus::Completed);
    let summary = completed.result_summary.expect("summary");
    assert_eq!(summary.products_created, 12);
    assert!(summary.materialized);
    assert!(completed.failure_reason.is_none());
    assert!(completed.draft.is_none());

    let products = Product::list_for_session(&session.id, &db)
        .await
        .expect("products");
    assert_eq!(products.len(), 12);

    // Every product links the same component.
    assert_eq!(summary.created_component_ids.len(), 1);
    let component_id = summary.created_component_ids.first().cloned();
    assert!(products
        .iter()
        .all(|p| p.steps[0].options[0].component_id == component_id));

    assert_eq!(*services.calls.lock().await, vec!["extract", "draft"]);
    assert_eq!(
        *services.observed.lock().await,
        vec![SessionStatus::ExtractingText, SessionStatus::Processing]
    );
}

#[tokio::test]
async fn extraction_failure_marks_session_failed() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(
        &db,
        Behaviour::FailExtraction,
        menu_draft(1),
    ));
    let pipeline = pipeline_with(&db, &storage, services.clone(), IngestionConfig::default());
    let session = pending_session(&db, &storage, ProcessingFlags::default()).await;

    let failed = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run")
        .expect("session claimed");

    assert_eq!(failed.status, SessionStatus::Failed);
    let reason = failed.failure_reason.expect("reason");
    assert_eq!(reason.code, FAILURE_EXTRACTION);
    assert!(!reason.message.is_empty());
    assert!(failed.result_summary.is_none());
    assert_eq!(*services.calls.lock().await, vec!["extract"]);
}

#[tokio::test]
async fn slow_extraction_times_out() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(
        &db,
        Behaviour::HangExtraction,
        menu_draft(1),
    ));
    let pipeline_config = IngestionConfig {
        extraction_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let pipeline = pipeline_with(&db, &storage, services, pipeline_config);
    let session = pending_session(&db, &storage, ProcessingFlags::default()).await;

    let failed = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run")
        .expect("session claimed");

    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(
        failed.failure_reason.map(|r| r.code),
        Some(FAILURE_EXTRACTION_TIMEOUT.to_string())
    );
}

#[tokio::test]
async fn empty_draft_fails_without_writing() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(
        &db,
        Behaviour::Succeed,
        CatalogDraft::default(),
    ));
    let pipeline = pipeline_with(&db, &storage, services, IngestionConfig::default());
    let session = pending_session(&db, &storage, ProcessingFlags::default()).await;

    let failed = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run")
        .expect("session claimed");

    assert_eq!(
        failed.failure_reason.map(|r| r.code),
        Some(FAILURE_EMPTY_DRAFT.to_string())
    );
    let products = Product::list_for_session(&session.id, &db)
        .await
        .expect("products");
    assert!(products.is_empty());
}

#[tokio::test]
async fn missing_source_bytes_fail_the_session() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(&db, Behaviour::Succeed, menu_draft(1)));
    let pipeline = pipeline_with(&db, &storage, services.clone(), IngestionConfig::default());
    let session = pending_session(&db, &storage, ProcessingFlags::default()).await;
    storage
        .delete_prefix(&format!("sessions/{}", session.id))
        .await
        .expect("delete upload");

    let failed = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run")
        .expect("session claimed");

    assert_eq!(
        failed.failure_reason.map(|r| r.code),
        Some(FAILURE_SOURCE_UNAVAILABLE.to_string())
    );
    assert!(services.calls.lock().await.is_empty());
}

#[tokio::test]
async fn partial_materialization_failure_keeps_written_products() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(&db, Behaviour::Succeed, menu_draft(10)));
    let pipeline = pipeline_with(&db, &storage, services, IngestionConfig::default())
        .with_catalog_writer(Arc::new(FlakyWriter {
            inner: SurrealCatalogWriter::new(Arc::clone(&db)),
            succeed_products: 6,
            seen: AtomicUsize::new(0),
        }));
    let session = pending_session(&db, &storage, ProcessingFlags::default()).await;

    let failed = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run")
        .expect("session claimed");

    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(
        failed.failure_reason.as_ref().map(|r| r.code.as_str()),
        Some(FAILURE_MATERIALIZATION)
    );
    let summary = failed.result_summary.expect("partial summary");
    assert_eq!(summary.products_created, 6);
    assert_eq!(summary.products_extracted, 10);

    let products = Product::list_for_session(&session.id, &db)
        .await
        .expect("products");
    assert_eq!(products.len(), 6);
}

#[tokio::test]
async fn reaped_mid_materialization_keeps_count_of_written_products() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(&db, Behaviour::Succeed, menu_draft(5)));
    let pipeline = pipeline_with(&db, &storage, services, IngestionConfig::default())
        .with_catalog_writer(Arc::new(ReapingWriter {
            inner: SurrealCatalogWriter::new(Arc::clone(&db)),
            db: Arc::clone(&db),
            delay: Duration::ZERO,
            lease: Duration::from_millis(100),
            reap_from: 2,
            seen: AtomicUsize::new(0),
        }));
    let session = pending_session(&db, &storage, ProcessingFlags::default()).await;

    let failed = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run")
        .expect("session claimed");

    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(
        failed.failure_reason.as_ref().map(|r| r.code.as_str()),
        Some(FAILURE_LEASE_EXPIRED)
    );

    let products = Product::list_for_session(&session.id, &db)
        .await
        .expect("products");
    assert_eq!(products.len(), 3);
    let summary = failed.result_summary.expect("summary of written products");
    assert_eq!(summary.products_created, products.len());

    let stored = ProcessingSession::get(&session.id, &db)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(stored.status_view().products_created, Some(3));
}

#[tokio::test]
async fn slow_materialization_renews_its_lease() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(&db, Behaviour::Succeed, menu_draft(10)));
    let pipeline = pipeline_with(&db, &storage, services, IngestionConfig::default())
        .with_catalog_writer(Arc::new(ReapingWriter {
            inner: SurrealCatalogWriter::new(Arc::clone(&db)),
            db: Arc::clone(&db),
            delay: Duration::from_millis(20),
            lease: Duration::from_millis(150),
            reap_from: usize::MAX,
            seen: AtomicUsize::new(0),
        }));
    let session = pending_session(&db, &storage, ProcessingFlags::default()).await;

    let completed = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run")
        .expect("session claimed");

    assert_eq!(completed.status, SessionStatus::Completed);
    assert_eq!(
        completed.result_summary.map(|summary| summary.products_created),
        Some(10)
    );
}

#[tokio::test]
async fn preview_import_keeps_draft_without_materializing() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(&db, Behaviour::Succeed, menu_draft(3)));
    let pipeline = pipeline_with(&db, &storage, services, IngestionConfig::default());
    let flags = ProcessingFlags {
        auto_process: false,
        extract_components: true,
    };
    let session = pending_session(&db, &storage, flags).await;

    let completed = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run")
        .expect("session claimed");

    assert_eq!(completed.status, SessionStatus::Completed);
    let summary = completed.result_summary.expect("summary");
    assert!(!summary.materialized);
    assert_eq!(summary.products_created, 0);
    assert_eq!(summary.products_extracted, 3);

    let draft: CatalogDraft =
        serde_json::from_value(completed.draft.expect("draft kept")).expect("draft decodes");
    assert_eq!(draft.products.len(), 3);

    let products = Product::list_for_session(&session.id, &db)
        .await
        .expect("products");
    assert!(products.is_empty());
}

#[tokio::test]
async fn already_claimed_session_is_skipped() {
    let db = setup_db().await;
    let storage = StorageManager::memory();
    let services = Arc::new(MockServices::new(&db, Behaviour::Succeed, menu_draft(1)));
    let pipeline = pipeline_with(&db, &storage, services.clone(), IngestionConfig::default());
    let session = pending_session(&db, &storage, ProcessingFlags::default()).await;

    ProcessingSession::claim(&session.id, "other-worker", &db)
        .await
        .expect("claim")
        .expect("claimed");

    let outcome = pipeline
        .process_session(&session.id, "worker-1")
        .await
        .expect("pipeline run");

    assert!(outcome.is_none());
    assert!(services.calls.lock().await.is_empty());
}
