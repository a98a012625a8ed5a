use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            category::{Category, UNCATEGORIZED},
            component::Component,
            processing_session::{ProcessingSession, ResultSummary},
            product::{CompositionStep, Product, ProductVariation, StepOption},
        },
    },
};
use tracing::{debug, info, instrument};

use super::draft::{CatalogDraft, ExtractedComponent, ExtractedProduct};

/// Persistence seam for the materializer.
#[async_trait]
pub trait CatalogWriter: Send + Sync {
    async fn load_categories(&self, store_id: &str) -> Result<Vec<Category>, AppError>;
    async fn load_components(&self, store_id: &str) -> Result<Vec<Component>, AppError>;
    async fn create_category(&self, category: Category) -> Result<Category, AppError>;
    async fn create_component(&self, component: Component) -> Result<Component, AppError>;
    async fn create_product(&self, product: Product) -> Result<Product, AppError>;
}

/// Ownership check run between catalog writes.
#[async_trait]
pub trait SessionLease: Send + Sync {
    /// Extends the lease. `false` once the session is no longer ours.
    async fn renew(&self) -> Result<bool, AppError>;
}

/// Lease held by one worker on one claimed session.
pub struct WorkerLease {
    db: Arc<SurrealDbClient>,
    session_id: String,
    worker_id: String,
}

impl WorkerLease {
    pub fn new(db: Arc<SurrealDbClient>, session_id: String, worker_id: String) -> Self {
        Self {
            db,
            session_id,
            worker_id,
        }
    }
}

#[async_trait]
impl SessionLease for WorkerLease {
    async fn renew(&self) -> Result<bool, AppError> {
        ProcessingSession::renew_lease(&self.session_id, &self.worker_id, &self.db).await
    }
}

pub struct SurrealCatalogWriter {
    db: Arc<SurrealDbClient>,
}

impl SurrealCatalogWriter {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogWriter for SurrealCatalogWriter {
    async fn load_categories(&self, store_id: &str) -> Result<Vec<Category>, AppError> {
        Category::list_for_store(store_id, &self.db).await
    }

    async fn load_components(&self, store_id: &str) -> Result<Vec<Component>, AppError> {
        Component::list_for_store(store_id, &self.db).await
    }

    async fn create_category(&self, category: Category) -> Result<Category, AppError> {
        self.db.store_item(category.clone()).await?;
        Ok(category)
    }

    async fn create_component(&self, component: Component) -> Result<Component, AppError> {
        self.db.store_item(component.clone()).await?;
        Ok(component)
    }

    async fn create_product(&self, product: Product) -> Result<Product, AppError> {
        self.db.store_item(product.clone()).await?;
        Ok(product)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializationSummary {
    pub products_extracted: usize,
    pub product_ids: Vec<String>,
    pub created_category_ids: Vec<String>,
    pub created_component_ids: Vec<String>,
    pub reused_component_ids: Vec<String>,
}

impl MaterializationSummary {
    pub fn products_created(&self) -> usize {
        self.product_ids.len()
    }

    pub fn to_result_summary(&self) -> ResultSummary {
        ResultSummary {
            products_created: self.products_created(),
            product_ids: self.product_ids.clone(),
            created_category_ids: self.created_category_ids.clone(),
            created_component_ids: self.created_component_ids.clone(),
            products_extracted: self.products_extracted,
            materialized: true,
        }
    }
}

/// Materialization stopped partway. Entities already written stay written.
#[derive(Debug)]
pub struct MaterializationFailure {
    pub summary: MaterializationSummary,
    pub error: AppError,
}

/// The store's catalog as loaded once per materialization, plus everything
/// created during the run.
struct Inventory {
    categories: Vec<Category>,
    components: Vec<Component>,
}

impl Inventory {
    fn category_named(&self, name: &str) -> Option<&Category> {
        let needle = name.trim().to_lowercase();
        self.categories
            .iter()
            .find(|category| category.name.trim().to_lowercase() == needle)
    }

    /// Exact (trimmed) name first, then case-insensitive alias containment in either direction.
    fn component_matching(&self, name: &str) -> Option<&Component> {
        let name = name.trim();
        if let Some(exact) = self
            .components
            .iter()
            .find(|component| component.name.trim() == name)
        {
            return Some(exact);
        }

        let needle = name.to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.components.iter().find(|component| {
            component.aliases.iter().any(|alias| {
                let alias = alias.trim().to_lowercase();
                !alias.is_empty() && (alias.contains(&needle) || needle.contains(&alias))
            })
        })
    }
}

pub struct CatalogMaterializer {
    writer: Arc<dyn CatalogWriter>,
}

impl CatalogMaterializer {
    pub fn new(writer: Arc<dyn CatalogWriter>) -> Self {
        Self { writer }
    }

    /// Writes the draft into the store's catalog.
    ///
    /// Products are created in draft order and never deduplicated. Components
    /// referenced by step options are resolved against the existing inventory
    /// and created when nothing matches. There is no rollback: on failure the
    /// returned summary describes what was already written.
    ///
    /// `lease` is renewed after every write; once it is lost the run stops
    /// with [`AppError::LeaseLost`].
    #[instrument(skip_all, fields(store_id = %store_id, session_id = %session_id))]
    pub async fn materialize(
        &self,
        store_id: &str,
        session_id: &str,
        draft: &CatalogDraft,
        extract_components: bool,
        lease: &dyn SessionLease,
    ) -> Result<MaterializationSummary, MaterializationFailure> {
        let mut summary = MaterializationSummary {
            products_extracted: draft.products.len(),
            ..Default::default()
        };

        let mut inventory = match self.load_inventory(store_id).await {
            Ok(inventory) => inventory,
            Err(error) => return Err(MaterializationFailure { summary, error }),
        };

        let mut run = MaterializationRun {
            writer: self.writer.as_ref(),
            lease,
            store_id,
            draft,
            inventory: &mut inventory,
            summary: &mut summary,
        };

        match run.write_all(session_id, extract_components).await {
            Ok(()) => {
                info!(
                    products_created = summary.products_created(),
                    categories_created = summary.created_category_ids.len(),
                    components_created = summary.created_component_ids.len(),
                    components_reused = summary.reused_component_ids.len(),
                    "catalog materialized"
                );
                Ok(summary)
            }
            Err(error) => Err(MaterializationFailure { summary, error }),
        }
    }

    async fn load_inventory(&self, store_id: &str) -> Result<Inventory, AppError> {
        let categories = self.writer.load_categories(store_id).await?;
        let components = self.writer.load_components(store_id).await?;
        debug!(
            categories = categories.len(),
            components = components.len(),
            "loaded catalog inventory"
        );
        Ok(Inventory {
            categories,
            components,
        })
    }
}

struct MaterializationRun<'a> {
    writer: &'a dyn CatalogWriter,
    lease: &'a dyn SessionLease,
    store_id: &'a str,
    draft: &'a CatalogDraft,
    inventory: &'a mut Inventory,
    summary: &'a mut MaterializationSummary,
}

impl MaterializationRun<'_> {
    async fn write_all(&mut self, session_id: &str, extract_components: bool) -> Result<(), AppError> {
        let draft = self.draft;

        for extracted in &draft.products {
            let product = self
                .build_product(session_id, extracted, extract_components)
                .await?;
            let stored = self.writer.create_product(product).await.map_err(|err| {
                AppError::Materialization(format!(
                    "failed to create product '{}': {err}",
                    extracted.name
                ))
            })?;
            self.summary.product_ids.push(stored.id);
            self.keep_lease().await?;
        }

        // Listed components no option referenced still belong to the store's inventory.
        if extract_components {
            for component in &draft.components {
                self.resolve_component(&component.name, Some(component), None)
                    .await?;
            }
            self.keep_lease().await?;
        }

        Ok(())
    }

    async fn keep_lease(&self) -> Result<(), AppError> {
        if self.lease.renew().await? {
            Ok(())
        } else {
            Err(AppError::LeaseLost(format!(
                "stopped after {} of {} products",
                self.summary.products_created(),
                self.summary.products_extracted
            )))
        }
    }

    async fn build_product(
        &mut self,
        session_id: &str,
        extracted: &ExtractedProduct,
        extract_components: bool,
    ) -> Result<Product, AppError> {
        let category_id = match extracted.category.as_deref() {
            Some(name) => Some(self.resolve_category(name).await?),
            None => None,
        };

        let variations = extracted
            .variations
            .iter()
            .map(|variation| ProductVariation {
                name: variation.name.clone(),
                prices: variation.prices.clone(),
            })
            .collect();

        let mut steps = Vec::with_capacity(extracted.steps.len());
        for step in &extracted.steps {
            let mut options = Vec::with_capacity(step.options.len());
            for option in &step.options {
                let component_id = match option.component.as_deref() {
                    Some(name) if extract_components => {
                        let draft = self.draft;
                        let listed = draft.component_named(name);
                        Some(
                            self.resolve_component(name, listed, extracted.category.as_deref())
                                .await?,
                        )
                    }
                    _ => None,
                };
                options.push(StepOption {
                    name: option.name.clone(),
                    component_id,
                    price_delta: option.price_delta,
                });
            }
            steps.push(CompositionStep {
                name: step.name.clone(),
                min_selections: step.min_selections,
                max_selections: step.max_selections,
                options,
            });
        }

        Ok(Product::new(
            self.store_id.to_string(),
            session_id.to_string(),
            extracted.name.clone(),
            extracted.description.clone(),
            category_id,
            variations,
            steps,
        ))
    }

    async fn resolve_category(&mut self, name: &str) -> Result<String, AppError> {
        if let Some(existing) = self.inventory.category_named(name) {
            return Ok(existing.id.clone());
        }

        let category = Category::new(self.store_id.to_string(), name.to_string());
        let stored = self.writer.create_category(category).await.map_err(|err| {
            AppError::Materialization(format!("failed to create category '{name}': {err}"))
        })?;
        let id = stored.id.clone();
        self.summary.created_category_ids.push(id.clone());
        self.inventory.categories.push(stored);
        Ok(id)
    }

    async fn resolve_component(
        &mut self,
        name: &str,
        listed: Option<&ExtractedComponent>,
        product_category: Option<&str>,
    ) -> Result<String, AppError> {
        if let Some(existing) = self.inventory.component_matching(name) {
            let id = existing.id.clone();
            if !self.summary.reused_component_ids.contains(&id)
                && !self.summary.created_component_ids.contains(&id)
            {
                self.summary.reused_component_ids.push(id.clone());
            }
            return Ok(id);
        }

        let category_name = listed
            .and_then(|component| component.category.as_deref())
            .or(product_category)
            .unwrap_or(UNCATEGORIZED);
        let category_id = self.resolve_category(category_name).await?;

        let component = Component::new(
            self.store_id.to_string(),
            name.to_string(),
            listed
                .map(|component| component.aliases.iter().cloned().collect())
                .unwrap_or_default(),
            Some(category_id),
            listed.and_then(|component| component.default_price),
        );
        let stored = self.writer.create_component(component).await.map_err(|err| {
            AppError::Materialization(format!("failed to create component '{name}': {err}"))
        })?;
        let id = stored.id.clone();
        debug!(component_id = %id, component = %name, "created component");
        self.summary.created_component_ids.push(id.clone());
        self.inventory.components.push(stored);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::pipeline::draft::{ExtractedOption, ExtractedStep};

    async fn memory_db() -> Arc<SurrealDbClient> {
        Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        )
    }

    fn surreal_materializer(db: &Arc<SurrealDbClient>) -> CatalogMaterializer {
        CatalogMaterializer::new(Arc::new(SurrealCatalogWriter::new(Arc::clone(db))))
    }

    fn product(name: &str, category: Option<&str>, components: &[&str]) -> ExtractedProduct {
        ExtractedProduct {
            name: name.into(),
            category: category.map(Into::into),
            steps: if components.is_empty() {
                vec![]
            } else {
                vec![ExtractedStep {
                    name: "Choose".into(),
                    min_selections: 1,
                    max_selections: Some(1),
                    options: components
                        .iter()
                        .map(|c| ExtractedOption {
                            name: (*c).into(),
                            component: Some((*c).into()),
                            price_delta: None,
                        })
                        .collect(),
                }]
            },
            ..Default::default()
        }
    }

    struct HeldLease;

    #[async_trait]
    impl SessionLease for HeldLease {
        async fn renew(&self) -> Result<bool, AppError> {
            Ok(true)
        }
    }

    /// Holds for `renewals` renewals, then reports the session as taken.
    struct ExpiringLease {
        renewals: AtomicUsize,
    }

    #[async_trait]
    impl SessionLease for ExpiringLease {
        async fn renew(&self) -> Result<bool, AppError> {
            let left = self.renewals.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(false);
            }
            self.renewals.store(left - 1, Ordering::SeqCst);
            Ok(true)
        }
    }

    /// Fails every product insert after the first `succeed_products`.
    struct FailingWriter {
        inner: SurrealCatalogWriter,
        succeed_products: usize,
        products_seen: AtomicUsize,
    }

    #[async_trait]
    impl CatalogWriter for FailingWriter {
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
            if self.products_seen.fetch_add(1, Ordering::SeqCst) >= self.succeed_products {
                return Err(AppError::InternalError("insert rejected".into()));
            }
            self.inner.create_product(product).await
        }
    }

    #[tokio::test]
    async fn lost_lease_stops_writing_and_reports_what_was_written() {
        let db = memory_db().await;
        let draft = CatalogDraft {
            products: (0..5)
                .map(|i| product(&format!("Bowl {i}"), Some("Bowls"), &[]))
                .collect(),
            components: vec![],
        };
        let lease = ExpiringLease {
            renewals: AtomicUsize::new(2),
        };

        let failure = surreal_materializer(&db)
            .materialize("store-1", "session-1", &draft, true, &lease)
            .await
            .expect_err("lease lost");

        assert!(matches!(failure.error, AppError::LeaseLost(_)));
        assert_eq!(failure.summary.products_created(), 3);
        let stored = Product::list_for_session("session-1", &db)
            .await
            .expect("products");
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn repeated_component_names_share_one_component() {
        let db = memory_db().await;
        let draft = CatalogDraft {
            products: vec![
                product("Latte", Some("Coffee"), &["Whole Milk"]),
                product("Cappuccino", Some("Coffee"), &["Whole Milk"]),
            ],
            components: vec![],
        };

        let summary = surreal_materializer(&db)
            .materialize("store-1", "session-1", &draft, true, &HeldLease)
            .await
            .expect("materialize");

        assert_eq!(summary.products_created(), 2);
        assert_eq!(summary.created_component_ids.len(), 1);

        let products = Product::list_for_session("session-1", &db)
            .await
            .expect("products");
        let linked: Vec<_> = products
            .iter()
            .map(|p| p.steps[0].options[0].component_id.clone())
            .collect();
        assert_eq!(linked[0], linked[1]);
        assert_eq!(linked[0].as_ref(), summary.created_component_ids.first());
    }

    #[tokio::test]
    async fn existing_components_are_reused_by_name_and_alias() {
        let db = memory_db().await;
        let oat = Component::new(
            "store-1".into(),
            "Oat Milk".into(),
            vec!["oatly barista".into()],
            None,
            None,
        );
        db.store_item(oat.clone()).await.expect("store oat");

        let draft = CatalogDraft {
            products: vec![
                product("Oat Latte", None, &["Oat Milk"]),
                product("Oat Flat White", None, &["Oatly"]),
            ],
            components: vec![],
        };

        let summary = surreal_materializer(&db)
            .materialize("store-1", "session-1", &draft, true, &HeldLease)
            .await
            .expect("materialize");

        assert!(summary.created_component_ids.is_empty());
        assert_eq!(summary.reused_component_ids, vec![oat.id.clone()]);

        let products = Product::list_for_session("session-1", &db)
            .await
            .expect("products");
        for product in products {
            assert_eq!(
                product.steps[0].options[0].component_id.as_deref(),
                Some(oat.id.as_str())
            );
        }
    }

    #[tokio::test]
    async fn new_components_land_in_best_guess_category() {
        let db = memory_db().await;
        let toppings = Category::new("store-1".into(), "Toppings".into());
        db.store_item(toppings.clone()).await.expect("store category");

        let draft = CatalogDraft {
            products: vec![product("Poke Bowl", Some("Bowls"), &["Salmon", "Sesame", "Rice"])],
            components: vec![
                ExtractedComponent {
                    name: "Sesame".into(),
                    category: Some("toppings".into()),
                    default_price: Some(0.3),
                    ..Default::default()
                },
                ExtractedComponent {
                    name: "Napkin".into(),
                    ..Default::default()
                },
            ],
        };

        let summary = surreal_materializer(&db)
            .materialize("store-1", "session-1", &draft, true, &HeldLease)
            .await
            .expect("materialize");

        let components = Component::list_for_store("store-1", &db)
            .await
            .expect("components");
        let categories = Category::list_for_store("store-1", &db)
            .await
            .expect("categories");
        let category_of = |component: &str| {
            let id = components
                .iter()
                .find(|c| c.name == component)
                .and_then(|c| c.category_id.clone())
                .expect("component has category");
            categories
                .iter()
                .find(|c| c.id == id)
                .map(|c| c.name.clone())
                .expect("category exists")
        };

        assert_eq!(category_of("Sesame"), "Toppings");
        assert_eq!(category_of("Salmon"), "Bowls");
        assert_eq!(category_of("Napkin"), UNCATEGORIZED);
        assert_eq!(summary.created_component_ids.len(), 4);
        // "Bowls" and "Uncategorized" are new; "Toppings" already existed.
        assert_eq!(summary.created_category_ids.len(), 2);
        assert_eq!(
            components
                .iter()
                .find(|c| c.name == "Sesame")
                .and_then(|c| c.default_price),
            Some(0.3)
        );
    }

    #[tokio::test]
    async fn disabled_component_extraction_leaves_options_unlinked() {
        let db = memory_db().await;
        let draft = CatalogDraft {
            products: vec![product("Latte", None, &["Whole Milk"])],
            components: vec![ExtractedComponent {
                name: "Whole Milk".into(),
                ..Default::default()
            }],
        };

        let summary = surreal_materializer(&db)
            .materialize("store-1", "session-1", &draft, false, &HeldLease)
            .await
            .expect("materialize");

        assert!(summary.created_component_ids.is_empty());
        let products = Product::list_for_session("session-1", &db)
            .await
            .expect("products");
        assert!(products[0].steps[0].options[0].component_id.is_none());
        let components = db
            .get_all_stored_items::<Component>()
            .await
            .expect("components");
        assert!(components.is_empty());
    }

    #[tokio::test]
    async fn failure_partway_keeps_written_products() {
        let db = memory_db().await;
        let writer = FailingWriter {
            inner: SurrealCatalogWriter::new(Arc::clone(&db)),
            succeed_products: 6,
            products_seen: AtomicUsize::new(0),
        };
        let materializer = CatalogMaterializer::new(Arc::new(writer));
        let draft = CatalogDraft {
            products: (0..10)
                .map(|i| product(&format!("Item {i}"), None, &[]))
                .collect(),
            components: vec![],
        };

        let failure = materializer
            .materialize("store-1", "session-1", &draft, true, &HeldLease)
            .await
            .expect_err("seventh insert fails");

        assert_eq!(failure.summary.products_created(), 6);
        assert_eq!(failure.summary.products_extracted, 10);
        assert!(matches!(failure.error, AppError::Materialization(_)));

        let stored = Product::list_for_session("session-1", &db)
            .await
            .expect("products");
        assert_eq!(stored.len(), 6);
    }

    #[tokio::test]
    async fn reimport_duplicates_products() {
        let db = memory_db().await;
        let materializer = surreal_materializer(&db);
        let draft = CatalogDraft {
            products: vec![product("Espresso", Some("Coffee"), &["Beans"])],
            components: vec![],
        };

        let first = materializer
            .materialize("store-1", "session-1", &draft, true, &HeldLease)
            .await
            .expect("first import");
        let second = materializer
            .materialize("store-1", "session-2", &draft, true, &HeldLease)
            .await
            .expect("second import");

        assert_ne!(first.product_ids, second.product_ids);
        assert!(second.created_component_ids.is_empty());
        assert!(second.created_category_ids.is_empty());

        let products = Product::list_for_store("store-1", &db)
            .await
            .expect("products");
        assert_eq!(products.len(), 2);
    }
}
