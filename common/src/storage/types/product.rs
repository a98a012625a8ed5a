use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// One sellable variant, priced per sales channel (e.g. `in_store`, `delivery`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Default)]
pub struct ProductVariation {
    pub name: String,
    #[serde(default)]
    pub prices: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Default)]
pub struct CompositionStep {
    pub name: String,
    #[serde(default)]
    pub min_selections: u32,
    #[serde(default)]
    pub max_selections: Option<u32>,
    #[serde(default)]
    pub options: Vec<StepOption>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Default)]
pub struct StepOption {
    pub name: String,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub price_delta: Option<f64>,
}

stored_object!(Product, "product", {
    store_id: String,
    session_id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category_id: Option<String>,
    #[serde(default)]
    variations: Vec<ProductVariation>,
    #[serde(default)]
    steps: Vec<CompositionStep>
});

impl Product {
    pub fn new(
        store_id: String,
        session_id: String,
        name: String,
        description: Option<String>,
        category_id: Option<String>,
        variations: Vec<ProductVariation>,
        steps: Vec<CompositionStep>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            store_id,
            session_id,
            name: name.trim().to_string(),
            description,
            category_id,
            variations,
            steps,
        }
    }

    /// Products materialized by one ingestion session.
    pub async fn list_for_session(
        session_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Product>, AppError> {
        let products: Vec<Product> = db
            .query("SELECT * FROM type::table($table) WHERE session_id = $session_id ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .bind(("session_id", session_id.to_string()))
            .await?
            .take(0)?;

        Ok(products)
    }

    pub async fn list_for_store(
        store_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Product>, AppError> {
        let products: Vec<Product> = db
            .query("SELECT * FROM type::table($table) WHERE store_id = $store_id ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .bind(("store_id", store_id.to_string()))
            .await?
            .take(0)?;

        Ok(products)
    }
}
