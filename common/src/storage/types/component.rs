use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Component, "component", {
    store_id: String,
    name: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    category_id: Option<String>,
    #[serde(default)]
    default_price: Option<f64>
});

impl Component {
    pub fn new(
        store_id: String,
        name: String,
        aliases: Vec<String>,
        category_id: Option<String>,
        default_price: Option<f64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            store_id,
            name: name.trim().to_string(),
            aliases,
            category_id,
            default_price,
        }
    }

    pub async fn list_for_store(
        store_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Component>, AppError> {
        let components: Vec<Component> = db
            .query("SELECT * FROM type::table($table) WHERE store_id = $store_id ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .bind(("store_id", store_id.to_string()))
            .await?
            .take(0)?;

        Ok(components)
    }
}
