use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const UNCATEGORIZED: &str = "Uncategorized";

stored_object!(Category, "category", {
    store_id: String,
    name: String
});

impl Category {
    pub fn new(store_id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            store_id,
            name: name.trim().to_string(),
        }
    }

    pub async fn list_for_store(
        store_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Category>, AppError> {
        let categories: Vec<Category> = db
            .query("SELECT * FROM type::table($table) WHERE store_id = $store_id ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .bind(("store_id", store_id.to_string()))
            .await?
            .take(0)?;

        Ok(categories)
    }
}
