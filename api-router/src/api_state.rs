use std::sync::Arc;

use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::{config::AppConfig, dispatch::SessionDispatcher},
};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub storage: StorageManager,
    pub dispatcher: SessionDispatcher,
}

impl ApiState {
    pub async fn new(
        config: &AppConfig,
        storage: StorageManager,
        dispatcher: SessionDispatcher,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let surreal_db_client = Arc::new(
            SurrealDbClient::new(
                &config.surrealdb_address,
                &config.surrealdb_username,
                &config.surrealdb_password,
                &config.surrealdb_namespace,
                &config.surrealdb_database,
            )
            .await?,
        );

        surreal_db_client.ensure_initialized().await?;

        let app_state = Self {
            db: surreal_db_client,
            config: config.clone(),
            storage,
            dispatcher,
        };

        Ok(app_state)
    }
}
