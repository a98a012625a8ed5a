use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_EXTRACTION_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_SESSION_LEASE_SECS: u64 = 600;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_processing_model")]
    pub processing_model: String,
    #[serde(default = "default_processing_model")]
    pub vision_model: String,
    #[serde(default = "default_max_document_bytes")]
    pub ingest_max_document_bytes: usize,
    /// Upper bound for each call to the external extraction service.
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,
    /// Sessions left in a working state longer than this are failed by the reaper.
    #[serde(default = "default_session_lease_secs")]
    pub session_lease_secs: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_worker_sweep_interval_secs")]
    pub worker_sweep_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "catalog".to_string(),
            surrealdb_database: "ingestion".to_string(),
            data_dir: default_data_dir(),
            http_port: 0,
            openai_base_url: default_base_url(),
            storage: default_storage_kind(),
            processing_model: default_processing_model(),
            vision_model: default_processing_model(),
            ingest_max_document_bytes: default_max_document_bytes(),
            extraction_timeout_secs: default_extraction_timeout_secs(),
            session_lease_secs: default_session_lease_secs(),
            worker_concurrency: default_worker_concurrency(),
            worker_sweep_interval_secs: default_worker_sweep_interval_secs(),
        }
    }
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_processing_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_document_bytes() -> usize {
    DEFAULT_MAX_DOCUMENT_BYTES
}

fn default_extraction_timeout_secs() -> u64 {
    DEFAULT_EXTRACTION_TIMEOUT_SECS
}

fn default_session_lease_secs() -> u64 {
    DEFAULT_SESSION_LEASE_SECS
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_worker_sweep_interval_secs() -> u64 {
    5
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
