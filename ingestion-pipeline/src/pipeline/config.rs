use std::time::Duration;

use common::utils::config::{
    AppConfig, DEFAULT_EXTRACTION_TIMEOUT_SECS, DEFAULT_SESSION_LEASE_SECS,
};

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub worker_concurrency: usize,
    pub sweep_interval: Duration,
    pub session_lease: Duration,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            sweep_interval: Duration::from_secs(5),
            session_lease: Duration::from_secs(DEFAULT_SESSION_LEASE_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    /// Bound on each call to the external extraction service.
    pub extraction_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            tuning: IngestionTuning::default(),
            extraction_timeout: Duration::from_secs(DEFAULT_EXTRACTION_TIMEOUT_SECS),
        }
    }
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tuning: IngestionTuning {
                worker_concurrency: config.worker_concurrency.max(1),
                sweep_interval: Duration::from_secs(config.worker_sweep_interval_secs.max(1)),
                session_lease: Duration::from_secs(config.session_lease_secs),
            },
            extraction_timeout: Duration::from_secs(config.extraction_timeout_secs),
        }
    }
}
