use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::PollError,
    source::StatusSource,
    wire::{FailureReason, ResultSummary, SessionStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Non-terminal responses tolerated before giving up locally.
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 40,
        }
    }
}

/// Terminal state reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed {
        products_created: usize,
        summary: Option<ResultSummary>,
    },
    Failed(FailureReason),
}

pub struct PollingClient<S: ?Sized = dyn StatusSource> {
    source: Arc<S>,
    config: PollConfig,
}

impl<S: StatusSource + ?Sized> PollingClient<S> {
    pub fn new(source: Arc<S>, config: PollConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }

    pub async fn observe(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, PollError> {
        self.observe_with_progress(session_id, cancel, |_| {}).await
    }

    /// Polls until the session is terminal, the budget runs out or `cancel` fires.
    ///
    /// `on_status` sees every distinct status in the order observed. Stopping
    /// here never affects the server-side job.
    pub async fn observe_with_progress<F>(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        mut on_status: F,
    ) -> Result<PollOutcome, PollError>
    where
        F: FnMut(SessionStatus) + Send,
    {
        let mut attempts: u32 = 0;
        let mut last_seen: Option<SessionStatus> = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(%session_id, attempts, "observation cancelled");
                    return Err(PollError::Cancelled);
                }
                () = tokio::time::sleep(self.config.interval) => {}
            }

            let snapshot = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PollError::Cancelled),
                fetched = self.source.fetch_status(session_id) => fetched?,
            };

            if last_seen != Some(snapshot.status) {
                debug!(%session_id, status = ?snapshot.status, "session status changed");
                on_status(snapshot.status);
                last_seen = Some(snapshot.status);
            }

            match snapshot.status {
                SessionStatus::Completed => {
                    let products_created = snapshot
                        .products_created
                        .or_else(|| snapshot.result_summary.as_ref().map(|s| s.products_created))
                        .unwrap_or_default();
                    info!(%session_id, products_created, "session completed");
                    return Ok(PollOutcome::Completed {
                        products_created,
                        summary: snapshot.result_summary,
                    });
                }
                SessionStatus::Failed => {
                    let reason = snapshot.failure_reason.unwrap_or_else(|| FailureReason {
                        code: "unknown".to_string(),
                        message: "Session failed without a reason".to_string(),
                    });
                    info!(%session_id, code = %reason.code, "session failed");
                    return Ok(PollOutcome::Failed(reason));
                }
                SessionStatus::Pending
                | SessionStatus::ExtractingText
                | SessionStatus::Processing => {}
            }

            attempts = attempts.saturating_add(1);
            if attempts >= self.config.max_attempts {
                warn!(%session_id, attempts, "gave up waiting for session");
                return Err(PollError::ClientTimeout { attempts });
            }
        }
    }
}
