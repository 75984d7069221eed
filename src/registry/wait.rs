use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::JobRegistry;
use crate::config::WaitConfig;
use crate::error::{CubeForgeError, Result};
use crate::execution::ExecutableState;

impl JobRegistry {
    /// Block until the job reaches SUCCEED, ERROR or DISCARDED and return
    /// that status.
    ///
    /// Wakes on committed status events and falls back to re-reading the
    /// store every `poll_interval`, which also covers jobs driven by another
    /// process sharing the store. Returns [`CubeForgeError::Timeout`] once
    /// the configured timeout elapses and [`CubeForgeError::Cancelled`] when
    /// `cancel` fires.
    pub async fn wait_for_final(
        &self,
        id: &Uuid,
        config: &WaitConfig,
        cancel: &CancellationToken,
    ) -> Result<ExecutableState> {
        // Subscribe before the first read so no transition slips between them.
        let mut events = self.subscribe();
        let deadline = config.timeout().map(|t| tokio::time::Instant::now() + t);

        loop {
            let status = self.get(id).await?.status;
            if status.is_final() {
                tracing::debug!(job_id = %id, status = %status, "Job reached final status");
                return Ok(status);
            }

            let timeout = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(CubeForgeError::Cancelled),
                _ = timeout => {
                    tracing::warn!(job_id = %id, status = %status, "Timed out waiting for job");
                    return Err(CubeForgeError::Timeout(*id));
                }
                _ = tokio::time::sleep(config.poll_interval()) => {}
                event = events.recv() => match event {
                    Ok(event) if event.job_id != *id => continue,
                    Ok(event) if event.status.is_final() => return Ok(event.status),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %id, skipped, "Status events lagged, re-reading");
                    }
                    Err(RecvError::Closed) => {
                        events = self.subscribe();
                    }
                },
            }
        }
    }
}
