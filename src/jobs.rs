use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{truncate_message, ProvisionError};
use crate::tenant::orchestrator::ProvisionOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Error,
}

/// Completion event for a lifecycle job. Exactly one is emitted per submitted
/// job, whether it finished, failed, panicked or timed out.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionEvent {
    pub tenant_id: String,
    pub user: String,
    pub action: String,
    pub status: EventStatus,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_url: Option<String>,
}

/// Fan-out channel for lifecycle events. Receivers come and go; emitting with
/// no subscribers is fine.
pub struct EventBus {
    tx: broadcast::Sender<ProvisionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProvisionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProvisionEvent) {
        match event.status {
            EventStatus::Success => tracing::info!(
                tenant_id = %event.tenant_id,
                action = %event.action,
                "{}",
                event.message
            ),
            EventStatus::Error => tracing::error!(
                tenant_id = %event.tenant_id,
                action = %event.action,
                "{}",
                event.message
            ),
        }
        let _ = self.tx.send(event);
    }
}

/// Runs lifecycle jobs on blocking threads under a hard deadline.
///
/// Jobs are synchronous closures (the orchestrator's methods); the runner owns
/// the async plumbing around them. A job that overruns its deadline or panics
/// never persisted its own failure, so the caller supplies `on_failure` to
/// mark the record.
pub struct JobRunner {
    timeout: Duration,
    events: Arc<EventBus>,
}

impl JobRunner {
    pub fn new(timeout: Duration, events: Arc<EventBus>) -> Self {
        Self { timeout, events }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Submit a job; the returned handle joins the completion of this job
    /// specifically (the event on the bus carries the outcome).
    pub fn submit<J, F>(
        &self,
        tenant_id: String,
        user: String,
        action: &'static str,
        job: J,
        on_failure: F,
    ) -> tokio::task::JoinHandle<()>
    where
        J: FnOnce() -> Result<Option<ProvisionOutcome>, ProvisionError> + Send + 'static,
        F: FnOnce(&str) + Send + 'static,
    {
        let events = self.events.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, tokio::task::spawn_blocking(job)).await;

            let (status, message, result) = match outcome {
                Ok(Ok(Ok(result))) => {
                    (EventStatus::Success, format!("{} completed", action), result)
                }
                // The job failed and already persisted its own error state.
                Ok(Ok(Err(err))) => {
                    (EventStatus::Error, truncate_message(&err.to_string()), None)
                }
                Ok(Err(join_err)) => {
                    let message =
                        truncate_message(&format!("{} job panicked: {}", action, join_err));
                    on_failure(&message);
                    (EventStatus::Error, message, None)
                }
                Err(_) => {
                    let message =
                        format!("{} did not finish within {}s", action, timeout.as_secs());
                    on_failure(&message);
                    (EventStatus::Error, message, None)
                }
            };

            events.emit(ProvisionEvent {
                tenant_id,
                user,
                action: action.to_string(),
                status,
                message,
                timestamp: chrono::Utc::now(),
                container_name: result.as_ref().and_then(|o| o.container_name.clone()),
                container_port: result.as_ref().and_then(|o| o.container_port),
                access_url: result.as_ref().map(|o| o.access_url.clone()),
            });
        })
    }
}
