//! Thin, retrying, failure-tolerant facade over the remote task service.
//!
//! Every operation degrades instead of propagating transient failure: reads
//! fall back to an empty list and writes report `false` once the retry
//! budget is spent. Callers treat both as "try again next pass".

use crate::error::CoreError;
use crate::ident;
use crate::models::{StateUpdate, Task};
use crate::retry::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait TaskService: Send + Sync {
    /// Tasks assigned to `agent` with status `idle`.
    async fn list_idle_tasks(&self, agent: &str, limit: usize) -> Vec<Task>;

    /// Unassigned `idle` tasks in `queue`.
    async fn get_unassigned_in_queue(&self, queue: &str, limit: usize) -> Vec<Task>;

    /// Best-effort assignment; `true` when the remote accepted it.
    async fn assign(&self, task_id: &str, agent: &str) -> bool;

    /// Report a lifecycle transition for a task.
    async fn update_state(
        &self,
        task_id: &str,
        state: StateUpdate,
        metadata: serde_json::Value,
    ) -> bool;
}

/// Transport-level failure worth retrying: connect errors, timeouts, 5xx.
/// Once the retry budget is spent it surfaces as
/// [`CoreError::RemoteTransient`] before the caller degrades.
#[derive(Debug)]
struct TransientError(String);

impl std::fmt::Display for TransientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct HttpTaskService {
    client: reqwest::Client,
    base: String,
    retry: RetryPolicy,
}

impl HttpTaskService {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base: endpoint.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn exhausted(&self, error: TransientError) -> CoreError {
        CoreError::RemoteTransient {
            attempts: self.retry.max_attempts,
            last: error.0,
        }
    }

    /// GET a task list. Non-5xx HTTP errors and unparseable bodies cannot be
    /// retried away, so they degrade to empty immediately.
    async fn fetch_tasks(&self, url: &str) -> Vec<Task> {
        let result = retry_with_backoff(&self.retry, move || async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| TransientError(e.to_string()))?;
            let status = response.status();
            if status.is_server_error() {
                return Err(TransientError(format!("server error {status}")));
            }
            if !status.is_success() {
                warn!(url, %status, "task service rejected read");
                return Ok(Vec::new());
            }
            match response.json::<Vec<Task>>().await {
                Ok(tasks) => Ok(tasks),
                Err(e) => {
                    warn!(url, error = %e, "task service returned an unparseable body");
                    Ok(Vec::new())
                }
            }
        })
        .await;

        match result {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(url, error = %self.exhausted(e), "returning empty list");
                Vec::new()
            }
        }
    }

    /// POST a JSON body; `true` on 2xx. Retries transport failures and 5xx.
    async fn post(&self, url: &str, body: serde_json::Value) -> bool {
        let result = retry_with_backoff(&self.retry, || {
            let body = body.clone();
            async move {
                let response = self
                    .client
                    .post(url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| TransientError(e.to_string()))?;
                let status = response.status();
                if status.is_server_error() {
                    return Err(TransientError(format!("server error {status}")));
                }
                if !status.is_success() {
                    warn!(url, %status, "task service rejected write");
                    return Ok(false);
                }
                Ok(true)
            }
        })
        .await;

        match result {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(url, error = %self.exhausted(e), "write dropped");
                false
            }
        }
    }
}

#[async_trait]
impl TaskService for HttpTaskService {
    async fn list_idle_tasks(&self, agent: &str, limit: usize) -> Vec<Task> {
        if let Err(e) = ident::validate_ident("agent", agent) {
            warn!(error = %e, "refusing task-service read");
            return Vec::new();
        }
        let url = format!(
            "{}/tasks?assigned_to={agent}&status=idle&limit={limit}",
            self.base
        );
        self.fetch_tasks(&url).await
    }

    async fn get_unassigned_in_queue(&self, queue: &str, limit: usize) -> Vec<Task> {
        if let Err(e) = ident::validate_ident("queue", queue) {
            warn!(error = %e, "refusing task-service read");
            return Vec::new();
        }
        let url = format!(
            "{}/tasks?queue={queue}&unassigned=true&status=idle&limit={limit}",
            self.base
        );
        self.fetch_tasks(&url).await
    }

    async fn assign(&self, task_id: &str, agent: &str) -> bool {
        if let Err(e) = ident::validate_ident("task_id", task_id)
            .and_then(|_| ident::validate_ident("agent", agent))
        {
            warn!(error = %e, "refusing task-service assign");
            return false;
        }
        let url = format!("{}/tasks/{task_id}/assign", self.base);
        self.post(&url, serde_json::json!({ "agent": agent })).await
    }

    async fn update_state(
        &self,
        task_id: &str,
        state: StateUpdate,
        metadata: serde_json::Value,
    ) -> bool {
        if let Err(e) = ident::validate_ident("task_id", task_id) {
            warn!(error = %e, "refusing task-service state update");
            return false;
        }
        let url = format!("{}/tasks/{task_id}/state", self.base);
        self.post(
            &url,
            serde_json::json!({ "state": state.as_str(), "metadata": metadata }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> HttpTaskService {
        HttpTaskService::new("http://127.0.0.1:1/", Duration::from_millis(100))
            .unwrap()
            .with_retry(RetryPolicy::instant())
    }

    #[test]
    fn test_base_url_trimmed() {
        assert_eq!(service().base, "http://127.0.0.1:1");
    }

    #[test]
    fn test_exhausted_retries_map_to_remote_transient() {
        let service = service();
        let error = service.exhausted(TransientError("connection refused".to_string()));
        match error {
            CoreError::RemoteTransient { attempts, last } => {
                assert_eq!(attempts, service.retry.max_attempts);
                assert_eq!(last, "connection refused");
            }
            other => panic!("expected RemoteTransient, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_identifiers_degrade_without_network() {
        let service = service();
        assert!(service.list_idle_tasks("bad agent", 5).await.is_empty());
        assert!(service.get_unassigned_in_queue("", 5).await.is_empty());
        assert!(!service.assign("id;rm", "vaela").await);
        assert!(!service.assign("42", "bad agent").await);
        assert!(
            !service
                .update_state("../up", StateUpdate::Idle, serde_json::json!({}))
                .await
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_degrades() {
        // port 1 refuses connections; retries exhaust, reads go empty and
        // writes report false
        let service = service();
        assert!(service.list_idle_tasks("vaela", 5).await.is_empty());
        assert!(!service.assign("42", "vaela").await);
    }
}
