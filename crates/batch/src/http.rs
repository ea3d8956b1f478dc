//! HTTP client for a Jobs-style REST API.
//!
//! Endpoints used (all under `{base_url}/api/2.1/jobs`):
//! - `POST run-now` with `{job_id, job_parameters}` → `{run_id}`
//! - `GET runs/get?run_id=` → run state plus per-task states
//! - `GET runs/get-output?run_id=` (task run id) → `{error, error_trace}`
//! - `POST runs/cancel` with `{run_id}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use adflow_resilience::{CallError, StatusCodePolicy};

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::service::{BatchComputeService, BatchRunState, BatchRunStatus, BatchTask};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpBatchService {
    client: Client,
    base_url: String,
    token: Option<String>,
    status_policy: StatusCodePolicy,
}

impl HttpBatchService {
    pub fn new(config: &BatchConfig) -> Result<Self, BatchError> {
        if config.base_url.trim().is_empty() {
            return Err(BatchError::InvalidConfig("base_url must not be blank".into()));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BatchError::InvalidConfig(format!("http client: {e}")))?;

        info!(base_url = %config.base_url, "HttpBatchService initialised");

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            status_policy: StatusCodePolicy::default(),
        })
    }

    pub fn with_status_policy(mut self, policy: StatusCodePolicy) -> Self {
        self.status_policy = policy;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/2.1/jobs/{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, CallError> {
        let resp = self.authorize(req).send().await.map_err(transport_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let message = error_message(&body).unwrap_or_else(|| truncate(&body, 500));
            return Err(CallError::from_status(status.as_u16(), message, &self.status_policy));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| {
                CallError::Fatal(format!("unparseable response from compute service: {e}"))
            })
    }
}

#[async_trait]
impl BatchComputeService for HttpBatchService {
    async fn submit(&self, job_id: &str, params: &Value) -> Result<String, CallError> {
        // Numeric ids are sent as numbers.
        let job_id_value = job_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(job_id.to_string()));
        let body = json!({ "job_id": job_id_value, "job_parameters": params });

        let resp = self.send(self.client.post(self.url("run-now")).json(&body)).await?;
        let run_id = id_string(&resp["run_id"])
            .ok_or_else(|| CallError::Fatal(format!("run-now response has no run_id: {resp}")))?;
        debug!(job_id, run_id = %run_id, "batch job submitted");
        Ok(run_id)
    }

    async fn get_status(&self, run_id: &str) -> Result<BatchRunStatus, CallError> {
        let req = self.client.get(self.url("runs/get")).query(&[("run_id", run_id)]);
        let resp = self.send(req).await?;
        let run: RunResponse = serde_json::from_value(resp)
            .map_err(|e| CallError::Fatal(format!("unexpected runs/get payload: {e}")))?;
        Ok(run.into_status())
    }

    async fn get_task_error(&self, run_id: &str, task: &BatchTask) -> Result<String, CallError> {
        debug!(run_id, task = %task.task_key, "fetching task output");
        let req = self
            .client
            .get(self.url("runs/get-output"))
            .query(&[("run_id", task.task_run_id.as_str())]);
        let resp = self.send(req).await?;
        Ok(resp["error"]
            .as_str()
            .or_else(|| resp["error_trace"].as_str())
            .unwrap_or("no error message reported")
            .to_string())
    }

    async fn cancel(&self, run_id: &str) -> Result<(), CallError> {
        let run_id_value = run_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(run_id.to_string()));
        self.send(
            self.client
                .post(self.url("runs/cancel"))
                .json(&json!({ "run_id": run_id_value })),
        )
        .await?;
        info!(run_id, "batch run cancellation requested");
        Ok(())
    }
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RunState {
    life_cycle_state: String,
    result_state: Option<String>,
    state_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    run_id: Value,
    #[serde(default)]
    task_key: String,
    state: RunState,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    state: RunState,
    #[serde(default)]
    tasks: Vec<TaskResponse>,
}

impl RunResponse {
    fn into_status(self) -> BatchRunStatus {
        let message = self.state.state_message.clone().filter(|m| !m.is_empty());
        BatchRunStatus {
            state: map_state(&self.state),
            tasks: self
                .tasks
                .into_iter()
                .map(|t| BatchTask {
                    task_run_id: id_string(&t.run_id).unwrap_or_default(),
                    state: map_state(&t.state),
                    task_key: t.task_key,
                })
                .collect(),
            message,
        }
    }
}

fn map_state(state: &RunState) -> BatchRunState {
    match state.life_cycle_state.as_str() {
        "PENDING" | "QUEUED" | "BLOCKED" | "WAITING_FOR_RETRY" => BatchRunState::Queued,
        "RUNNING" | "TERMINATING" => BatchRunState::Running,
        "INTERNAL_ERROR" | "SKIPPED" => BatchRunState::Failed,
        "TERMINATED" => match state.result_state.as_deref() {
            Some("SUCCESS") | Some("SUCCESS_WITH_FAILURES") => BatchRunState::Succeeded,
            Some("CANCELED") | Some("CANCELLED") => BatchRunState::Cancelled,
            _ => BatchRunState::Failed,
        },
        _ => BatchRunState::Running,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn transport_error(e: reqwest::Error) -> CallError {
    if e.is_decode() || e.is_builder() {
        CallError::Fatal(e.to_string())
    } else {
        CallError::Transient(e.to_string())
    }
}

fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["message"]
        .as_str()
        .or_else(|| value["error"].as_str())
        .map(str::to_string)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> BatchRunStatus {
        serde_json::from_str::<RunResponse>(json).unwrap().into_status()
    }

    #[test]
    fn maps_running_and_terminal_states() {
        let running = parse(r#"{"state":{"life_cycle_state":"RUNNING"}}"#);
        assert_eq!(running.state, BatchRunState::Running);
        assert!(running.tasks.is_empty());

        let ok = parse(r#"{"state":{"life_cycle_state":"TERMINATED","result_state":"SUCCESS"}}"#);
        assert_eq!(ok.state, BatchRunState::Succeeded);

        let cancelled =
            parse(r#"{"state":{"life_cycle_state":"TERMINATED","result_state":"CANCELED"}}"#);
        assert_eq!(cancelled.state, BatchRunState::Cancelled);

        let internal =
            parse(r#"{"state":{"life_cycle_state":"INTERNAL_ERROR","state_message":"boom"}}"#);
        assert_eq!(internal.state, BatchRunState::Failed);
        assert_eq!(internal.message.as_deref(), Some("boom"));
    }

    #[test]
    fn collects_failed_tasks() {
        let status = parse(
            r#"{
                "state": {"life_cycle_state": "TERMINATED", "result_state": "FAILED"},
                "tasks": [
                    {"run_id": 11, "task_key": "extract",
                     "state": {"life_cycle_state": "TERMINATED", "result_state": "SUCCESS"}},
                    {"run_id": 12, "task_key": "load",
                     "state": {"life_cycle_state": "TERMINATED", "result_state": "FAILED"}}
                ]
            }"#,
        );
        assert_eq!(status.state, BatchRunState::Failed);
        let failed: Vec<_> = status.failed_tasks().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_key, "load");
        assert_eq!(failed[0].task_run_id, "12");
    }

    #[test]
    fn error_body_helpers() {
        assert_eq!(
            error_message(
                r#"{"error_code":"INVALID_PARAMETER_VALUE","message":"Job 7 does not exist."}"#
            ),
            Some("Job 7 does not exist.".to_string())
        );
        assert_eq!(error_message("<html>"), None);
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }

    #[test]
    fn blank_base_url_is_rejected() {
        let cfg = BatchConfig::default().with_job_id("1");
        assert!(HttpBatchService::new(&cfg).is_err());
    }
}
