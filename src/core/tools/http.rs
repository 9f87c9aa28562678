use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use tracing::debug;

use super::{LatencyClass, Tool, ToolDescriptor, ToolRequest, ToolResponse, ToolStatus};
use crate::config::HttpToolConfig;

/// A tool served by a remote endpoint that accepts the tool request as JSON.
///
/// `long_running` tools may answer the submission with a job id instead of a
/// result. The adapter then polls the job's status URL until it finishes or
/// the call deadline is about to pass.
pub struct HttpTool {
    descriptor: ToolDescriptor,
    url: String,
    token: Option<String>,
    poll_interval: Duration,
    client: reqwest::Client,
}

/// Where a submitted job stands, as reported by the remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JobState {
    Pending,
    Failed(String),
    Finished,
}

const PENDING_STATES: &[&str] = &[
    "pending",
    "queued",
    "submitted",
    "running",
    "processing",
    "in_progress",
];
const FAILED_STATES: &[&str] = &["failed", "failure", "error", "canceled", "cancelled"];
const TOOL_STATUSES: &[&str] = &["success", "soft_failure", "hard_failure"];

impl HttpTool {
    pub fn new(descriptor: ToolDescriptor, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            descriptor,
            url: url.into(),
            token,
            poll_interval: Duration::from_secs(2),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn from_config(decl: &HttpToolConfig, default_poll: Duration) -> Result<Self> {
        let token = match &decl.token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                anyhow::anyhow!("tool '{}' expects a token in ${}", decl.name, var)
            })?),
            None => None,
        };
        let descriptor = ToolDescriptor::new(&decl.name, decl.capability)
            .with_media_kinds(&decl.media_kinds)
            .with_source_modes(&decl.source_modes)
            .with_cost(decl.cost_class, decl.cost_units)
            .with_latency(decl.latency_class)
            .with_input_schema(decl.input_schema.clone());
        let poll = decl
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(default_poll);
        Ok(Self::new(descriptor, &decl.url, token).with_poll_interval(poll))
    }

    fn authorize(&self, call: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => call.bearer_auth(token),
            None => call,
        }
    }

    /// Read a response: 2xx bodies are returned as JSON, anything else is
    /// already classified.
    async fn read(&self, response: reqwest::Response) -> Result<Value, ToolResponse> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| ToolResponse::hard(format!("malformed response body: {e}")));
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify_status(status, text, retry_after))
    }

    /// Poll a submitted job until it leaves the pending states. Stops one
    /// interval short of the deadline so a slow job ends as a soft failure
    /// rather than an expired call.
    async fn poll_job(
        &self,
        job_id: &str,
        status_url: &str,
        request: &ToolRequest,
        started: Instant,
    ) -> ToolResponse {
        let mut polls = 0u32;
        loop {
            if started.elapsed() + self.poll_interval >= request.deadline {
                return ToolResponse::soft(format!(
                    "job {job_id} still pending after {}ms ({polls} polls)",
                    started.elapsed().as_millis()
                ));
            }
            tokio::select! {
                _ = request.cancel.cancelled() => {
                    return ToolResponse::soft(format!("job {job_id} polling canceled"));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            polls += 1;

            let remaining = request.deadline.saturating_sub(started.elapsed());
            let call = self.authorize(self.client.get(status_url).timeout(remaining));
            let body = match call.send().await {
                Ok(response) => match self.read(response).await {
                    Ok(body) => body,
                    Err(failed) if failed.status == ToolStatus::HardFailure => {
                        return failed;
                    }
                    Err(failed) => {
                        debug!(
                            "Status poll {} for job {} failed: {}",
                            polls,
                            job_id,
                            failed.error.as_deref().unwrap_or("no detail")
                        );
                        continue;
                    }
                },
                Err(e) => {
                    debug!("Status poll {} for job {} unreachable: {}", polls, job_id, e);
                    continue;
                }
            };

            match job_state(&body) {
                JobState::Pending => {
                    debug!("Job {} of {} still pending", job_id, self.descriptor.name);
                }
                JobState::Failed(reason) => return ToolResponse::hard(reason),
                JobState::Finished => return finished_response(body),
            }
        }
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, request: &ToolRequest) -> ToolResponse {
        let started = Instant::now();
        let body = json!({
            "tool_name": request.tool_name,
            "payload": request.payload,
            "deadline_ms": request.deadline.as_millis() as u64,
            "task_context": request.context,
            "attempt": request.attempt,
        });

        let call = self.authorize(
            self.client
                .post(&self.url)
                .timeout(request.deadline)
                .json(&body),
        );
        let response = match call.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("HTTP tool {} unreachable: {}", self.descriptor.name, e);
                return ToolResponse::soft(format!("request to {} failed: {}", self.url, e));
            }
        };
        let body = match self.read(response).await {
            Ok(body) => body,
            Err(failed) => return failed,
        };

        if self.descriptor.latency_class == LatencyClass::LongRunning
            && let Some(job_id) = submitted_job(&body)
        {
            let status_url = body
                .get("status_url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}/{}", self.url.trim_end_matches('/'), job_id));
            debug!(
                "Tool {} accepted job {}, polling {}",
                self.descriptor.name, job_id, status_url
            );
            return self.poll_job(&job_id, &status_url, request, started).await;
        }
        response_from_body(body)
    }
}

/// Retry-After in delta-seconds form. HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) fn classify_status(
    status: StatusCode,
    body: String,
    retry_after: Option<Duration>,
) -> ToolResponse {
    let detail = if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    };
    if status == StatusCode::TOO_MANY_REQUESTS {
        let response = ToolResponse::soft(detail);
        return match retry_after {
            Some(delay) => response.with_retry_after(delay),
            None => response,
        };
    }
    if status.is_server_error() {
        return ToolResponse::soft(detail);
    }
    ToolResponse::hard(detail)
}

/// A 2xx body either is a full tool response (it carries `status`) or is the
/// result itself.
pub(crate) fn response_from_body(body: Value) -> ToolResponse {
    if body.get("status").is_some() {
        return serde_json::from_value::<ToolResponse>(body)
            .unwrap_or_else(|e| ToolResponse::hard(format!("malformed tool response: {e}")));
    }
    ToolResponse::success(body)
}

fn state_text(body: &Value) -> Option<String> {
    body.get("state")
        .or_else(|| body.get("status"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
}

pub(crate) fn job_state(body: &Value) -> JobState {
    match state_text(body) {
        Some(state) if PENDING_STATES.contains(&state.as_str()) => JobState::Pending,
        Some(state) if FAILED_STATES.contains(&state.as_str()) => {
            let reason = body
                .get("error")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("job ended in state '{state}'"));
            JobState::Failed(reason)
        }
        _ => JobState::Finished,
    }
}

/// The job id of a submission that has not produced its result yet.
pub(crate) fn submitted_job(body: &Value) -> Option<String> {
    if body.get("content_ref").is_some() || body.get("result").is_some() {
        return None;
    }
    if job_state(body) != JobState::Pending {
        return None;
    }
    ["job_id", "task_id"].iter().find_map(|key| match body.get(*key) {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A finished job: a full tool response when it carries a tool status,
/// otherwise its `result` (or the whole body) is the result.
pub(crate) fn finished_response(body: Value) -> ToolResponse {
    if let Some(status) = body.get("status").and_then(Value::as_str)
        && TOOL_STATUSES.contains(&status)
    {
        return response_from_body(body);
    }
    match body.get("result") {
        Some(result) => ToolResponse::success(result.clone()),
        None => ToolResponse::success(body),
    }
}
