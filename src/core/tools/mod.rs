mod budget;
mod compliance;
mod http;
mod invoke;
mod registry;

pub use budget::{BudgetLedger, BudgetLimit, BudgetUsage};
pub use compliance::{TECHNICAL_COMPLIANCE, TechnicalComplianceTool};
pub use http::HttpTool;
pub use invoke::{InvocationResult, RetryPolicy, invoke_with_retry};
pub use registry::ToolRegistry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::types::{MediaKind, SourceMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Planning,
    Generation,
    Verification,
    Render,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Planning => "planning",
            Capability::Generation => "generation",
            Capability::Verification => "verification",
            Capability::Render => "render",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Interactive,
    #[default]
    Batch,
    LongRunning,
}

fn default_cost_units() -> u64 {
    1
}

/// What a tool declares about itself when it joins the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub capability: Capability,
    #[serde(default)]
    pub media_kinds: Vec<MediaKind>,
    #[serde(default)]
    pub source_modes: Vec<SourceMode>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub cost_class: CostClass,
    #[serde(default)]
    pub latency_class: LatencyClass,
    /// Units charged against the tool's budget per call.
    #[serde(default = "default_cost_units")]
    pub cost_units: u64,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, capability: Capability) -> Self {
        Self {
            name: name.into(),
            capability,
            media_kinds: Vec::new(),
            source_modes: Vec::new(),
            input_schema: Value::Null,
            cost_class: CostClass::default(),
            latency_class: LatencyClass::default(),
            cost_units: default_cost_units(),
        }
    }

    pub fn with_media_kinds(mut self, kinds: &[MediaKind]) -> Self {
        self.media_kinds = kinds.to_vec();
        self
    }

    pub fn with_source_modes(mut self, modes: &[SourceMode]) -> Self {
        self.source_modes = modes.to_vec();
        self
    }

    pub fn with_cost(mut self, class: CostClass, units: u64) -> Self {
        self.cost_class = class;
        self.cost_units = units;
        self
    }

    pub fn with_latency(mut self, class: LatencyClass) -> Self {
        self.latency_class = class;
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Whether a generation tool can produce `kind` media in `mode`.
    pub fn handles(&self, mode: SourceMode, kind: MediaKind) -> bool {
        self.capability == Capability::Generation
            && self.source_modes.contains(&mode)
            && self.media_kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    SoftFailure,
    HardFailure,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::SoftFailure => "soft_failure",
            ToolStatus::HardFailure => "hard_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContextRef {
    pub task_id: String,
    #[serde(default)]
    pub caused_by_seq: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub tool_name: String,
    pub payload: Value,
    pub deadline: Duration,
    pub context: TaskContextRef,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub status: ToolStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ToolResponse {
    pub fn success(result: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            result: Some(result),
            error: None,
            retry_after_ms: None,
        }
    }

    pub fn soft(error: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::SoftFailure,
            result: None,
            error: Some(error.into()),
            retry_after_ms: None,
        }
    }

    pub fn hard(error: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::HardFailure,
            result: None,
            error: Some(error.into()),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// A planning, generation, verification or render backend.
///
/// Implementations report failures through [`ToolResponse::status`] rather than
/// panicking or erroring; the invoker owns retries, deadlines and budgets.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn invoke(&self, request: &ToolRequest) -> ToolResponse;
}

/// One attempt against one tool, as recorded in the context log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub input: Value,
    pub attempt: u32,
    pub outcome: ToolStatus,
    pub started_at: DateTime<Utc>,
    pub latency_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolInvocation {
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds(self.latency_ms as i64)
    }
}
