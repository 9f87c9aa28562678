//! Segment generation: picks a generation tool for each segment, builds its
//! prompt from continuity and prior feedback, and turns tool output into a
//! pending artifact.

mod pool;

pub use pool::{SegmentJob, WorkerEvent, WorkerPool};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::error::ToolFailure;
use crate::core::tools::{RetryPolicy, TaskContextRef, ToolInvocation, ToolRegistry, invoke_with_retry};
use crate::core::types::{
    AssetRef, Artifact, Feedback, MediaKind, SegmentSpec, SourceMode, Verdict,
};

/// Everything a generation attempt knows beyond the segment itself.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationContext {
    pub task_id: String,
    pub plan_revision: u32,
    pub attempt: u32,
    pub style: String,
    pub aspect_ratio: String,
    /// Accepted `content_ref` of each continuity dependency.
    pub continuity: BTreeMap<u32, String>,
    pub reference_asset: Option<AssetRef>,
    pub feedback: Vec<Feedback>,
    pub caused_by_seq: Option<u64>,
}

impl GenerationContext {
    pub fn task_context(&self) -> TaskContextRef {
        TaskContextRef {
            task_id: self.task_id.clone(),
            caused_by_seq: self.caused_by_seq,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub artifact: Result<Artifact, ToolFailure>,
    pub invocations: Vec<ToolInvocation>,
}

pub struct GenerationExecutor {
    registry: Arc<ToolRegistry>,
    pins: HashMap<String, String>,
    policy: RetryPolicy,
    deadline: Duration,
}

impl GenerationExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        pins: HashMap<String, String>,
        policy: RetryPolicy,
        deadline: Duration,
    ) -> Self {
        Self {
            registry,
            pins,
            policy,
            deadline,
        }
    }

    fn pinned(&self, mode: SourceMode, kind: MediaKind) -> Option<&str> {
        self.pins
            .get(&format!("{}:{}", mode.as_str(), kind.as_str()))
            .map(String::as_str)
    }

    pub async fn generate(
        &self,
        spec: &SegmentSpec,
        ctx: &GenerationContext,
        cancel: &CancellationToken,
    ) -> GenerationOutcome {
        let pinned = self.pinned(spec.source_mode, spec.media_kind);
        let Some(tool) = self
            .registry
            .find_generator(spec.source_mode, spec.media_kind, pinned)
        else {
            if spec.source_mode == SourceMode::UseExistingAsset
                && let Some(asset) = &ctx.reference_asset
            {
                debug!(
                    "Segment {} reuses asset {} as-is",
                    spec.ordinal, asset.id
                );
                return GenerationOutcome {
                    artifact: Ok(passthrough_artifact(spec, ctx, asset)),
                    invocations: Vec::new(),
                };
            }
            return GenerationOutcome {
                artifact: Err(ToolFailure::Unavailable {
                    what: format!(
                        "{} {} generation",
                        spec.source_mode.as_str(),
                        spec.media_kind.as_str()
                    ),
                }),
                invocations: Vec::new(),
            };
        };

        let name = tool.descriptor().name.clone();
        info!(
            "Generating segment {} (revision {}, attempt {}) with {}",
            spec.ordinal, ctx.plan_revision, ctx.attempt, name
        );
        let payload = json!({
            "prompt": build_segment_prompt(spec, ctx),
            "segment": spec,
            "style": ctx.style,
            "aspect_ratio": ctx.aspect_ratio,
            "continuity": ctx.continuity,
            "reference_asset": ctx.reference_asset,
            "attempt": ctx.attempt,
        });

        let result = invoke_with_retry(
            &self.registry,
            &tool,
            payload,
            &ctx.task_context(),
            self.deadline,
            &self.policy,
            cancel,
        )
        .await;

        let artifact = result
            .outcome
            .and_then(|value| artifact_from_result(spec, ctx, &name, value));
        GenerationOutcome {
            artifact,
            invocations: result.invocations,
        }
    }
}

fn passthrough_artifact(spec: &SegmentSpec, ctx: &GenerationContext, asset: &AssetRef) -> Artifact {
    Artifact {
        segment_ordinal: spec.ordinal,
        plan_revision: ctx.plan_revision,
        attempt: ctx.attempt,
        content_ref: asset.uri.clone(),
        metadata: json!({"source_asset": asset.id}),
        verdict: Verdict::Pending,
        feedback: None,
    }
}

/// A success without a `content_ref` is a malformed response, not a retryable one.
pub(crate) fn artifact_from_result(
    spec: &SegmentSpec,
    ctx: &GenerationContext,
    tool: &str,
    value: Value,
) -> Result<Artifact, ToolFailure> {
    let content_ref = value
        .get("content_ref")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolFailure::hard(tool, "response has no content_ref"))?
        .to_string();
    let metadata = value.get("metadata").cloned().unwrap_or(Value::Null);
    Ok(Artifact {
        segment_ordinal: spec.ordinal,
        plan_revision: ctx.plan_revision,
        attempt: ctx.attempt,
        content_ref,
        metadata,
        verdict: Verdict::Pending,
        feedback: None,
    })
}

pub(crate) fn build_segment_prompt(spec: &SegmentSpec, ctx: &GenerationContext) -> String {
    let mut parts = Vec::new();

    parts.push(format!(
        "# Scene {} ({:.1}s, {}, {})\n{}\n",
        spec.ordinal,
        spec.duration_secs,
        spec.media_kind.as_str(),
        ctx.aspect_ratio,
        spec.scene.trim()
    ));
    parts.push(format!("## Style: {}\n", ctx.style));

    match (&ctx.reference_asset, spec.source_mode) {
        (Some(asset), SourceMode::EditExistingAsset) => {
            parts.push(format!("## Edit this asset\n{} ({})\n", asset.id, asset.uri));
        }
        (Some(asset), _) => {
            parts.push(format!("## Reference asset\n{} ({})\n", asset.id, asset.uri));
        }
        (None, _) => {}
    }

    if !ctx.continuity.is_empty() {
        parts.push(format!(
            "## Continuity\nMatch characters, lighting and setting of:\n{}\n",
            ctx.continuity
                .iter()
                .map(|(ordinal, content)| format!("- scene {ordinal}: {content}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if !ctx.feedback.is_empty() {
        parts.push(format!(
            "## Previous attempts were rejected\n{}\n",
            ctx.feedback
                .iter()
                .enumerate()
                .map(|(i, fb)| format!("- attempt {}: {}", i + 1, fb.summary()))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    parts.join("\n")
}
