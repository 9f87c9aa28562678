//! Final assembly: orders accepted artifacts by ordinal, lays them out on a
//! timeline and asks the render tool for the finished video exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::OutputSettings;
use crate::core::error::AssemblyError;
use crate::core::tools::{
    Capability, RetryPolicy, TaskContextRef, ToolInvocation, ToolRegistry, invoke_with_retry,
};
use crate::core::types::{Artifact, FinalVideoRef, MediaKind, ScriptPlan, Transition};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    pub ordinal: u32,
    pub content_ref: String,
    pub media_kind: MediaKind,
    pub start_in_clip: f64,
    pub duration_secs: f64,
    pub timeline_in: f64,
    pub timeline_out: f64,
    pub transition_to_next: Option<Transition>,
    pub subtitle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyManifest {
    pub task_id: String,
    pub plan_revision: u32,
    pub shots: Vec<Shot>,
    pub music_track: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub aspect_ratio: String,
    pub total_duration_secs: f64,
}

impl AssemblyManifest {
    pub fn ordinals(&self) -> Vec<u32> {
        self.shots.iter().map(|s| s.ordinal).collect()
    }

    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Lay out one accepted artifact per plan ordinal, in ascending ordinal order.
///
/// A transition into the next shot overlaps the two clips by its duration,
/// clamped to the shorter clip; cuts do not overlap.
pub fn build_manifest(
    accepted: &[Artifact],
    plan: &ScriptPlan,
    output: &OutputSettings,
    aspect_ratio: &str,
) -> Result<AssemblyManifest, AssemblyError> {
    let mut by_ordinal: BTreeMap<u32, &Artifact> = BTreeMap::new();
    for artifact in accepted {
        if plan.segment(artifact.segment_ordinal).is_none() {
            return Err(AssemblyError::UnknownSegment(artifact.segment_ordinal));
        }
        if by_ordinal.insert(artifact.segment_ordinal, artifact).is_some() {
            return Err(AssemblyError::DuplicateSegment(artifact.segment_ordinal));
        }
    }
    let missing: Vec<u32> = plan
        .ordinals()
        .into_iter()
        .filter(|o| !by_ordinal.contains_key(o))
        .collect();
    if !missing.is_empty() {
        return Err(AssemblyError::MissingSegments(missing));
    }

    let subtitles: BTreeMap<u32, &str> = plan
        .overlays
        .subtitles
        .iter()
        .map(|s| (s.ordinal, s.text.as_str()))
        .collect();

    let mut shots: Vec<Shot> = Vec::with_capacity(by_ordinal.len());
    for (ordinal, artifact) in by_ordinal {
        let Some(spec) = plan.segment(ordinal) else {
            return Err(AssemblyError::UnknownSegment(ordinal));
        };
        let timeline_in = match shots.last() {
            Some(prev) => {
                let overlap = prev
                    .transition_to_next
                    .as_ref()
                    .map(|t| t.overlap_secs().min(prev.duration_secs).min(spec.duration_secs))
                    .unwrap_or(0.0);
                prev.timeline_out - overlap
            }
            None => 0.0,
        };
        shots.push(Shot {
            ordinal,
            content_ref: artifact.content_ref.clone(),
            media_kind: spec.media_kind,
            start_in_clip: 0.0,
            duration_secs: spec.duration_secs,
            timeline_in,
            timeline_out: timeline_in + spec.duration_secs,
            transition_to_next: spec.transition.clone(),
            subtitle: subtitles.get(&ordinal).map(|s| s.to_string()),
        });
    }

    let total_duration_secs = shots.last().map(|s| s.timeline_out).unwrap_or(0.0);
    Ok(AssemblyManifest {
        task_id: plan.task_id.clone(),
        plan_revision: plan.revision,
        shots,
        music_track: plan.overlays.music_track.clone(),
        width: output.width,
        height: output.height,
        fps: output.fps,
        aspect_ratio: aspect_ratio.to_string(),
        total_duration_secs,
    })
}

pub struct AssemblyOutcome {
    pub result: Result<FinalVideoRef, AssemblyError>,
    pub manifest: Option<AssemblyManifest>,
    pub invocations: Vec<ToolInvocation>,
}

pub struct Assembler {
    registry: Arc<ToolRegistry>,
    tool_name: String,
    output: OutputSettings,
    deadline: Duration,
}

impl Assembler {
    pub fn new(
        registry: Arc<ToolRegistry>,
        tool_name: impl Into<String>,
        output: OutputSettings,
        deadline: Duration,
    ) -> Self {
        Self {
            registry,
            tool_name: tool_name.into(),
            output,
            deadline,
        }
    }

    pub async fn assemble(
        &self,
        accepted: &[Artifact],
        plan: &ScriptPlan,
        aspect_ratio: &str,
        context: &TaskContextRef,
        cancel: &CancellationToken,
    ) -> AssemblyOutcome {
        let manifest = match build_manifest(accepted, plan, &self.output, aspect_ratio) {
            Ok(m) => m,
            Err(e) => {
                return AssemblyOutcome {
                    result: Err(e),
                    manifest: None,
                    invocations: Vec::new(),
                };
            }
        };
        let tool = match self.registry.resolve(&self.tool_name, Capability::Render) {
            Ok(tool) => tool,
            Err(e) => {
                return AssemblyOutcome {
                    result: Err(AssemblyError::Render(e)),
                    manifest: Some(manifest),
                    invocations: Vec::new(),
                };
            }
        };

        info!(
            "Rendering task {} revision {}: shots {:?}, {:.1}s",
            manifest.task_id,
            manifest.plan_revision,
            manifest.ordinals(),
            manifest.total_duration_secs
        );
        let payload = serde_json::to_value(&manifest).unwrap_or(Value::Null);
        let result = invoke_with_retry(
            &self.registry,
            &tool,
            payload,
            context,
            self.deadline,
            &RetryPolicy::no_retry(),
            cancel,
        )
        .await;

        let video = result
            .outcome
            .map_err(AssemblyError::Render)
            .and_then(|value| {
                let uri = value
                    .get("uri")
                    .and_then(Value::as_str)
                    .filter(|u| !u.is_empty())
                    .ok_or(AssemblyError::MissingOutput)?;
                Ok(FinalVideoRef {
                    uri: uri.to_string(),
                    duration_secs: value
                        .get("duration_secs")
                        .and_then(Value::as_f64)
                        .unwrap_or(manifest.total_duration_secs),
                    plan_revision: manifest.plan_revision,
                    manifest_digest: manifest.digest(),
                })
            });

        AssemblyOutcome {
            result: video,
            manifest: Some(manifest),
            invocations: result.invocations,
        }
    }
}
