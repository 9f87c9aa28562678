//! Segment planning: turns a task into a validated, ordered script plan and
//! revises it when segments cannot be produced.

mod parse;

pub use parse::PlanDraft;
pub(crate) use parse::{extract_json_block, merge_revision, parse_plan_output};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::error::PlanningError;
use crate::core::tools::{
    Capability, RetryPolicy, TaskContextRef, ToolInvocation, ToolRegistry, invoke_with_retry,
};
use crate::core::types::{Feedback, ScriptPlan, Task, TaskMode};

/// Longest scene the generators are asked to produce.
pub const MAX_SCENE_SECS: f64 = 8.0;

pub struct PlanOutcome {
    pub plan: Result<ScriptPlan, PlanningError>,
    pub invocations: Vec<ToolInvocation>,
}

impl PlanOutcome {
    fn rejected(error: PlanningError) -> Self {
        Self {
            plan: Err(error),
            invocations: Vec::new(),
        }
    }
}

pub struct SegmentPlanner {
    registry: Arc<ToolRegistry>,
    tool_name: String,
    policy: RetryPolicy,
    deadline: Duration,
}

/// Reject requests no planner could work from.
pub fn check_request(task: &Task) -> Result<(), PlanningError> {
    if task.request.is_empty() {
        return Err(PlanningError::EmptyRequest);
    }
    if task.mode == TaskMode::PureEditing && task.request.assets.is_empty() {
        return Err(PlanningError::EmptyMediaLibrary);
    }
    Ok(())
}

impl SegmentPlanner {
    pub fn new(
        registry: Arc<ToolRegistry>,
        tool_name: impl Into<String>,
        policy: RetryPolicy,
        deadline: Duration,
    ) -> Self {
        Self {
            registry,
            tool_name: tool_name.into(),
            policy,
            deadline,
        }
    }

    pub async fn plan(&self, task: &Task, cancel: &CancellationToken) -> PlanOutcome {
        if let Err(e) = check_request(task) {
            return PlanOutcome::rejected(e);
        }
        let payload = json!({
            "prompt": build_planning_prompt(task),
            "mode": task.mode,
            "request": task.request,
            "revision": 0,
        });

        let (draft, invocations) = match self.call(task, payload, cancel).await {
            (Ok(value), invocations) => (parse_plan_output(&value), invocations),
            (Err(e), invocations) => (Err(e), invocations),
        };
        let plan = draft.and_then(|draft| {
            let plan = ScriptPlan {
                task_id: task.id.clone(),
                revision: 0,
                segments: draft.segments,
                overlays: draft.overlays.unwrap_or_default(),
            };
            plan.validate(&task.request.assets)?;
            Ok(plan)
        });

        match &plan {
            Ok(p) => info!(
                "Planned task {}: {} segments, {:.1}s",
                task.id,
                p.segments.len(),
                p.total_duration_secs()
            ),
            Err(e) => warn!("Planning failed for task {}: {}", task.id, e),
        }
        PlanOutcome { plan, invocations }
    }

    pub async fn replan(
        &self,
        task: &Task,
        prior: &ScriptPlan,
        affected: &BTreeSet<u32>,
        feedback: &BTreeMap<u32, Vec<Feedback>>,
        cancel: &CancellationToken,
    ) -> PlanOutcome {
        let payload = json!({
            "prompt": build_replanning_prompt(task, prior, affected, feedback),
            "mode": task.mode,
            "request": task.request,
            "prior_plan": prior,
            "affected": affected,
            "revision": prior.revision + 1,
        });

        let (draft, invocations) = match self.call(task, payload, cancel).await {
            (Ok(value), invocations) => (parse_plan_output(&value), invocations),
            (Err(e), invocations) => (Err(e), invocations),
        };
        let plan = draft.and_then(|draft| {
            let plan = merge_revision(prior, draft)?;
            plan.validate(&task.request.assets)?;
            Ok(plan)
        });

        match &plan {
            Ok(p) => info!(
                "Replanned task {} to revision {} (affected {:?})",
                task.id, p.revision, affected
            ),
            Err(e) => warn!("Replanning failed for task {}: {}", task.id, e),
        }
        PlanOutcome { plan, invocations }
    }

    async fn call(
        &self,
        task: &Task,
        payload: Value,
        cancel: &CancellationToken,
    ) -> (Result<Value, PlanningError>, Vec<ToolInvocation>) {
        let tool = match self.registry.resolve(&self.tool_name, Capability::Planning) {
            Ok(tool) => tool,
            Err(e) => return (Err(PlanningError::Tool(e)), Vec::new()),
        };
        let context = TaskContextRef {
            task_id: task.id.clone(),
            caused_by_seq: None,
        };
        let result = invoke_with_retry(
            &self.registry,
            &tool,
            payload,
            &context,
            self.deadline,
            &self.policy,
            cancel,
        )
        .await;
        (
            result.outcome.map_err(PlanningError::Tool),
            result.invocations,
        )
    }
}

fn plan_schema() -> &'static str {
    "{\n\
       \"segments\": [\n\
         {\n\
           \"ordinal\": 1,\n\
           \"scene\": \"<what the viewer sees and hears>\",\n\
           \"duration_secs\": 6.0,\n\
           \"source_mode\": \"generate | use_existing_asset | edit_existing_asset\",\n\
           \"media_kind\": \"video | image | audio\",\n\
           \"reference_asset\": \"<asset id or null>\",\n\
           \"depends_on\": [],\n\
           \"transition\": {\"kind\": \"cut | fade | dissolve | wipe\", \"duration_secs\": 1.0, \"to\": 2}\n\
         }\n\
       ],\n\
       \"overlays\": {\"subtitles\": [{\"ordinal\": 1, \"text\": \"...\"}], \"music_track\": null}\n\
     }"
}

fn asset_catalog(task: &Task) -> String {
    if task.request.assets.is_empty() {
        return "(none)".to_string();
    }
    task.request
        .assets
        .iter()
        .map(|a| {
            format!(
                "- {} [{}] {}{}",
                a.id,
                a.kind.as_str(),
                a.uri,
                a.description
                    .as_deref()
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn build_planning_prompt(task: &Task) -> String {
    let request = &task.request;
    let mut parts = Vec::new();

    parts.push(format!(
        "Write a shot-by-shot script for a {}s {} video ({}) and output ONLY valid JSON.\n",
        request.video_duration_secs, request.style, request.aspect_ratio
    ));
    parts.push(format!("## Mode: {}\n", task.mode.as_str()));
    parts.push(format!("## Request\n{}\n", request.prompt.trim()));
    parts.push(format!("## Available assets\n{}\n", asset_catalog(task)));
    parts.push(format!("## JSON schema\n{}\n", plan_schema()));

    let mut rules = vec![
        format!("- Each scene lasts at most {MAX_SCENE_SECS} seconds."),
        "- Ordinals start at 1 and increase by one per scene.".to_string(),
        "- Reuse the available assets before generating new footage; reference them by id."
            .to_string(),
        "- Keep characters, lighting and setting continuous between adjacent scenes; use depends_on when a scene must match an earlier one."
            .to_string(),
        "- A transition only ever points at the next ordinal.".to_string(),
    ];
    match task.mode {
        TaskMode::PureEditing => rules.push(
            "- Use only the available assets: every scene is use_existing_asset or edit_existing_asset."
                .to_string(),
        ),
        TaskMode::SemiGenerative => rules.push(
            "- Build around the available assets and generate only what is missing.".to_string(),
        ),
        TaskMode::FullyGenerative => {}
    }
    parts.push(format!("## Rules\n{}\n", rules.join("\n")));

    parts.join("\n")
}

pub(crate) fn build_replanning_prompt(
    task: &Task,
    prior: &ScriptPlan,
    affected: &BTreeSet<u32>,
    feedback: &BTreeMap<u32, Vec<Feedback>>,
) -> String {
    let mut parts = vec![build_planning_prompt(task)];

    parts.push(format!(
        "## Current script (revision {})\n{}\n",
        prior.revision,
        serde_json::to_string_pretty(&prior.segments).unwrap_or_default()
    ));

    let mut notes = Vec::new();
    for ordinal in affected {
        let history = feedback.get(ordinal).map(Vec::as_slice).unwrap_or_default();
        if history.is_empty() {
            notes.push(format!("- Scene {ordinal}: could not be produced."));
        } else {
            for (i, fb) in history.iter().enumerate() {
                notes.push(format!("- Scene {ordinal}, attempt {}: {}", i + 1, fb.summary()));
            }
        }
    }
    parts.push(format!(
        "## Scenes to rewrite: {:?}\n{}\n",
        affected,
        notes.join("\n")
    ));
    parts.push(
        "Return the rewritten scenes (or the full script) in the same JSON schema. \
         Keep the ordinals of scenes you rewrite; untouched scenes may be omitted. \
         To drop a scene entirely, list its ordinal under \"removed\".\n"
            .to_string(),
    );

    parts.join("\n")
}
