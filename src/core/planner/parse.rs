use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;

use crate::core::error::PlanningError;
use crate::core::types::{Overlays, ScriptPlan, SegmentSpec};

/// What a planning tool proposed, before it becomes a revision.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlanDraft {
    pub segments: Vec<SegmentSpec>,
    #[serde(default)]
    pub overlays: Option<Overlays>,
    /// Prior ordinals the revision drops from the script.
    #[serde(default)]
    pub removed: BTreeSet<u32>,
}

/// Extract a JSON block from model output. Tries fenced ```json ... ``` first,
/// then raw JSON starting with `{` or `[`.
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed);
    }
    None
}

/// Read a planning tool result. Accepts a plan object, a bare segment array,
/// or text (top level or under `text`/`output`) that contains either.
pub(crate) fn parse_plan_output(output: &Value) -> Result<PlanDraft, PlanningError> {
    match output {
        Value::Object(map) if map.contains_key("segments") => {
            serde_json::from_value(output.clone())
                .map_err(|e| PlanningError::Unparseable(e.to_string()))
        }
        Value::Object(map) => {
            let text = map
                .get("text")
                .or_else(|| map.get("output"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    PlanningError::Unparseable("result carries no segments or text".into())
                })?;
            parse_plan_text(text)
        }
        Value::Array(_) => {
            let segments: Vec<SegmentSpec> = serde_json::from_value(output.clone())
                .map_err(|e| PlanningError::Unparseable(e.to_string()))?;
            Ok(PlanDraft {
                segments,
                overlays: None,
                removed: BTreeSet::new(),
            })
        }
        Value::String(text) => parse_plan_text(text),
        _ => Err(PlanningError::Unparseable(
            "result is neither JSON nor text".into(),
        )),
    }
}

fn parse_plan_text(text: &str) -> Result<PlanDraft, PlanningError> {
    let block = extract_json_block(text)
        .ok_or_else(|| PlanningError::Unparseable("no JSON block in planner text".into()))?;
    let value: Value =
        serde_json::from_str(block).map_err(|e| PlanningError::Unparseable(e.to_string()))?;
    if value.is_string() {
        return Err(PlanningError::Unparseable("nested text is not a plan".into()));
    }
    parse_plan_output(&value)
}

/// Drafted ordinals must be unique and increasing, same as in a full plan.
fn check_draft_order(draft: &PlanDraft) -> Result<(), PlanningError> {
    for pair in draft.segments.windows(2) {
        if pair[1].ordinal <= pair[0].ordinal {
            return Err(PlanningError::NonMonotonicOrdinal {
                previous: pair[0].ordinal,
                ordinal: pair[1].ordinal,
            });
        }
    }
    Ok(())
}

/// Merge a replanning draft into the prior revision: drafted segments replace
/// prior ones by ordinal, `removed` ordinals are dropped, and unmentioned prior
/// segments are kept.
pub(crate) fn merge_revision(
    prior: &ScriptPlan,
    draft: PlanDraft,
) -> Result<ScriptPlan, PlanningError> {
    check_draft_order(&draft)?;
    for ordinal in &draft.removed {
        if prior.segment(*ordinal).is_none() {
            return Err(PlanningError::Invalid(format!(
                "cannot remove segment {ordinal}: not in revision {}",
                prior.revision
            )));
        }
        if draft.segments.iter().any(|s| s.ordinal == *ordinal) {
            return Err(PlanningError::Invalid(format!(
                "segment {ordinal} is both rewritten and removed"
            )));
        }
    }

    let mut by_ordinal: BTreeMap<u32, SegmentSpec> = prior
        .segments
        .iter()
        .filter(|s| !draft.removed.contains(&s.ordinal))
        .map(|s| (s.ordinal, s.clone()))
        .collect();
    for seg in draft.segments {
        by_ordinal.insert(seg.ordinal, seg);
    }
    Ok(ScriptPlan {
        task_id: prior.task_id.clone(),
        revision: prior.revision + 1,
        segments: by_ordinal.into_values().collect(),
        overlays: draft.overlays.unwrap_or_else(|| prior.overlays.clone()),
    })
}
