use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::pipeline::PipelineState;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanningError {
    #[error("task request is empty: a prompt or at least one asset is required")]
    EmptyRequest,
    #[error("pure editing task has an empty media library")]
    EmptyMediaLibrary,
    #[error("plan has no segments")]
    EmptyPlan,
    #[error("ordinal {ordinal} does not follow {previous}; ordinals must be unique and increasing")]
    NonMonotonicOrdinal { previous: u32, ordinal: u32 },
    #[error("segment {ordinal} depends on unknown ordinal {dependency}")]
    DanglingDependency { ordinal: u32, dependency: u32 },
    #[error("segment {ordinal} is part of a dependency cycle")]
    DependencyCycle { ordinal: u32 },
    #[error("segment {ordinal} transitions to {to}, which is not the next ordinal")]
    NonAdjacentTransition { ordinal: u32, to: u32 },
    #[error("segment {ordinal} references unknown asset '{asset}'")]
    UnknownAsset { ordinal: u32, asset: String },
    #[error("segment {ordinal} needs a reference asset for source mode {mode}")]
    MissingReferenceAsset { ordinal: u32, mode: String },
    #[error("invalid plan: {0}")]
    Invalid(String),
    #[error("planner output could not be parsed: {0}")]
    Unparseable(String),
    #[error("planning tool failed: {0}")]
    Tool(ToolFailure),
}

/// A tool failure surfaced past the retry loop.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolFailure {
    #[error("tool '{tool}' kept failing after {attempts} attempts: {detail}")]
    SoftExhausted {
        tool: String,
        attempts: u32,
        detail: String,
    },
    #[error("tool '{tool}' failed: {detail}")]
    Hard { tool: String, detail: String },
    #[error("no tool available for {what}")]
    Unavailable { what: String },
    #[error("budget for tool '{tool}' exhausted: {detail}")]
    BudgetExhausted { tool: String, detail: String },
    #[error("canceled")]
    Canceled,
}

impl ToolFailure {
    pub fn hard(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        ToolFailure::Hard {
            tool: tool.into(),
            detail: detail.into(),
        }
    }

    pub fn tool(&self) -> Option<&str> {
        match self {
            ToolFailure::SoftExhausted { tool, .. }
            | ToolFailure::Hard { tool, .. }
            | ToolFailure::BudgetExhausted { tool, .. } => Some(tool),
            ToolFailure::Unavailable { .. } | ToolFailure::Canceled => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ToolFailure::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssemblyError {
    #[error("no accepted artifact for ordinals {0:?}")]
    MissingSegments(Vec<u32>),
    #[error("artifact for ordinal {0} is not part of the plan")]
    UnknownSegment(u32),
    #[error("more than one artifact for ordinal {0}")]
    DuplicateSegment(u32),
    #[error("render tool returned no output uri")]
    MissingOutput,
    #[error("render failed: {0}")]
    Render(ToolFailure),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    #[error("entry {seq} belongs to task {found}, expected {expected}")]
    ForeignEntry {
        seq: u64,
        expected: String,
        found: String,
    },
    #[error("entry {seq} ({kind}) has an unreadable payload: {reason}")]
    Payload {
        seq: u64,
        kind: String,
        reason: String,
    },
    #[error("entry {seq} accepts a second artifact for ordinal {ordinal}")]
    DuplicateAcceptance { seq: u64, ordinal: u32 },
    #[error("entry {seq} gives a verdict for an unknown artifact (ordinal {ordinal}, attempt {attempt})")]
    UnknownArtifact { seq: u64, ordinal: u32, attempt: u32 },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("illegal state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("context log has no task to resume")]
    NothingToResume,
    #[error("context journal error: {0}")]
    Journal(#[from] anyhow::Error),
}
