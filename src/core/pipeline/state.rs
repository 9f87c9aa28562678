use crate::core::types::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Planning,
    Generating,
    Reviewing,
    Replanning,
    Assembling,
    Done,
    Failed,
    Canceled,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Planning => "planning",
            PipelineState::Generating => "generating",
            PipelineState::Reviewing => "reviewing",
            PipelineState::Replanning => "replanning",
            PipelineState::Assembling => "assembling",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
            PipelineState::Canceled => "canceled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "planning" => Some(PipelineState::Planning),
            "generating" => Some(PipelineState::Generating),
            "reviewing" => Some(PipelineState::Reviewing),
            "replanning" => Some(PipelineState::Replanning),
            "assembling" => Some(PipelineState::Assembling),
            "done" => Some(PipelineState::Done),
            "failed" => Some(PipelineState::Failed),
            "canceled" => Some(PipelineState::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Failed | PipelineState::Canceled
        )
    }

    /// Coarse task status exposed to callers.
    pub fn task_status(self) -> TaskStatus {
        match self {
            PipelineState::Planning | PipelineState::Replanning => TaskStatus::Planning,
            PipelineState::Generating | PipelineState::Reviewing => TaskStatus::Generating,
            PipelineState::Assembling => TaskStatus::Assembling,
            PipelineState::Done => TaskStatus::Done,
            PipelineState::Failed => TaskStatus::Failed,
            PipelineState::Canceled => TaskStatus::Canceled,
        }
    }
}

pub fn can_transition(from: PipelineState, to: PipelineState) -> bool {
    if from == to {
        return true;
    }
    if to == PipelineState::Failed || to == PipelineState::Canceled {
        return !from.is_terminal();
    }
    match from {
        PipelineState::Planning => matches!(to, PipelineState::Generating),
        PipelineState::Generating => {
            matches!(to, PipelineState::Reviewing | PipelineState::Replanning)
        }
        PipelineState::Reviewing => matches!(
            to,
            PipelineState::Generating | PipelineState::Replanning | PipelineState::Assembling
        ),
        PipelineState::Replanning => matches!(to, PipelineState::Generating),
        PipelineState::Assembling => matches!(to, PipelineState::Done),
        PipelineState::Done | PipelineState::Failed | PipelineState::Canceled => false,
    }
}

/// Where one segment stands inside the current plan revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Waiting,
    Generating,
    Reviewing,
    Accepted,
    Exhausted,
    Failed,
}
