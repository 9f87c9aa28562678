use std::fmt;

use serde::Serialize;

use super::PipelineState;
use crate::core::types::{FinalVideoRef, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentOutcome {
    Accepted,
    ExhaustedRetries,
    Failed,
    NeverAttempted,
    Pending,
}

impl SegmentOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentOutcome::Accepted => "accepted",
            SegmentOutcome::ExhaustedRetries => "exhausted_retries",
            SegmentOutcome::Failed => "failed",
            SegmentOutcome::NeverAttempted => "never_attempted",
            SegmentOutcome::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentReport {
    pub ordinal: u32,
    pub outcome: SegmentOutcome,
    /// Generation attempts across every plan revision.
    pub attempts: u32,
    pub detail: Option<String>,
}

/// What a caller learns about a task once the controller stops driving it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub state: PipelineState,
    pub plan_revision: Option<u32>,
    pub replans: u32,
    pub segments: Vec<SegmentReport>,
    pub blocking: Vec<u32>,
    pub final_video: Option<FinalVideoRef>,
    pub error: Option<String>,
}

impl TaskReport {
    pub fn segment(&self, ordinal: u32) -> Option<&SegmentReport> {
        self.segments.iter().find(|s| s.ordinal == ordinal)
    }

    pub fn is_done(&self) -> bool {
        self.state == PipelineState::Done
    }
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "task {}: {}", self.task_id, self.state.as_str())?;
        match self.plan_revision {
            Some(rev) => writeln!(f, "plan revision {} after {} replans", rev, self.replans)?,
            None => writeln!(f, "no accepted plan")?,
        }
        if !self.segments.is_empty() {
            writeln!(f, "{:>7}  {:<18} {:>8}  detail", "ordinal", "outcome", "attempts")?;
            for seg in &self.segments {
                writeln!(
                    f,
                    "{:>7}  {:<18} {:>8}  {}",
                    seg.ordinal,
                    seg.outcome.as_str(),
                    seg.attempts,
                    seg.detail.as_deref().unwrap_or("")
                )?;
            }
        }
        if !self.blocking.is_empty() {
            writeln!(f, "blocking ordinals: {:?}", self.blocking)?;
        }
        if let Some(video) = &self.final_video {
            writeln!(f, "output: {} ({:.1}s)", video.uri, video.duration_secs)?;
        }
        if let Some(error) = &self.error {
            writeln!(f, "error: {}", error)?;
        }
        Ok(())
    }
}
