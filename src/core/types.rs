//! Task, plan, segment and artifact model shared by every pipeline stage.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::PlanningError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    FullyGenerative,
    SemiGenerative,
    PureEditing,
}

impl TaskMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskMode::FullyGenerative => "fully_generative",
            TaskMode::SemiGenerative => "semi_generative",
            TaskMode::PureEditing => "pure_editing",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "fully_generative" => Some(TaskMode::FullyGenerative),
            "semi_generative" => Some(TaskMode::SemiGenerative),
            "pure_editing" => Some(TaskMode::PureEditing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    Generating,
    Assembling,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Planning => "planning",
            TaskStatus::Generating => "generating",
            TaskStatus::Assembling => "assembling",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "planning" => Some(TaskStatus::Planning),
            "generating" => Some(TaskStatus::Generating),
            "assembling" => Some(TaskStatus::Assembling),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            "canceled" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl Default for MediaKind {
    fn default() -> Self {
        MediaKind::Video
    }
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }

    /// Whether media of this kind has a playback duration worth checking.
    pub fn is_timed(self) -> bool {
        !matches!(self, MediaKind::Image)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Generate,
    UseExistingAsset,
    EditExistingAsset,
}

impl Default for SourceMode {
    fn default() -> Self {
        SourceMode::Generate
    }
}

impl SourceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceMode::Generate => "generate",
            SourceMode::UseExistingAsset => "use_existing_asset",
            SourceMode::EditExistingAsset => "edit_existing_asset",
        }
    }

    pub fn needs_reference_asset(self) -> bool {
        !matches!(self, SourceMode::Generate)
    }
}

/// A user-provided media item the planner may reuse or edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: String,
    #[serde(default)]
    pub kind: MediaKind,
    pub uri: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_video_duration() -> u32 {
    30
}

fn default_style() -> String {
    "promotional".to_string()
}

fn default_aspect_ratio() -> String {
    "9:16".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub prompt: String,
    /// The media library: assets the user supplied with the request.
    #[serde(default)]
    pub assets: Vec<AssetRef>,
    #[serde(default = "default_video_duration")]
    pub video_duration_secs: u32,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
}

impl Default for TaskRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            assets: Vec::new(),
            video_duration_secs: default_video_duration(),
            style: default_style(),
            aspect_ratio: default_aspect_ratio(),
        }
    }
}

impl TaskRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt.trim().is_empty() && self.assets.is_empty()
    }

    pub fn asset(&self, id: &str) -> Option<&AssetRef> {
        self.assets.iter().find(|a| a.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub mode: TaskMode,
    pub request: TaskRequest,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(mode: TaskMode, request: TaskRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mode,
            request,
            status: TaskStatus::Planning,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Cut,
    #[default]
    Fade,
    Dissolve,
    Wipe,
}

fn default_transition_secs() -> f64 {
    1.0
}

/// Transition from a segment into the segment that follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub kind: TransitionKind,
    #[serde(default = "default_transition_secs")]
    pub duration_secs: f64,
    pub to: u32,
}

impl Transition {
    /// Seconds by which the next shot overlaps this one on the timeline.
    pub fn overlap_secs(&self) -> f64 {
        match self.kind {
            TransitionKind::Cut => 0.0,
            _ => self.duration_secs.max(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub ordinal: u32,
    pub scene: String,
    pub duration_secs: f64,
    #[serde(default)]
    pub source_mode: SourceMode,
    #[serde(default)]
    pub media_kind: MediaKind,
    #[serde(default)]
    pub reference_asset: Option<String>,
    /// Continuity dependencies: ordinals whose accepted artifact must exist
    /// before this segment is generated.
    #[serde(default)]
    pub depends_on: BTreeSet<u32>,
    #[serde(default)]
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtitle {
    pub ordinal: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overlays {
    #[serde(default)]
    pub subtitles: Vec<Subtitle>,
    #[serde(default)]
    pub music_track: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPlan {
    pub task_id: String,
    pub revision: u32,
    pub segments: Vec<SegmentSpec>,
    #[serde(default)]
    pub overlays: Overlays,
}

impl ScriptPlan {
    pub fn ordinals(&self) -> Vec<u32> {
        self.segments.iter().map(|s| s.ordinal).collect()
    }

    pub fn segment(&self, ordinal: u32) -> Option<&SegmentSpec> {
        self.segments.iter().find(|s| s.ordinal == ordinal)
    }

    pub fn total_duration_secs(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_secs).sum()
    }

    /// Check the structural invariants of a plan against the task's media library.
    pub fn validate(&self, assets: &[AssetRef]) -> Result<(), PlanningError> {
        if self.segments.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }

        let mut previous: Option<u32> = None;
        for seg in &self.segments {
            if let Some(prev) = previous
                && seg.ordinal <= prev
            {
                return Err(PlanningError::NonMonotonicOrdinal {
                    previous: prev,
                    ordinal: seg.ordinal,
                });
            }
            previous = Some(seg.ordinal);

            if !(seg.duration_secs > 0.0) {
                return Err(PlanningError::Invalid(format!(
                    "segment {} has a non-positive duration",
                    seg.ordinal
                )));
            }
        }

        let ordinals: BTreeSet<u32> = self.segments.iter().map(|s| s.ordinal).collect();
        for (i, seg) in self.segments.iter().enumerate() {
            for dep in &seg.depends_on {
                if *dep == seg.ordinal || !ordinals.contains(dep) {
                    return Err(PlanningError::DanglingDependency {
                        ordinal: seg.ordinal,
                        dependency: *dep,
                    });
                }
            }

            if let Some(transition) = &seg.transition {
                let next = self.segments.get(i + 1).map(|s| s.ordinal);
                if next != Some(transition.to) {
                    return Err(PlanningError::NonAdjacentTransition {
                        ordinal: seg.ordinal,
                        to: transition.to,
                    });
                }
            }

            match &seg.reference_asset {
                Some(asset) if !assets.iter().any(|a| &a.id == asset) => {
                    return Err(PlanningError::UnknownAsset {
                        ordinal: seg.ordinal,
                        asset: asset.clone(),
                    });
                }
                None if seg.source_mode.needs_reference_asset() => {
                    return Err(PlanningError::MissingReferenceAsset {
                        ordinal: seg.ordinal,
                        mode: seg.source_mode.as_str().to_string(),
                    });
                }
                _ => {}
            }
        }

        for subtitle in &self.overlays.subtitles {
            if !ordinals.contains(&subtitle.ordinal) {
                return Err(PlanningError::Invalid(format!(
                    "subtitle references unknown ordinal {}",
                    subtitle.ordinal
                )));
            }
        }

        if let Some(ordinal) = self.find_cycle() {
            return Err(PlanningError::DependencyCycle { ordinal });
        }

        Ok(())
    }

    /// Kahn's algorithm over continuity edges; returns an ordinal stuck in a cycle.
    fn find_cycle(&self) -> Option<u32> {
        let mut indegree: BTreeMap<u32, usize> = self
            .segments
            .iter()
            .map(|s| (s.ordinal, s.depends_on.len()))
            .collect();
        let mut queue: VecDeque<u32> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(o, _)| *o)
            .collect();

        while let Some(done) = queue.pop_front() {
            for seg in &self.segments {
                if seg.depends_on.contains(&done)
                    && let Some(d) = indegree.get_mut(&seg.ordinal)
                {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(seg.ordinal);
                    }
                }
            }
        }

        indegree.into_iter().find(|(_, d)| *d > 0).map(|(o, _)| o)
    }

    /// Every segment that transitively depends on one of `roots`, excluding
    /// the roots themselves unless one root depends on another.
    pub fn transitive_dependents(&self, roots: &BTreeSet<u32>) -> BTreeSet<u32> {
        let mut out = BTreeSet::new();
        let mut frontier: Vec<u32> = roots.iter().copied().collect();
        while let Some(current) = frontier.pop() {
            for seg in &self.segments {
                if seg.depends_on.contains(&current) && out.insert(seg.ordinal) {
                    frontier.push(seg.ordinal);
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pending,
    Accepted,
    Rejected,
}

/// One verifier's objection to a candidate artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub tool: String,
    pub reason: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub rejections: Vec<Rejection>,
}

impl Feedback {
    pub fn is_empty(&self) -> bool {
        self.rejections.is_empty()
    }

    pub fn push(&mut self, rejection: Rejection) {
        self.rejections.push(rejection);
    }

    pub fn summary(&self) -> String {
        self.rejections
            .iter()
            .map(|r| format!("[{}] {}", r.tool, r.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub segment_ordinal: u32,
    pub plan_revision: u32,
    pub attempt: u32,
    /// Opaque handle to the produced media (URI, storage key, ...).
    pub content_ref: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub verdict: Verdict,
    #[serde(default)]
    pub feedback: Option<Feedback>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalVideoRef {
    pub uri: String,
    pub duration_secs: f64,
    pub plan_revision: u32,
    pub manifest_digest: String,
}
