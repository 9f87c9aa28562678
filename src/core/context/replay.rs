use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use super::{
    AssemblyRecord, ContextEntry, EntryKind, FailureRecord, Invalidation, ReplanRequest,
    SegmentFailure, StateChange, VerdictRecord,
};
use crate::core::error::{ReplayError, ToolFailure};
use crate::core::pipeline::PipelineState;
use crate::core::types::{Artifact, Feedback, FinalVideoRef, ScriptPlan, Task, Verdict};

/// State of a task as recorded in its context log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSnapshot {
    pub task: Option<Task>,
    pub state: Option<PipelineState>,
    pub plan: Option<ScriptPlan>,
    pub revisions: Vec<u32>,
    /// Every attempt per ordinal, in production order.
    pub artifacts: BTreeMap<u32, Vec<Artifact>>,
    pub accepted: BTreeMap<u32, Artifact>,
    pub failures: BTreeMap<u32, SegmentFailure>,
    pub replans: u32,
    pub final_video: Option<FinalVideoRef>,
    pub assembled_ordinals: Vec<u32>,
    pub failure: Option<FailureRecord>,
    pub last_seq: Option<u64>,
}

/// Replay entries in `seq` order. Entries at or below an already applied
/// `seq` are skipped, so duplicated or re-fed logs converge to the same state.
pub fn reconstruct(entries: &[ContextEntry]) -> Result<TaskSnapshot, ReplayError> {
    let mut ordered: Vec<&ContextEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.seq);
    let mut snapshot = TaskSnapshot::default();
    for entry in ordered {
        snapshot.apply(entry)?;
    }
    Ok(snapshot)
}

fn decode<T: DeserializeOwned>(entry: &ContextEntry) -> Result<T, ReplayError> {
    serde_json::from_value(entry.payload.clone()).map_err(|e| ReplayError::Payload {
        seq: entry.seq,
        kind: entry.kind.as_str().to_string(),
        reason: e.to_string(),
    })
}

impl TaskSnapshot {
    pub fn apply(&mut self, entry: &ContextEntry) -> Result<(), ReplayError> {
        if let Some(last) = self.last_seq
            && entry.seq <= last
        {
            return Ok(());
        }
        if let Some(task) = &self.task
            && task.id != entry.task_id
        {
            return Err(ReplayError::ForeignEntry {
                seq: entry.seq,
                expected: task.id.clone(),
                found: entry.task_id.clone(),
            });
        }

        match entry.kind {
            EntryKind::TaskCreated => {
                self.task = Some(decode(entry)?);
            }
            EntryKind::StateChanged => {
                let change: StateChange = decode(entry)?;
                self.state = Some(change.to);
                if let Some(task) = &mut self.task {
                    task.status = change.task_status;
                }
            }
            EntryKind::PlanAccepted => {
                let plan: ScriptPlan = decode(entry)?;
                self.revisions.push(plan.revision);
                self.plan = Some(plan);
            }
            EntryKind::ReplanRequested => {
                let request: ReplanRequest = decode(entry)?;
                self.replans = self.replans.max(request.replan_number);
            }
            EntryKind::ArtifactProduced => {
                let artifact: Artifact = decode(entry)?;
                self.artifacts
                    .entry(artifact.segment_ordinal)
                    .or_default()
                    .push(artifact);
            }
            EntryKind::ArtifactVerdict => {
                let record: VerdictRecord = decode(entry)?;
                let artifact = self
                    .artifacts
                    .get_mut(&record.ordinal)
                    .and_then(|list| {
                        list.iter_mut().find(|a| {
                            a.plan_revision == record.plan_revision && a.attempt == record.attempt
                        })
                    })
                    .ok_or(ReplayError::UnknownArtifact {
                        seq: entry.seq,
                        ordinal: record.ordinal,
                        attempt: record.attempt,
                    })?;
                artifact.verdict = record.verdict;
                artifact.feedback = record.feedback;
                if record.verdict == Verdict::Accepted {
                    if self.accepted.contains_key(&record.ordinal) {
                        return Err(ReplayError::DuplicateAcceptance {
                            seq: entry.seq,
                            ordinal: record.ordinal,
                        });
                    }
                    self.accepted.insert(record.ordinal, artifact.clone());
                    self.failures.remove(&record.ordinal);
                }
            }
            EntryKind::SegmentFailed => {
                let failure: SegmentFailure = decode(entry)?;
                self.failures.insert(failure.ordinal, failure);
            }
            EntryKind::SegmentInvalidated => {
                let invalidation: Invalidation = decode(entry)?;
                self.accepted.remove(&invalidation.ordinal);
            }
            EntryKind::TaskAssembled => {
                let record: AssemblyRecord = decode(entry)?;
                self.assembled_ordinals = record.ordinals;
                self.final_video = Some(record.video);
            }
            EntryKind::TaskFailed => {
                self.failure = Some(decode(entry)?);
            }
            EntryKind::TaskCanceled | EntryKind::SegmentDispatched | EntryKind::ToolInvoked => {}
        }

        self.last_seq = Some(entry.seq);
        Ok(())
    }

    pub fn latest_artifact(&self, ordinal: u32) -> Option<&Artifact> {
        self.artifacts.get(&ordinal).and_then(|list| list.last())
    }

    /// Artifacts produced for `ordinal` under plan `revision`.
    pub fn attempts_in_revision(&self, ordinal: u32, revision: u32) -> u32 {
        self.artifacts
            .get(&ordinal)
            .map(|list| list.iter().filter(|a| a.plan_revision == revision).count() as u32)
            .unwrap_or(0)
    }

    /// Rejection feedback gathered for `ordinal` across all revisions.
    pub fn feedback_for(&self, ordinal: u32) -> Vec<Feedback> {
        self.artifacts
            .get(&ordinal)
            .map(|list| {
                list.iter()
                    .filter(|a| a.verdict == Verdict::Rejected)
                    .filter_map(|a| a.feedback.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The surfaced tool failure for `ordinal` under plan `revision`, if any.
    pub fn failure_in_revision(&self, ordinal: u32, revision: u32) -> Option<&ToolFailure> {
        self.failures
            .get(&ordinal)
            .filter(|f| f.plan_revision == revision)
            .map(|f| &f.failure)
    }
}
