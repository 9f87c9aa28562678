//! Append-only, task-scoped log of everything the pipeline decides and produces.
//!
//! The controller is the only writer. Every entry is journaled before it
//! becomes visible in memory, so a crash never leaves an in-memory entry that
//! resume cannot see.

mod journal;
mod replay;

pub use journal::{Journal, SqliteJournal, TaskRecord};
pub use replay::{TaskSnapshot, reconstruct};

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::error::{ReplayError, ToolFailure};
use crate::core::pipeline::PipelineState;
use crate::core::tools::ToolInvocation;
use crate::core::types::{Feedback, FinalVideoRef, TaskStatus, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    TaskCreated,
    StateChanged,
    PlanAccepted,
    ReplanRequested,
    SegmentDispatched,
    ToolInvoked,
    ArtifactProduced,
    ArtifactVerdict,
    SegmentFailed,
    SegmentInvalidated,
    TaskAssembled,
    TaskFailed,
    TaskCanceled,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::TaskCreated => "task_created",
            EntryKind::StateChanged => "state_changed",
            EntryKind::PlanAccepted => "plan_accepted",
            EntryKind::ReplanRequested => "replan_requested",
            EntryKind::SegmentDispatched => "segment_dispatched",
            EntryKind::ToolInvoked => "tool_invoked",
            EntryKind::ArtifactProduced => "artifact_produced",
            EntryKind::ArtifactVerdict => "artifact_verdict",
            EntryKind::SegmentFailed => "segment_failed",
            EntryKind::SegmentInvalidated => "segment_invalidated",
            EntryKind::TaskAssembled => "task_assembled",
            EntryKind::TaskFailed => "task_failed",
            EntryKind::TaskCanceled => "task_canceled",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "task_created" => Some(EntryKind::TaskCreated),
            "state_changed" => Some(EntryKind::StateChanged),
            "plan_accepted" => Some(EntryKind::PlanAccepted),
            "replan_requested" => Some(EntryKind::ReplanRequested),
            "segment_dispatched" => Some(EntryKind::SegmentDispatched),
            "tool_invoked" => Some(EntryKind::ToolInvoked),
            "artifact_produced" => Some(EntryKind::ArtifactProduced),
            "artifact_verdict" => Some(EntryKind::ArtifactVerdict),
            "segment_failed" => Some(EntryKind::SegmentFailed),
            "segment_invalidated" => Some(EntryKind::SegmentInvalidated),
            "task_assembled" => Some(EntryKind::TaskAssembled),
            "task_failed" => Some(EntryKind::TaskFailed),
            "task_canceled" => Some(EntryKind::TaskCanceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub seq: u64,
    pub task_id: String,
    pub kind: EntryKind,
    pub payload: Value,
    /// Hex SHA-256 of the canonical payload JSON.
    pub payload_ref: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub caused_by_seq: Option<u64>,
}

pub fn payload_digest(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

// Payloads of the entry kinds that do not carry a model type directly.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: Option<PipelineState>,
    pub to: PipelineState,
    pub task_status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanRequest {
    pub prior_revision: u32,
    pub affected: BTreeSet<u32>,
    pub replan_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub ordinal: u32,
    pub plan_revision: u32,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    #[serde(default)]
    pub ordinal: Option<u32>,
    #[serde(flatten)]
    pub invocation: ToolInvocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub ordinal: u32,
    pub plan_revision: u32,
    pub attempt: u32,
    pub verdict: Verdict,
    #[serde(default)]
    pub feedback: Option<Feedback>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFailure {
    pub ordinal: u32,
    pub plan_revision: u32,
    pub attempt: u32,
    pub failure: ToolFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invalidation {
    pub ordinal: u32,
    pub plan_revision: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyRecord {
    pub video: FinalVideoRef,
    pub ordinals: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error: String,
    pub blocking: Vec<u32>,
}

pub struct ContextStore {
    task_id: String,
    entries: Vec<ContextEntry>,
    journal: Option<Arc<dyn Journal>>,
}

impl ContextStore {
    pub fn in_memory(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            entries: Vec::new(),
            journal: None,
        }
    }

    pub fn with_journal(task_id: impl Into<String>, journal: Arc<dyn Journal>) -> Self {
        Self {
            task_id: task_id.into(),
            entries: Vec::new(),
            journal: Some(journal),
        }
    }

    /// Reopen a task's log from its journal.
    pub async fn load(task_id: &str, journal: Arc<dyn Journal>) -> Result<Self> {
        let mut entries = journal.load(task_id).await?;
        entries.sort_by_key(|e| e.seq);
        entries.dedup_by_key(|e| e.seq);
        Ok(Self {
            task_id: task_id.to_string(),
            entries,
            journal: Some(journal),
        })
    }

    /// Rebuild a store from raw entries, e.g. an exported log.
    pub fn from_entries(task_id: impl Into<String>, entries: Vec<ContextEntry>) -> Self {
        Self {
            task_id: task_id.into(),
            entries,
            journal: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.seq).max()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn append<T: Serialize>(
        &mut self,
        kind: EntryKind,
        payload: &T,
        caused_by_seq: Option<u64>,
    ) -> Result<u64> {
        let payload = serde_json::to_value(payload)?;
        let seq = self.last_seq().map(|s| s + 1).unwrap_or(1);
        let entry = ContextEntry {
            seq,
            task_id: self.task_id.clone(),
            kind,
            payload_ref: payload_digest(&payload),
            payload,
            timestamp: Utc::now(),
            caused_by_seq,
        };
        if let Some(journal) = &self.journal {
            journal.append(&entry).await?;
        }
        self.entries.push(entry);
        Ok(seq)
    }

    pub fn of_kind(&self, kind: EntryKind) -> impl Iterator<Item = &ContextEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// Every tool attempt, with the ordinal it served when there is one.
    pub fn invocations(&self) -> Vec<InvocationRecord> {
        self.of_kind(EntryKind::ToolInvoked)
            .filter_map(|e| serde_json::from_value(e.payload.clone()).ok())
            .collect()
    }

    pub fn snapshot(&self) -> Result<TaskSnapshot, ReplayError> {
        reconstruct(&self.entries)
    }
}

#[cfg(test)]
mod tests;
