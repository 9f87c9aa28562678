use std::collections::BTreeSet;

use serde_json::json;

use crate::core::context::{
    ContextStore, Dispatch, EntryKind, Invalidation, ReplanRequest, SegmentFailure, StateChange,
    VerdictRecord, payload_digest, reconstruct,
};
use crate::core::error::{ReplayError, ToolFailure};
use crate::core::pipeline::PipelineState;
use crate::core::types::{
    Artifact, Feedback, Rejection, ScriptPlan, SegmentSpec, Task, TaskMode, TaskRequest,
    TaskStatus, Verdict,
};

fn make_task() -> Task {
    Task::new(
        TaskMode::FullyGenerative,
        TaskRequest::from_prompt("a lighthouse at dawn"),
    )
}

fn make_plan(task_id: &str, revision: u32, ordinals: &[u32]) -> ScriptPlan {
    ScriptPlan {
        task_id: task_id.to_string(),
        revision,
        segments: ordinals
            .iter()
            .map(|o| SegmentSpec {
                ordinal: *o,
                scene: format!("scene {o}"),
                duration_secs: 5.0,
                source_mode: Default::default(),
                media_kind: Default::default(),
                reference_asset: None,
                depends_on: BTreeSet::new(),
                transition: None,
            })
            .collect(),
        overlays: Default::default(),
    }
}

fn make_artifact(ordinal: u32, revision: u32, attempt: u32) -> Artifact {
    Artifact {
        segment_ordinal: ordinal,
        plan_revision: revision,
        attempt,
        content_ref: format!("mem://{ordinal}/{revision}/{attempt}"),
        metadata: json!({}),
        verdict: Verdict::Pending,
        feedback: None,
    }
}

fn verdict(ordinal: u32, revision: u32, attempt: u32, verdict: Verdict) -> VerdictRecord {
    let feedback = (verdict == Verdict::Rejected).then(|| Feedback {
        rejections: vec![Rejection {
            tool: "judge".into(),
            reason: format!("attempt {attempt} too dark"),
            details: json!(null),
        }],
    });
    VerdictRecord {
        ordinal,
        plan_revision: revision,
        attempt,
        verdict,
        feedback,
    }
}

async fn sample_log() -> ContextStore {
    let task = make_task();
    let mut store = ContextStore::in_memory(&task.id);
    store.append(EntryKind::TaskCreated, &task, None).await.unwrap();
    store
        .append(
            EntryKind::StateChanged,
            &StateChange {
                from: None,
                to: PipelineState::Planning,
                task_status: TaskStatus::Planning,
            },
            None,
        )
        .await
        .unwrap();
    let plan_seq = store
        .append(EntryKind::PlanAccepted, &make_plan(&task.id, 0, &[1, 2]), None)
        .await
        .unwrap();
    store
        .append(
            EntryKind::StateChanged,
            &StateChange {
                from: Some(PipelineState::Planning),
                to: PipelineState::Generating,
                task_status: TaskStatus::Generating,
            },
            Some(plan_seq),
        )
        .await
        .unwrap();
    for (ordinal, attempt, outcome) in [
        (1, 1, Verdict::Accepted),
        (2, 1, Verdict::Rejected),
        (2, 2, Verdict::Accepted),
    ] {
        let d = store
            .append(
                EntryKind::SegmentDispatched,
                &Dispatch {
                    ordinal,
                    plan_revision: 0,
                    attempt,
                },
                None,
            )
            .await
            .unwrap();
        let a = store
            .append(
                EntryKind::ArtifactProduced,
                &make_artifact(ordinal, 0, attempt),
                Some(d),
            )
            .await
            .unwrap();
        store
            .append(
                EntryKind::ArtifactVerdict,
                &verdict(ordinal, 0, attempt, outcome),
                Some(a),
            )
            .await
            .unwrap();
    }
    store
}

#[tokio::test]
async fn reconstructs_plan_artifacts_and_status() {
    let store = sample_log().await;
    let snapshot = store.snapshot().unwrap();

    assert_eq!(snapshot.state, Some(PipelineState::Generating));
    assert_eq!(
        snapshot.task.as_ref().map(|t| t.status),
        Some(TaskStatus::Generating)
    );
    assert_eq!(snapshot.plan.as_ref().map(|p| p.revision), Some(0));
    assert_eq!(snapshot.accepted.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(snapshot.artifacts[&2].len(), 2);
    assert_eq!(snapshot.artifacts[&2][0].verdict, Verdict::Rejected);
    assert_eq!(snapshot.accepted[&2].attempt, 2);
    assert_eq!(snapshot.attempts_in_revision(2, 0), 2);
    assert_eq!(snapshot.feedback_for(2).len(), 1);
    assert_eq!(snapshot.last_seq, store.last_seq());
}

#[tokio::test]
async fn replay_is_idempotent_over_duplicated_entries() {
    let store = sample_log().await;
    let once = reconstruct(store.entries()).unwrap();

    let mut doubled = store.entries().to_vec();
    doubled.extend(store.entries().iter().cloned());
    let twice = reconstruct(&doubled).unwrap();
    assert_eq!(once, twice);

    let mut shuffled = store.entries().to_vec();
    shuffled.reverse();
    assert_eq!(once, reconstruct(&shuffled).unwrap());

    let mut snapshot = once.clone();
    for entry in store.entries() {
        snapshot.apply(entry).unwrap();
    }
    assert_eq!(snapshot, once);
}

#[tokio::test]
async fn second_acceptance_for_an_ordinal_is_rejected() {
    let mut store = sample_log().await;
    store
        .append(EntryKind::ArtifactProduced, &make_artifact(1, 0, 2), None)
        .await
        .unwrap();
    store
        .append(
            EntryKind::ArtifactVerdict,
            &verdict(1, 0, 2, Verdict::Accepted),
            None,
        )
        .await
        .unwrap();
    assert!(matches!(
        store.snapshot(),
        Err(ReplayError::DuplicateAcceptance { ordinal: 1, .. })
    ));
}

#[tokio::test]
async fn invalidation_frees_the_ordinal_for_a_new_acceptance() {
    let mut store = sample_log().await;
    store
        .append(
            EntryKind::ReplanRequested,
            &ReplanRequest {
                prior_revision: 0,
                affected: BTreeSet::from([1]),
                replan_number: 1,
            },
            None,
        )
        .await
        .unwrap();
    let task_id = store.task_id().to_string();
    store
        .append(EntryKind::PlanAccepted, &make_plan(&task_id, 1, &[1, 2]), None)
        .await
        .unwrap();
    store
        .append(
            EntryKind::SegmentInvalidated,
            &Invalidation {
                ordinal: 1,
                plan_revision: 1,
                reason: "replaced".into(),
            },
            None,
        )
        .await
        .unwrap();
    store
        .append(EntryKind::ArtifactProduced, &make_artifact(1, 1, 1), None)
        .await
        .unwrap();
    store
        .append(
            EntryKind::ArtifactVerdict,
            &verdict(1, 1, 1, Verdict::Accepted),
            None,
        )
        .await
        .unwrap();

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.replans, 1);
    assert_eq!(snapshot.revisions, vec![0, 1]);
    assert_eq!(snapshot.accepted[&1].plan_revision, 1);
    assert_eq!(snapshot.artifacts[&1].len(), 2);
    assert_eq!(snapshot.attempts_in_revision(1, 1), 1);
}

#[tokio::test]
async fn failures_are_tracked_per_revision() {
    let mut store = sample_log().await;
    store
        .append(
            EntryKind::SegmentFailed,
            &SegmentFailure {
                ordinal: 3,
                plan_revision: 0,
                attempt: 1,
                failure: ToolFailure::hard("veo", "content policy"),
            },
            None,
        )
        .await
        .unwrap();
    let snapshot = store.snapshot().unwrap();
    assert!(snapshot.failure_in_revision(3, 0).is_some());
    assert!(snapshot.failure_in_revision(3, 1).is_none());
}

#[tokio::test]
async fn verdict_for_unknown_artifact_is_an_error() {
    let mut store = sample_log().await;
    store
        .append(
            EntryKind::ArtifactVerdict,
            &verdict(9, 0, 1, Verdict::Accepted),
            None,
        )
        .await
        .unwrap();
    assert!(matches!(
        store.snapshot(),
        Err(ReplayError::UnknownArtifact { ordinal: 9, .. })
    ));
}

#[tokio::test]
async fn entries_are_numbered_and_digested() {
    let store = sample_log().await;
    let seqs: Vec<u64> = store.entries().iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=store.len() as u64).collect();
    assert_eq!(seqs, expected);
    for entry in store.entries() {
        assert_eq!(entry.payload_ref, payload_digest(&entry.payload));
        assert_eq!(entry.payload_ref.len(), 64);
    }
}
