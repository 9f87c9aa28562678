use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::fakes::{chained_plan, ordinal_of, revision_of, rig, test_config};
use crate::core::context::{ContextStore, EntryKind};
use crate::core::pipeline::{PipelineState, SegmentOutcome};
use crate::core::types::{Task, TaskMode, TaskRequest};

fn make_task() -> Task {
    Task::new(
        TaskMode::FullyGenerative,
        TaskRequest::from_prompt("a 15 second spot for a seaside cafe"),
    )
}

fn invalidated(store: &ContextStore) -> Vec<u64> {
    store
        .of_kind(EntryKind::SegmentInvalidated)
        .filter_map(|e| e.payload["ordinal"].as_u64())
        .collect()
}

#[tokio::test]
async fn replan_invalidates_rewritten_segment_but_keeps_untouched_ones() {
    let draft = json!({"segments": [
        {"ordinal": 2, "scene": "runner on the pier at dusk", "duration_secs": 6.0, "depends_on": [1]},
        {"ordinal": 3, "scene": "runner walks into the cafe", "duration_secs": 4.0, "depends_on": [2]}
    ]});
    let rig = rig(test_config(), vec![chained_plan(), draft], |artifact| {
        !(ordinal_of(artifact) == 3 && revision_of(artifact) == 0)
    });
    let task = make_task();
    let store = ContextStore::in_memory(task.id.clone());

    let run = rig
        .pipeline
        .run(task, store, CancellationToken::new())
        .await
        .unwrap();

    assert!(run.report.is_done(), "{}", run.report);
    assert_eq!(run.report.plan_revision, Some(1));
    assert_eq!(run.report.replans, 1);
    assert_eq!(invalidated(&run.store), vec![2]);

    assert_eq!(rig.generator.calls_for(1), 1);
    assert_eq!(rig.generator.calls_for(2), 2);
    assert_eq!(rig.generator.calls_for(3), 3);
    assert_eq!(run.report.segment(3).unwrap().attempts, 3);

    let snapshot = run.store.snapshot().unwrap();
    assert_eq!(snapshot.accepted[&1].plan_revision, 0);
    assert_eq!(snapshot.accepted[&2].plan_revision, 1);
    assert_eq!(snapshot.accepted[&3].plan_revision, 1);

    let calls = rig.planner.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1]["affected"], json!([3]));
    assert_eq!(calls[1]["revision"], json!(1));
    assert_eq!(*rig.renderer.calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn replan_limit_fails_with_the_blocking_segment() {
    let draft = json!({"segments": [
        {"ordinal": 3, "scene": "close-up of the cafe sign", "duration_secs": 4.0, "depends_on": [2]}
    ]});
    let rig = rig(test_config(), vec![chained_plan(), draft], |artifact| {
        ordinal_of(artifact) != 3
    });
    let task = make_task();
    let store = ContextStore::in_memory(task.id.clone());

    let run = rig
        .pipeline
        .run(task, store, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.report.state, PipelineState::Failed);
    assert_eq!(run.report.blocking, vec![3]);
    assert!(run.report.error.as_deref().unwrap().contains("replan limit"));
    let seg = run.report.segment(3).unwrap();
    assert_eq!(seg.outcome, SegmentOutcome::ExhaustedRetries);
    assert_eq!(seg.attempts, 4);
    assert_eq!(seg.detail.as_deref(), Some("[judge] off-brief"));
    assert_eq!(
        run.report.segment(1).unwrap().outcome,
        SegmentOutcome::Accepted
    );
    assert_eq!(*rig.renderer.calls.lock().unwrap(), 0);
    assert_eq!(run.store.of_kind(EntryKind::TaskFailed).count(), 1);
}

#[tokio::test]
async fn planning_failure_is_terminal() {
    let rig = rig(test_config(), Vec::new(), |_| true);
    let task = make_task();
    let store = ContextStore::in_memory(task.id.clone());

    let run = rig
        .pipeline
        .run(task, store, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.report.state, PipelineState::Failed);
    assert_eq!(run.report.plan_revision, None);
    assert!(run.report.error.as_deref().unwrap().starts_with("planning failed"));
    assert_eq!(rig.generator.calls_for(1), 0);
}

#[tokio::test]
async fn canceled_before_start_never_calls_a_tool() {
    let rig = rig(test_config(), vec![chained_plan()], |_| true);
    let task = make_task();
    let store = ContextStore::in_memory(task.id.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let run = rig.pipeline.run(task, store, cancel).await.unwrap();

    assert_eq!(run.report.state, PipelineState::Canceled);
    assert!(rig.planner.calls.lock().unwrap().is_empty());
    assert_eq!(run.store.of_kind(EntryKind::TaskCanceled).count(), 1);
}

#[tokio::test]
async fn resume_skips_segments_already_accepted() {
    let first = rig(test_config(), vec![chained_plan()], |_| true);
    let task = make_task();
    let task_id = task.id.clone();
    let run = first
        .pipeline
        .run(task, ContextStore::in_memory(task_id.clone()), CancellationToken::new())
        .await
        .unwrap();
    assert!(run.report.is_done());

    // Cut the log right after segment 1 was accepted.
    let cut = run
        .store
        .entries()
        .iter()
        .position(|e| e.kind == EntryKind::ArtifactVerdict)
        .unwrap();
    let partial = run.store.entries()[..=cut].to_vec();

    let second = rig(test_config(), Vec::new(), |_| true);
    let resumed = second
        .pipeline
        .resume(
            ContextStore::from_entries(task_id, partial),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(resumed.report.is_done(), "{}", resumed.report);
    assert!(second.planner.calls.lock().unwrap().is_empty());
    assert_eq!(second.generator.calls_for(1), 0);
    assert_eq!(second.generator.calls_for(2), 1);
    assert_eq!(second.generator.calls_for(3), 1);

    let snapshot = resumed.store.snapshot().unwrap();
    assert_eq!(snapshot.accepted[&1].content_ref, "mem://clip-1-1");
    assert_eq!(snapshot.state, Some(PipelineState::Done));
}

#[tokio::test]
async fn resuming_a_finished_task_does_no_work() {
    let first = rig(test_config(), vec![chained_plan()], |_| true);
    let task = make_task();
    let store = ContextStore::in_memory(task.id.clone());
    let run = first
        .pipeline
        .run(task, store, CancellationToken::new())
        .await
        .unwrap();
    let entries_before = run.store.len();

    let second = rig(test_config(), Vec::new(), |_| true);
    let resumed = second
        .pipeline
        .resume(run.store, CancellationToken::new())
        .await
        .unwrap();

    assert!(resumed.report.is_done());
    assert_eq!(
        resumed.report.final_video.as_ref().map(|v| v.uri.as_str()),
        Some("mem://final.mp4")
    );
    assert_eq!(resumed.store.len(), entries_before);
    assert_eq!(second.generator.calls_for(1), 0);
    assert_eq!(*second.renderer.calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn resume_without_a_task_is_an_error() {
    let rig = rig(test_config(), Vec::new(), |_| true);
    let result = rig
        .pipeline
        .resume(ContextStore::in_memory("missing"), CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(crate::core::error::PipelineError::NothingToResume)
    ));
}

#[tokio::test]
async fn rewriting_the_first_scene_invalidates_the_chain_behind_it() {
    let plan = json!({"segments": [
        {"ordinal": 1, "scene": "sunrise over the bay", "duration_secs": 4.0},
        {"ordinal": 2, "scene": "runner on the pier", "duration_secs": 4.0, "depends_on": [1]},
        {"ordinal": 3, "scene": "runner reaches the cafe", "duration_secs": 4.0, "depends_on": [2]},
        {"ordinal": 4, "scene": "latte art close-up", "duration_secs": 3.0, "depends_on": [3]}
    ]});
    let draft = json!({"segments": [
        {"ordinal": 1, "scene": "overcast morning over the bay", "duration_secs": 4.0},
        {"ordinal": 4, "scene": "cup set down on the counter", "duration_secs": 3.0, "depends_on": [3]}
    ]});
    let rig = rig(test_config(), vec![plan, draft], |artifact| {
        !(ordinal_of(artifact) == 4 && revision_of(artifact) == 0)
    });
    let task = make_task();
    let store = ContextStore::in_memory(task.id.clone());

    let run = rig
        .pipeline
        .run(task, store, CancellationToken::new())
        .await
        .unwrap();

    assert!(run.report.is_done(), "{}", run.report);
    assert_eq!(run.report.replans, 1);
    assert_eq!(invalidated(&run.store), vec![1, 2, 3]);
    let reasons: Vec<String> = run
        .store
        .of_kind(EntryKind::SegmentInvalidated)
        .filter_map(|e| e.payload["reason"].as_str().map(str::to_string))
        .collect();
    assert_eq!(reasons[0], "segment rewritten in revision 1");
    assert_eq!(reasons[1], "depends on a rewritten segment");
    assert_eq!(reasons[2], "depends on a rewritten segment");

    for ordinal in [1, 2, 3] {
        assert_eq!(rig.generator.calls_for(ordinal), 2, "segment {ordinal}");
    }
    assert_eq!(rig.generator.calls_for(4), 3);

    let snapshot = run.store.snapshot().unwrap();
    for ordinal in [1, 2, 3, 4] {
        assert_eq!(snapshot.accepted[&ordinal].plan_revision, 1);
    }
    assert_eq!(snapshot.accepted[&3].content_ref, "mem://clip-3-2");
}

#[tokio::test]
async fn revision_that_only_drops_a_scene_goes_straight_to_assembly() {
    let draft = json!({"segments": [], "removed": [3]});
    let rig = rig(test_config(), vec![chained_plan(), draft], |artifact| {
        ordinal_of(artifact) != 3
    });
    let task = make_task();
    let store = ContextStore::in_memory(task.id.clone());

    let run = rig
        .pipeline
        .run(task, store, CancellationToken::new())
        .await
        .unwrap();

    assert!(run.report.is_done(), "{}", run.report);
    assert_eq!(run.report.plan_revision, Some(1));
    assert_eq!(rig.generator.calls_for(1), 1);
    assert_eq!(rig.generator.calls_for(2), 1);
    assert_eq!(rig.generator.calls_for(3), 2);
    assert!(invalidated(&run.store).is_empty());
    assert_eq!(*rig.renderer.calls.lock().unwrap(), 1);

    let snapshot = run.store.snapshot().unwrap();
    assert_eq!(snapshot.plan.as_ref().unwrap().ordinals(), vec![1, 2]);
    assert_eq!(snapshot.assembled_ordinals, vec![1, 2]);

    let states: Vec<String> = run
        .store
        .of_kind(EntryKind::StateChanged)
        .filter_map(|e| e.payload["to"].as_str().map(str::to_string))
        .collect();
    let tail = &states[states.len() - 5..];
    assert_eq!(
        tail,
        ["replanning", "generating", "reviewing", "assembling", "done"]
    );
}

#[tokio::test]
async fn resume_reviews_an_artifact_produced_before_the_stop() {
    // Segment 1 is rejected once; its second attempt is produced but the
    // log ends before the verdict.
    let first = rig(test_config(), vec![chained_plan()], |artifact| {
        !(ordinal_of(artifact) == 1 && artifact["attempt"].as_u64() == Some(1))
    });
    let task = make_task();
    let task_id = task.id.clone();
    let run = first
        .pipeline
        .run(task, ContextStore::in_memory(task_id.clone()), CancellationToken::new())
        .await
        .unwrap();
    assert!(run.report.is_done(), "{}", run.report);

    let cut = run
        .store
        .entries()
        .iter()
        .position(|e| {
            e.kind == EntryKind::ArtifactProduced
                && e.payload["segment_ordinal"] == json!(1)
                && e.payload["attempt"] == json!(2)
        })
        .unwrap();
    let partial = run.store.entries()[..=cut].to_vec();

    let second = rig(test_config(), Vec::new(), |_| true);
    let resumed = second
        .pipeline
        .resume(
            ContextStore::from_entries(task_id, partial),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(resumed.report.is_done(), "{}", resumed.report);
    assert_eq!(resumed.report.replans, 0);
    assert!(second.planner.calls.lock().unwrap().is_empty());
    assert_eq!(second.generator.calls_for(1), 0);
    assert_eq!(second.generator.calls_for(2), 1);
    assert_eq!(second.generator.calls_for(3), 1);

    let snapshot = resumed.store.snapshot().unwrap();
    assert_eq!(snapshot.accepted[&1].content_ref, "mem://clip-1-2");
    assert_eq!(snapshot.accepted[&1].attempt, 2);
    assert_eq!(snapshot.state, Some(PipelineState::Done));
}
