
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use clipforge::core::context::{ContextStore, EntryKind, Journal, SqliteJournal};
use clipforge::core::pipeline::{PipelineState, SegmentOutcome};
use clipforge::core::tools::{ToolResponse, ToolStatus};
use clipforge::core::types::{Task, TaskMode, TaskRequest, Verdict};
use clipforge::PipelineConfig;
use harness::{GENERATOR, Studio, TestResult, fast_config, three_scene_plan, two_independent_scenes};

fn cafe_task() -> Task {
    Task::new(
        TaskMode::FullyGenerative,
        TaskRequest::from_prompt("15 second vertical spot for a neighbourhood cafe"),
    )
}

fn entered(store: &ContextStore, state: PipelineState) -> bool {
    store
        .of_kind(EntryKind::StateChanged)
        .any(|e| e.payload["to"] == json!(state.as_str()))
}

#[tokio::test]
async fn rejected_segment_is_regenerated_until_accepted() -> TestResult<()> {
    let studio = Studio::builder()
        .plan(three_scene_plan())
        .verdicts(2, &[false, false, true])
        .build();
    let task = cafe_task();
    let store = ContextStore::in_memory(task.id.clone());

    let run = studio
        .pipeline
        .run(task, store, CancellationToken::new())
        .await?;

    assert!(run.report.is_done(), "{}", run.report);
    assert_eq!(run.report.replans, 0);
    assert_eq!(studio.renderer.rendered_ordinals(), vec![vec![1, 2, 3]]);

    let snapshot = run.store.snapshot()?;
    let history: Vec<Verdict> = snapshot.artifacts[&2].iter().map(|a| a.verdict).collect();
    assert_eq!(
        history,
        vec![Verdict::Rejected, Verdict::Rejected, Verdict::Accepted]
    );
    assert_eq!(snapshot.accepted[&2].attempt, 3);
    assert_eq!(snapshot.accepted[&2].content_ref, "mem://clip-2-3");

    let rejected = snapshot.artifacts[&2][1].feedback.as_ref().unwrap();
    assert_eq!(rejected.rejections[0].tool, "judge");
    assert_eq!(rejected.rejections[0].details, json!({"score": 0.2}));
    assert_eq!(run.report.segment(2).unwrap().attempts, 3);

    let video = run.report.final_video.unwrap();
    assert_eq!(video.uri, "mem://final.mp4");
    assert_eq!(video.duration_secs, 14.5);
    Ok(())
}

#[tokio::test]
async fn hard_generation_failure_escalates_without_retry() -> TestResult<()> {
    let replan = json!({"segments": [
        {"ordinal": 3, "scene": "logo on a chalkboard menu", "duration_secs": 4.0}
    ]});
    let studio = Studio::builder()
        .plan(three_scene_plan())
        .plan(replan)
        .generation(3, ToolResponse::hard("content policy violation"))
        .build();
    let task = cafe_task();
    let store = ContextStore::in_memory(task.id.clone());

    let run = studio
        .pipeline
        .run(task, store, CancellationToken::new())
        .await?;

    assert!(run.report.is_done(), "{}", run.report);
    assert!(entered(&run.store, PipelineState::Replanning));
    assert_eq!(run.report.replans, 1);
    assert_eq!(run.report.plan_revision, Some(1));

    // One call for the failed revision, one after replanning.
    assert_eq!(studio.generator.calls_for(3), 2);
    let first_revision: Vec<_> = run
        .store
        .invocations()
        .into_iter()
        .filter(|r| r.ordinal == Some(3) && r.invocation.tool_name == GENERATOR)
        .collect();
    assert_eq!(first_revision[0].invocation.outcome, ToolStatus::HardFailure);
    assert_eq!(first_revision[0].invocation.attempt, 1);
    assert_eq!(run.store.of_kind(EntryKind::SegmentFailed).count(), 1);

    let replan_payload = &studio.planner.payloads.lock().unwrap()[1];
    assert_eq!(replan_payload["affected"], json!([3]));
    assert!(
        replan_payload["prompt"]
            .as_str()
            .unwrap()
            .contains("content policy violation")
    );
    Ok(())
}

#[tokio::test]
async fn exhausted_replans_fail_naming_the_blocking_segment() -> TestResult<()> {
    let config = PipelineConfig {
        max_replans: 1,
        max_verify_retries: 2,
        ..fast_config()
    };
    let replan = json!({"segments": [
        {"ordinal": 2, "scene": "close-up of latte art", "duration_secs": 6.0, "depends_on": [1]}
    ]});
    let studio = Studio::builder()
        .config(config)
        .plan(three_scene_plan())
        .plan(replan)
        .verdicts(2, &[false, false, false, false])
        .build();
    let task = cafe_task();
    let store = ContextStore::in_memory(task.id.clone());

    let run = studio
        .pipeline
        .run(task, store, CancellationToken::new())
        .await?;

    assert_eq!(run.report.state, PipelineState::Failed);
    assert_eq!(run.report.blocking, vec![2]);
    assert_eq!(
        run.report.segment(2).unwrap().outcome,
        SegmentOutcome::ExhaustedRetries
    );
    assert_eq!(
        run.report.segment(1).unwrap().outcome,
        SegmentOutcome::Accepted
    );
    assert!(studio.renderer.manifests.lock().unwrap().is_empty());

    let snapshot = run.store.snapshot()?;
    assert_eq!(snapshot.failure.unwrap().blocking, vec![2]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn independent_segments_generate_concurrently() -> TestResult<()> {
    let config = PipelineConfig {
        concurrency: 2,
        ..fast_config()
    };
    let studio = Studio::builder()
        .config(config)
        .plan(two_independent_scenes())
        .delay(1, Duration::from_millis(300))
        .delay(2, Duration::from_millis(300))
        .build();
    let task = cafe_task();
    let store = ContextStore::in_memory(task.id.clone());

    let run = studio
        .pipeline
        .run(task, store, CancellationToken::new())
        .await?;
    assert!(run.report.is_done(), "{}", run.report);

    let calls: Vec<_> = run
        .store
        .invocations()
        .into_iter()
        .filter(|r| r.invocation.tool_name == GENERATOR)
        .collect();
    assert_eq!(calls.len(), 2);
    let (a, b) = (&calls[0].invocation, &calls[1].invocation);
    assert!(
        a.started_at < b.finished_at() && b.started_at < a.finished_at(),
        "generation calls did not overlap: {:?}..{:?} vs {:?}..{:?}",
        a.started_at,
        a.finished_at(),
        b.started_at,
        b.finished_at()
    );
    Ok(())
}

#[tokio::test]
async fn cancel_discards_in_flight_generation() -> TestResult<()> {
    let studio = Studio::builder()
        .plan(two_independent_scenes())
        .delay(1, Duration::from_secs(30))
        .delay(2, Duration::from_secs(30))
        .build();
    let task = cafe_task();
    let store = ContextStore::in_memory(task.id.clone());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let run = studio.pipeline.run(task, store, cancel).await?;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(run.report.state, PipelineState::Canceled);
    assert_eq!(run.store.of_kind(EntryKind::TaskCanceled).count(), 1);
    assert_eq!(run.store.of_kind(EntryKind::ArtifactProduced).count(), 0);
    assert!(studio.renderer.manifests.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn interrupted_task_resumes_from_the_journal() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("journal.db");
    let task = cafe_task();
    let task_id = task.id.clone();

    // Segment 1 finishes quickly; segment 2 hangs until the process "dies".
    {
        let studio = Studio::builder()
            .plan(two_independent_scenes())
            .delay(2, Duration::from_secs(60))
            .build();
        let journal: Arc<dyn Journal> = Arc::new(SqliteJournal::open(&db_path).await?);
        let store = ContextStore::with_journal(task_id.clone(), journal);
        let interrupted = tokio::time::timeout(
            Duration::from_millis(800),
            studio.pipeline.run(task, store, CancellationToken::new()),
        )
        .await;
        assert!(interrupted.is_err(), "run should still be waiting on segment 2");
    }

    let journal = Arc::new(SqliteJournal::open(&db_path).await?);
    let record = journal.get_task(&task_id).await?.unwrap();
    assert_eq!(record.status, "generating");

    let store = ContextStore::load(&task_id, journal).await?;
    let before = store.snapshot()?;
    assert!(before.accepted.contains_key(&1));
    assert!(!before.accepted.contains_key(&2));

    let studio = Studio::builder().build();
    let run = studio
        .pipeline
        .resume(store, CancellationToken::new())
        .await?;

    assert!(run.report.is_done(), "{}", run.report);
    assert!(studio.planner.payloads.lock().unwrap().is_empty());
    assert_eq!(studio.generator.calls_for(1), 0);
    assert_eq!(studio.generator.calls_for(2), 1);
    assert_eq!(studio.renderer.rendered_ordinals(), vec![vec![1, 2]]);
    Ok(())
}
