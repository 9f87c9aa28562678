//! Property tests: manifest ordering, replay convergence, dependency closure.


use std::collections::BTreeSet;
use std::sync::OnceLock;

use proptest::prelude::*;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use clipforge::core::assembler::build_manifest;
use clipforge::core::context::{ContextEntry, ContextStore, TaskSnapshot, reconstruct};
use clipforge::core::types::{
    Artifact, Overlays, ScriptPlan, SegmentSpec, Task, TaskMode, TaskRequest, Transition,
    TransitionKind, Verdict,
};
use clipforge::config::OutputSettings;
use harness::{Studio, three_scene_plan};

fn segment(ordinal: u32, secs: f64, depends_on: BTreeSet<u32>) -> SegmentSpec {
    SegmentSpec {
        ordinal,
        scene: format!("scene {ordinal}"),
        duration_secs: secs,
        source_mode: Default::default(),
        media_kind: Default::default(),
        reference_asset: None,
        depends_on,
        transition: None,
    }
}

fn accepted(ordinal: u32) -> Artifact {
    Artifact {
        segment_ordinal: ordinal,
        plan_revision: 0,
        attempt: 1,
        content_ref: format!("mem://clip-{ordinal}"),
        metadata: Value::Null,
        verdict: Verdict::Accepted,
        feedback: None,
    }
}

/// Per segment: duration and an optional (fade?, transition seconds).
fn timed_segments() -> impl Strategy<Value = Vec<(f64, Option<(bool, f64)>)>> {
    prop::collection::vec(
        (0.5f64..12.0, prop::option::of((any::<bool>(), 0.0f64..3.0))),
        1..8,
    )
}

fn timed_plan(shape: &[(f64, Option<(bool, f64)>)]) -> ScriptPlan {
    let count = shape.len() as u32;
    let segments = shape
        .iter()
        .enumerate()
        .map(|(i, (secs, transition))| {
            let ordinal = i as u32 + 1;
            let mut seg = segment(ordinal, *secs, BTreeSet::new());
            if ordinal < count {
                seg.transition = transition.map(|(fade, duration_secs)| Transition {
                    kind: if fade {
                        TransitionKind::Fade
                    } else {
                        TransitionKind::Cut
                    },
                    duration_secs,
                    to: ordinal + 1,
                });
            }
            seg
        })
        .collect();
    ScriptPlan {
        task_id: "task-prop".into(),
        revision: 0,
        segments,
        overlays: Overlays::default(),
    }
}

/// A DAG where each segment may depend on any lower ordinal.
fn dependency_plan() -> impl Strategy<Value = ScriptPlan> {
    (1usize..10)
        .prop_flat_map(|n| prop::collection::vec(prop::collection::vec(any::<bool>(), n), n))
        .prop_map(|matrix| {
            let segments = matrix
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    let ordinal = i as u32 + 1;
                    let depends_on = (0..i)
                        .filter(|j| row[*j])
                        .map(|j| j as u32 + 1)
                        .collect();
                    segment(ordinal, 2.0, depends_on)
                })
                .collect();
            ScriptPlan {
                task_id: "task-prop".into(),
                revision: 0,
                segments,
                overlays: Overlays::default(),
            }
        })
}

/// A full run with one rejection, produced once and shared by every case.
fn recorded_log() -> &'static [ContextEntry] {
    static LOG: OnceLock<Vec<ContextEntry>> = OnceLock::new();
    LOG.get_or_init(|| {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let studio = Studio::builder()
                .plan(three_scene_plan())
                .verdicts(2, &[false, true])
                .build();
            let task = Task::new(
                TaskMode::FullyGenerative,
                TaskRequest::from_prompt("harbour at dawn"),
            );
            let store = ContextStore::in_memory(task.id.clone());
            let run = studio
                .pipeline
                .run(task, store, CancellationToken::new())
                .await
                .unwrap();
            assert!(run.report.is_done(), "{}", run.report);
            run.store.entries().to_vec()
        })
    })
}

fn baseline() -> &'static TaskSnapshot {
    static SNAPSHOT: OnceLock<TaskSnapshot> = OnceLock::new();
    SNAPSHOT.get_or_init(|| reconstruct(recorded_log()).unwrap())
}

proptest! {
    #[test]
    fn prop_manifest_is_ordered_whatever_the_input_order(
        shape in timed_segments(),
        seed in any::<u64>(),
    ) {
        let plan = timed_plan(&shape);
        let sorted: Vec<Artifact> = plan.ordinals().into_iter().map(accepted).collect();
        let mut shuffled = sorted.clone();
        // Deterministic rotation plus reversal stands in for a permutation.
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        if seed % 2 == 1 {
            shuffled.reverse();
        }

        let output = OutputSettings::default();
        let expected = build_manifest(&sorted, &plan, &output, "9:16").unwrap();
        let manifest = build_manifest(&shuffled, &plan, &output, "9:16").unwrap();
        prop_assert_eq!(&manifest, &expected);

        let ordinals: Vec<u32> = manifest.shots.iter().map(|s| s.ordinal).collect();
        prop_assert_eq!(ordinals, plan.ordinals());
        for pair in manifest.shots.windows(2) {
            prop_assert!(pair[1].timeline_in >= pair[0].timeline_in);
            prop_assert!(pair[1].timeline_in <= pair[0].timeline_out);
        }
        let total: f64 = shape.iter().map(|(secs, _)| secs).sum();
        prop_assert!(manifest.total_duration_secs <= total + 1e-9);
    }

    #[test]
    fn prop_replay_converges_under_shuffle_and_duplication(
        order in Just(recorded_log().to_vec()).prop_shuffle(),
        extra in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let log = recorded_log();
        let mut entries = order;
        entries.extend(extra.iter().map(|i| log[i.index(log.len())].clone()));

        let snapshot = reconstruct(&entries).unwrap();
        prop_assert_eq!(&snapshot, baseline());
    }

    #[test]
    fn prop_every_prefix_of_a_log_replays(cut in any::<prop::sample::Index>()) {
        let log = recorded_log();
        let prefix = &log[..cut.index(log.len() + 1)];
        prop_assert!(reconstruct(prefix).is_ok());
    }

    #[test]
    fn prop_dependents_are_closed_and_reachable(
        plan in dependency_plan(),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 1..4),
    ) {
        let ordinals = plan.ordinals();
        let roots: BTreeSet<u32> = picks.iter().map(|i| ordinals[i.index(ordinals.len())]).collect();
        let dependents = plan.transitive_dependents(&roots);

        let reached: BTreeSet<u32> = roots.union(&dependents).copied().collect();
        for seg in &plan.segments {
            // Closed: anything leaning on a reached segment is itself a dependent.
            if seg.depends_on.iter().any(|d| reached.contains(d)) {
                prop_assert!(dependents.contains(&seg.ordinal));
            }
            // Reachable: a dependent always leans on something reached.
            if dependents.contains(&seg.ordinal) {
                prop_assert!(seg.depends_on.iter().any(|d| reached.contains(d)));
            }
        }
    }
}
