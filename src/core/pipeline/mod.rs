//! Pipeline controller: drives one task from planning through generation,
//! review, replanning and assembly.
//!
//! The controller owns all task state and is the only writer of the context
//! log. Tool work happens on the worker pool; the controller only awaits pool
//! events or cancellation, so it never blocks on a tool call.

mod report;
mod state;

pub use report::{SegmentOutcome, SegmentReport, TaskReport};
pub use state::{PipelineState, SegmentState, can_transition};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::core::assembler::Assembler;
use crate::core::context::{
    AssemblyRecord, ContextStore, Dispatch, EntryKind, FailureRecord, Invalidation,
    InvocationRecord, ReplanRequest, SegmentFailure, StateChange, TaskSnapshot, VerdictRecord,
};
use crate::core::error::{PipelineError, ToolFailure};
use crate::core::executor::{
    GenerationContext, GenerationExecutor, GenerationOutcome, SegmentJob, WorkerEvent, WorkerPool,
};
use crate::core::planner::SegmentPlanner;
use crate::core::quality::{GateOutcome, GateVerdict, QualityGate};
use crate::core::tools::{TaskContextRef, ToolInvocation, ToolRegistry};
use crate::core::types::{
    Artifact, Feedback, FinalVideoRef, Rejection, ScriptPlan, SegmentSpec, Task, Verdict,
};

pub struct Pipeline {
    config: PipelineConfig,
    planner: SegmentPlanner,
    executor: Arc<GenerationExecutor>,
    gate: Arc<QualityGate>,
    assembler: Assembler,
}

/// A finished (or stopped) task: its report and the log that produced it.
pub struct TaskRun {
    pub report: TaskReport,
    pub store: ContextStore,
}

impl Pipeline {
    pub fn new(registry: Arc<ToolRegistry>, config: PipelineConfig) -> Self {
        let policy = config.retry_policy();
        let planner = SegmentPlanner::new(
            registry.clone(),
            config.planner_tool.clone(),
            policy.clone(),
            config.deadlines.planning(),
        );
        let executor = Arc::new(GenerationExecutor::new(
            registry.clone(),
            config.generators.clone(),
            policy.clone(),
            config.deadlines.generation(),
        ));
        let gate = Arc::new(QualityGate::new(
            registry.clone(),
            config.verifiers.clone(),
            policy,
            config.deadlines.verification(),
        ));
        let assembler = Assembler::new(
            registry,
            config.render_tool.clone(),
            config.output.clone(),
            config.deadlines.render(),
        );
        Self {
            config,
            planner,
            executor,
            gate,
            assembler,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Drive a new task to a terminal state.
    ///
    /// Task-level failures (planning, exhausted replans, render) come back as
    /// a report with state `Failed`; `Err` means the log itself could not be
    /// written or replayed.
    pub async fn run(
        &self,
        task: Task,
        store: ContextStore,
        cancel: CancellationToken,
    ) -> Result<TaskRun, PipelineError> {
        info!("Starting task {} ({})", task.id, task.mode.as_str());
        let mut ctl = Controller::new(self, task, store, cancel);
        ctl.store.append(EntryKind::TaskCreated, &ctl.task, None).await?;
        let change = StateChange {
            from: None,
            to: PipelineState::Planning,
            task_status: PipelineState::Planning.task_status(),
        };
        ctl.store.append(EntryKind::StateChanged, &change, None).await?;
        self.plan_and_drive(ctl).await
    }

    /// Rebuild a task from its context log and continue where it stopped.
    /// Terminal tasks are reported without doing any work.
    pub async fn resume(
        &self,
        store: ContextStore,
        cancel: CancellationToken,
    ) -> Result<TaskRun, PipelineError> {
        let snapshot = store.snapshot()?;
        let Some(task) = snapshot.task.clone() else {
            return Err(PipelineError::NothingToResume);
        };
        let state = snapshot.state.unwrap_or(PipelineState::Planning);

        let mut ctl = Controller::new(self, task, store, cancel);
        ctl.state = state;
        ctl.final_video = snapshot.final_video.clone();
        if let Some(failure) = &snapshot.failure {
            ctl.error = Some(failure.error.clone());
            ctl.blocking = failure.blocking.clone();
        }

        let Some(plan) = snapshot.plan.clone() else {
            if state.is_terminal() {
                return Ok(ctl.finish_without_plan());
            }
            info!("Resuming task {}: replanning from scratch", ctl.task.id);
            return self.plan_and_drive(ctl).await;
        };

        let mut run = Run::from_snapshot(ctl, plan, &snapshot);
        if state.is_terminal() {
            info!("Task {} already {}", run.ctl.task.id, state.as_str());
            return Ok(run.finish());
        }
        info!(
            "Resuming task {} in {} at plan revision {}",
            run.ctl.task.id,
            state.as_str(),
            run.plan.revision
        );
        run.drive().await?;
        Ok(run.finish())
    }

    async fn plan_and_drive(&self, mut ctl: Controller<'_>) -> Result<TaskRun, PipelineError> {
        let outcome = self.planner.plan(&ctl.task, &ctl.cancel).await;
        ctl.record_invocations(None, outcome.invocations, None)
            .await?;
        let plan = match outcome.plan {
            Ok(plan) => plan,
            Err(_) if ctl.cancel.is_cancelled() => {
                ctl.cancel_task().await?;
                return Ok(ctl.finish_without_plan());
            }
            Err(e) => {
                ctl.fail(format!("planning failed: {e}"), Vec::new()).await?;
                return Ok(ctl.finish_without_plan());
            }
        };
        ctl.store.append(EntryKind::PlanAccepted, &plan, None).await?;

        let mut run = Run::new(ctl, plan);
        run.drive().await?;
        Ok(run.finish())
    }
}

/// Task-level bookkeeping shared by the planning and driving phases.
struct Controller<'p> {
    pipeline: &'p Pipeline,
    task: Task,
    store: ContextStore,
    state: PipelineState,
    cancel: CancellationToken,
    error: Option<String>,
    blocking: Vec<u32>,
    final_video: Option<FinalVideoRef>,
}

impl<'p> Controller<'p> {
    fn new(
        pipeline: &'p Pipeline,
        task: Task,
        store: ContextStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            task,
            store,
            state: PipelineState::Planning,
            cancel,
            error: None,
            blocking: Vec::new(),
            final_video: None,
        }
    }

    async fn transition(&mut self, to: PipelineState) -> Result<(), PipelineError> {
        if self.state == to {
            return Ok(());
        }
        if !can_transition(self.state, to) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let change = StateChange {
            from: Some(self.state),
            to,
            task_status: to.task_status(),
        };
        self.store.append(EntryKind::StateChanged, &change, None).await?;
        info!(
            "Task {}: {} -> {}",
            self.task.id,
            self.state.as_str(),
            to.as_str()
        );
        self.state = to;
        self.task.status = to.task_status();
        Ok(())
    }

    async fn record_invocations(
        &mut self,
        ordinal: Option<u32>,
        invocations: Vec<ToolInvocation>,
        cause: Option<u64>,
    ) -> Result<Option<u64>, PipelineError> {
        let mut last = cause;
        for invocation in invocations {
            let record = InvocationRecord {
                ordinal,
                invocation,
            };
            last = Some(
                self.store
                    .append(EntryKind::ToolInvoked, &record, cause)
                    .await?,
            );
        }
        Ok(last)
    }

    async fn fail(&mut self, error: String, blocking: Vec<u32>) -> Result<(), PipelineError> {
        self.transition(PipelineState::Failed).await?;
        let record = FailureRecord {
            error: error.clone(),
            blocking: blocking.clone(),
        };
        self.store.append(EntryKind::TaskFailed, &record, None).await?;
        warn!("Task {} failed: {}", self.task.id, error);
        self.error = Some(error);
        self.blocking = blocking;
        Ok(())
    }

    async fn cancel_task(&mut self) -> Result<(), PipelineError> {
        self.transition(PipelineState::Canceled).await?;
        self.store
            .append(
                EntryKind::TaskCanceled,
                &json!({"reason": "canceled by caller"}),
                None,
            )
            .await?;
        info!("Task {} canceled", self.task.id);
        Ok(())
    }

    fn finish_without_plan(self) -> TaskRun {
        let report = TaskReport {
            task_id: self.task.id.clone(),
            status: self.task.status,
            state: self.state,
            plan_revision: None,
            replans: 0,
            segments: Vec::new(),
            blocking: self.blocking,
            final_video: self.final_video,
            error: self.error,
        };
        TaskRun {
            report,
            store: self.store,
        }
    }
}

#[derive(Debug, Clone)]
struct SegmentProgress {
    state: SegmentState,
    /// Generation attempts under the current plan revision.
    attempts: u32,
    total_attempts: u32,
    feedback: Vec<Feedback>,
    candidate: Option<Artifact>,
    accepted: Option<Artifact>,
    failure: Option<ToolFailure>,
    dispatch_seq: Option<u64>,
    candidate_seq: Option<u64>,
}

impl SegmentProgress {
    fn waiting() -> Self {
        Self {
            state: SegmentState::Waiting,
            attempts: 0,
            total_attempts: 0,
            feedback: Vec::new(),
            candidate: None,
            accepted: None,
            failure: None,
            dispatch_seq: None,
            candidate_seq: None,
        }
    }
}

/// The generation/review/replan loop over an accepted plan.
struct Run<'p> {
    ctl: Controller<'p>,
    plan: ScriptPlan,
    segments: BTreeMap<u32, SegmentProgress>,
    in_flight: BTreeSet<u32>,
    escalated: BTreeSet<u32>,
    replans: u32,
}

impl<'p> Run<'p> {
    fn new(ctl: Controller<'p>, plan: ScriptPlan) -> Self {
        let segments = plan
            .segments
            .iter()
            .map(|s| (s.ordinal, SegmentProgress::waiting()))
            .collect();
        Self {
            ctl,
            plan,
            segments,
            in_flight: BTreeSet::new(),
            escalated: BTreeSet::new(),
            replans: 0,
        }
    }

    fn from_snapshot(ctl: Controller<'p>, plan: ScriptPlan, snapshot: &TaskSnapshot) -> Self {
        let max_attempts = ctl.pipeline.config.max_verify_retries;
        let mut segments = BTreeMap::new();
        let mut escalated = BTreeSet::new();

        for seg in &plan.segments {
            let ordinal = seg.ordinal;
            let mut progress = SegmentProgress::waiting();
            progress.total_attempts = snapshot
                .artifacts
                .get(&ordinal)
                .map(|list| list.len() as u32)
                .unwrap_or(0);
            progress.attempts = snapshot.attempts_in_revision(ordinal, plan.revision);
            progress.feedback = snapshot.feedback_for(ordinal);

            if let Some(accepted) = snapshot.accepted.get(&ordinal) {
                progress.accepted = Some(accepted.clone());
                progress.state = SegmentState::Accepted;
            } else if let Some(failure) = snapshot.failure_in_revision(ordinal, plan.revision) {
                progress.failure = Some(failure.clone());
                progress.state = SegmentState::Failed;
                escalated.insert(ordinal);
            } else if let Some(artifact) = snapshot
                .latest_artifact(ordinal)
                .filter(|a| a.plan_revision == plan.revision && a.verdict == Verdict::Pending)
            {
                // Produced but never judged before the stop.
                progress.state = SegmentState::Reviewing;
                progress.candidate = Some(artifact.clone());
                progress.candidate_seq = ctl
                    .store
                    .of_kind(EntryKind::ArtifactProduced)
                    .filter(|e| e.payload["segment_ordinal"].as_u64() == Some(ordinal as u64))
                    .map(|e| e.seq)
                    .max();
            } else if progress.attempts >= max_attempts {
                progress.state = SegmentState::Exhausted;
                escalated.insert(ordinal);
            }
            segments.insert(ordinal, progress);
        }

        Self {
            ctl,
            plan,
            segments,
            in_flight: BTreeSet::new(),
            escalated,
            replans: snapshot.replans,
        }
    }

    fn is_accepted(&self, ordinal: u32) -> bool {
        self.segments
            .get(&ordinal)
            .is_some_and(|p| p.state == SegmentState::Accepted)
    }

    fn all_accepted(&self) -> bool {
        self.plan.segments.iter().all(|s| self.is_accepted(s.ordinal))
    }

    fn unaccepted(&self) -> Vec<u32> {
        self.plan
            .segments
            .iter()
            .map(|s| s.ordinal)
            .filter(|o| !self.is_accepted(*o))
            .collect()
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        let pipeline = self.ctl.pipeline;
        let mut pool = WorkerPool::spawn(
            pipeline.config.concurrency,
            pipeline.executor.clone(),
            pipeline.gate.clone(),
        );
        let result = match self.dispatch_restored_reviews(&pool).await {
            Ok(()) => self.drive_pool(&mut pool).await,
            Err(e) => Err(e),
        };
        pool.shutdown().await;
        result
    }

    /// Send artifacts that were produced but never judged back to review.
    async fn dispatch_restored_reviews(
        &mut self,
        pool: &WorkerPool,
    ) -> Result<(), PipelineError> {
        let restored: Vec<(u32, Artifact)> = self
            .segments
            .iter()
            .filter(|(o, p)| p.state == SegmentState::Reviewing && !self.in_flight.contains(*o))
            .filter_map(|(o, p)| p.candidate.clone().map(|a| (*o, a)))
            .collect();
        if restored.is_empty() {
            return Ok(());
        }
        if self.escalated.is_empty() && self.ctl.state != PipelineState::Reviewing {
            self.ctl.transition(PipelineState::Generating).await?;
            self.ctl.transition(PipelineState::Reviewing).await?;
        }

        for (ordinal, artifact) in restored {
            let Some(spec) = self.plan.segment(ordinal).cloned() else {
                continue;
            };
            info!(
                "Reviewing segment {} attempt {} produced before the restart",
                ordinal, artifact.attempt
            );
            let cause = self.segments.get(&ordinal).and_then(|p| p.candidate_seq);
            let ctx = self.generation_context(&spec, artifact.attempt, Vec::new(), cause);
            let job = SegmentJob {
                spec,
                ctx,
                cancel: self.ctl.cancel.child_token(),
                candidate: Some(artifact),
            };
            if pool.submit(job).is_err() {
                let blocking = self.unaccepted();
                return self
                    .ctl
                    .fail("worker pool is closed".to_string(), blocking)
                    .await;
            }
            self.in_flight.insert(ordinal);
        }
        Ok(())
    }

    fn generation_context(
        &self,
        spec: &SegmentSpec,
        attempt: u32,
        feedback: Vec<Feedback>,
        caused_by_seq: Option<u64>,
    ) -> GenerationContext {
        let continuity: BTreeMap<u32, String> = spec
            .depends_on
            .iter()
            .filter_map(|d| {
                self.segments
                    .get(d)
                    .and_then(|p| p.accepted.as_ref())
                    .map(|a| (*d, a.content_ref.clone()))
            })
            .collect();
        let reference_asset = spec
            .reference_asset
            .as_deref()
            .and_then(|id| self.ctl.task.request.asset(id))
            .cloned();
        GenerationContext {
            task_id: self.ctl.task.id.clone(),
            plan_revision: self.plan.revision,
            attempt,
            style: self.ctl.task.request.style.clone(),
            aspect_ratio: self.ctl.task.request.aspect_ratio.clone(),
            continuity,
            reference_asset,
            feedback,
            caused_by_seq,
        }
    }

    async fn drive_pool(&mut self, pool: &mut WorkerPool) -> Result<(), PipelineError> {
        loop {
            if self.ctl.cancel.is_cancelled() {
                return self.ctl.cancel_task().await;
            }

            if !self.escalated.is_empty() {
                self.ctl.transition(PipelineState::Replanning).await?;
                if self.in_flight.is_empty() {
                    if !self.replan().await? {
                        return Ok(());
                    }
                    continue;
                }
                debug!(
                    "Draining {} in-flight segments before replanning",
                    self.in_flight.len()
                );
            } else {
                if self.all_accepted() {
                    return self.assemble().await;
                }
                self.dispatch_ready(pool).await?;
                if self.in_flight.is_empty() {
                    let blocking = self.unaccepted();
                    let error = format!("no segment can be scheduled; waiting on {blocking:?}");
                    return self.ctl.fail(error, blocking).await;
                }
            }

            let event = tokio::select! {
                _ = self.ctl.cancel.cancelled() => None,
                event = pool.next_event() => Some(event),
            };
            let Some(event) = event else {
                continue;
            };
            let Some(event) = event else {
                let blocking = self.unaccepted();
                return self
                    .ctl
                    .fail("worker pool stopped unexpectedly".to_string(), blocking)
                    .await;
            };
            match event {
                WorkerEvent::Generated {
                    ordinal,
                    attempt,
                    outcome,
                } => self.on_generated(ordinal, attempt, outcome).await?,
                WorkerEvent::Reviewed {
                    ordinal,
                    attempt,
                    outcome,
                } => self.on_reviewed(ordinal, attempt, outcome).await?,
            }
        }
    }

    /// Queue every waiting segment whose continuity dependencies are accepted.
    async fn dispatch_ready(&mut self, pool: &WorkerPool) -> Result<(), PipelineError> {
        let ready: Vec<u32> = self
            .plan
            .segments
            .iter()
            .filter(|s| {
                self.segments
                    .get(&s.ordinal)
                    .is_some_and(|p| p.state == SegmentState::Waiting)
            })
            .filter(|s| s.depends_on.iter().all(|d| self.is_accepted(*d)))
            .map(|s| s.ordinal)
            .collect();
        if ready.is_empty() {
            return Ok(());
        }
        self.ctl.transition(PipelineState::Generating).await?;

        for ordinal in ready {
            let Some(spec) = self.plan.segment(ordinal).cloned() else {
                continue;
            };
            let Some(progress) = self.segments.get_mut(&ordinal) else {
                continue;
            };
            progress.attempts += 1;
            progress.total_attempts += 1;
            progress.state = SegmentState::Generating;
            let attempt = progress.attempts;
            let feedback = progress.feedback.clone();

            let dispatch = Dispatch {
                ordinal,
                plan_revision: self.plan.revision,
                attempt,
            };
            let seq = self
                .ctl
                .store
                .append(EntryKind::SegmentDispatched, &dispatch, None)
                .await?;
            if let Some(progress) = self.segments.get_mut(&ordinal) {
                progress.dispatch_seq = Some(seq);
            }

            let ctx = self.generation_context(&spec, attempt, feedback, Some(seq));
            debug!(
                "Dispatching segment {} attempt {} (revision {})",
                ordinal, attempt, self.plan.revision
            );
            let job = SegmentJob {
                spec,
                ctx,
                cancel: self.ctl.cancel.child_token(),
                candidate: None,
            };
            if pool.submit(job).is_err() {
                let blocking = self.unaccepted();
                return self
                    .ctl
                    .fail("worker pool is closed".to_string(), blocking)
                    .await;
            }
            self.in_flight.insert(ordinal);
        }
        Ok(())
    }

    async fn on_generated(
        &mut self,
        ordinal: u32,
        attempt: u32,
        outcome: GenerationOutcome,
    ) -> Result<(), PipelineError> {
        let cause = self.segments.get(&ordinal).and_then(|p| p.dispatch_seq);
        let last = self
            .ctl
            .record_invocations(Some(ordinal), outcome.invocations, cause)
            .await?;

        match outcome.artifact {
            Ok(artifact) => {
                let seq = self
                    .ctl
                    .store
                    .append(EntryKind::ArtifactProduced, &artifact, last)
                    .await?;
                if let Some(progress) = self.segments.get_mut(&ordinal) {
                    progress.state = SegmentState::Reviewing;
                    progress.candidate = Some(artifact);
                    progress.candidate_seq = Some(seq);
                }
                if self.ctl.state == PipelineState::Generating {
                    self.ctl.transition(PipelineState::Reviewing).await?;
                }
            }
            Err(failure) => {
                self.in_flight.remove(&ordinal);
                if failure.is_canceled() {
                    return Ok(());
                }
                self.surface_failure(ordinal, attempt, failure, last).await?;
            }
        }
        Ok(())
    }

    async fn on_reviewed(
        &mut self,
        ordinal: u32,
        attempt: u32,
        outcome: GateOutcome,
    ) -> Result<(), PipelineError> {
        self.in_flight.remove(&ordinal);
        let cause = self.segments.get(&ordinal).and_then(|p| p.candidate_seq);
        let last = self
            .ctl
            .record_invocations(Some(ordinal), outcome.invocations, cause)
            .await?;
        let revision = self.plan.revision;
        let max_attempts = self.ctl.pipeline.config.max_verify_retries;

        match outcome.verdict {
            Err(failure) if failure.is_canceled() => Ok(()),
            Err(failure) => self.surface_failure(ordinal, attempt, failure, last).await,
            Ok(GateVerdict::Accepted) => {
                let record = VerdictRecord {
                    ordinal,
                    plan_revision: revision,
                    attempt,
                    verdict: Verdict::Accepted,
                    feedback: None,
                };
                self.ctl
                    .store
                    .append(EntryKind::ArtifactVerdict, &record, last)
                    .await?;
                if let Some(progress) = self.segments.get_mut(&ordinal) {
                    progress.accepted = progress.candidate.take().map(|mut a| {
                        a.verdict = Verdict::Accepted;
                        a
                    });
                    progress.state = SegmentState::Accepted;
                }
                Ok(())
            }
            Ok(GateVerdict::Rejected(feedback)) => {
                let record = VerdictRecord {
                    ordinal,
                    plan_revision: revision,
                    attempt,
                    verdict: Verdict::Rejected,
                    feedback: Some(feedback.clone()),
                };
                self.ctl
                    .store
                    .append(EntryKind::ArtifactVerdict, &record, last)
                    .await?;
                let Some(progress) = self.segments.get_mut(&ordinal) else {
                    return Ok(());
                };
                progress.candidate = None;
                progress.feedback.push(feedback);
                if progress.attempts < max_attempts {
                    progress.state = SegmentState::Waiting;
                    info!(
                        "Regenerating segment {} ({} of {} attempts used)",
                        ordinal, progress.attempts, max_attempts
                    );
                } else {
                    progress.state = SegmentState::Exhausted;
                    warn!(
                        "Segment {} rejected {} times, escalating",
                        ordinal, progress.attempts
                    );
                    self.escalated.insert(ordinal);
                }
                Ok(())
            }
        }
    }

    async fn surface_failure(
        &mut self,
        ordinal: u32,
        attempt: u32,
        failure: ToolFailure,
        cause: Option<u64>,
    ) -> Result<(), PipelineError> {
        warn!("Segment {} attempt {} failed: {}", ordinal, attempt, failure);
        let record = SegmentFailure {
            ordinal,
            plan_revision: self.plan.revision,
            attempt,
            failure: failure.clone(),
        };
        self.ctl
            .store
            .append(EntryKind::SegmentFailed, &record, cause)
            .await?;
        if let Some(progress) = self.segments.get_mut(&ordinal) {
            progress.state = SegmentState::Failed;
            progress.failure = Some(failure);
            progress.candidate = None;
        }
        self.escalated.insert(ordinal);
        Ok(())
    }

    /// Feedback the planner sees for an escalated segment, including the
    /// tool failure that stopped it.
    fn planner_feedback(&self, ordinal: u32) -> Vec<Feedback> {
        let Some(progress) = self.segments.get(&ordinal) else {
            return Vec::new();
        };
        let mut feedback = progress.feedback.clone();
        if let Some(failure) = &progress.failure {
            feedback.push(Feedback {
                rejections: vec![Rejection {
                    tool: failure.tool().unwrap_or("pipeline").to_string(),
                    reason: failure.to_string(),
                    details: Value::Null,
                }],
            });
        }
        feedback
    }

    fn describe_blocking(&self, ordinals: &BTreeSet<u32>) -> String {
        ordinals
            .iter()
            .map(|o| match self.segments.get(o) {
                Some(p) if p.state == SegmentState::Exhausted => format!(
                    "segment {o} rejected {} times ({})",
                    p.attempts,
                    p.feedback.last().map(|f| f.summary()).unwrap_or_default()
                ),
                Some(p) => match &p.failure {
                    Some(failure) => format!("segment {o}: {failure}"),
                    None => format!("segment {o} not accepted"),
                },
                None => format!("segment {o} not accepted"),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Ask the planner to rewrite the escalated segments. Returns `false` when
    /// the task has reached a terminal state instead.
    async fn replan(&mut self) -> Result<bool, PipelineError> {
        let affected = std::mem::take(&mut self.escalated);
        let max_replans = self.ctl.pipeline.config.max_replans;
        if self.replans >= max_replans {
            let error = format!(
                "replan limit of {} reached: {}",
                max_replans,
                self.describe_blocking(&affected)
            );
            self.ctl.fail(error, affected.into_iter().collect()).await?;
            return Ok(false);
        }

        self.replans += 1;
        let request = ReplanRequest {
            prior_revision: self.plan.revision,
            affected: affected.clone(),
            replan_number: self.replans,
        };
        let seq = self
            .ctl
            .store
            .append(EntryKind::ReplanRequested, &request, None)
            .await?;
        info!(
            "Replanning task {} ({} of {}): segments {:?}",
            self.ctl.task.id, self.replans, max_replans, affected
        );

        let feedback: BTreeMap<u32, Vec<Feedback>> = affected
            .iter()
            .map(|o| (*o, self.planner_feedback(*o)))
            .collect();
        let outcome = self
            .ctl
            .pipeline
            .planner
            .replan(&self.ctl.task, &self.plan, &affected, &feedback, &self.ctl.cancel)
            .await;
        self.ctl
            .record_invocations(None, outcome.invocations, Some(seq))
            .await?;

        let plan = match outcome.plan {
            Ok(plan) => plan,
            Err(_) if self.ctl.cancel.is_cancelled() => {
                self.ctl.cancel_task().await?;
                return Ok(false);
            }
            Err(e) => {
                self.ctl
                    .fail(format!("replanning failed: {e}"), affected.into_iter().collect())
                    .await?;
                return Ok(false);
            }
        };
        let plan_seq = self
            .ctl
            .store
            .append(EntryKind::PlanAccepted, &plan, Some(seq))
            .await?;
        self.apply_revision(plan, &affected, plan_seq).await?;
        Ok(true)
    }

    /// Switch to a new plan revision. Replaced segments and everything that
    /// transitively depends on them lose their accepted artifact; every
    /// segment still to be produced starts with a fresh attempt counter.
    async fn apply_revision(
        &mut self,
        plan: ScriptPlan,
        affected: &BTreeSet<u32>,
        cause: u64,
    ) -> Result<(), PipelineError> {
        let prior = std::mem::replace(&mut self.plan, plan);

        let mut replaced = affected.clone();
        for seg in &self.plan.segments {
            if prior.segment(seg.ordinal) != Some(seg) {
                replaced.insert(seg.ordinal);
            }
        }
        let removed: Vec<u32> = prior
            .ordinals()
            .into_iter()
            .filter(|o| self.plan.segment(*o).is_none())
            .collect();
        replaced.extend(removed.iter().copied());

        let mut invalid = self.plan.transitive_dependents(&replaced);
        invalid.extend(prior.transitive_dependents(&replaced));
        invalid.extend(replaced.iter().copied());

        let revision = self.plan.revision;
        for ordinal in removed {
            self.segments.remove(&ordinal);
        }
        for ordinal in self.plan.ordinals() {
            let progress = self
                .segments
                .entry(ordinal)
                .or_insert_with(SegmentProgress::waiting);
            progress.attempts = 0;
            if invalid.contains(&ordinal) {
                let was_accepted = progress.accepted.take().is_some();
                progress.state = SegmentState::Waiting;
                progress.failure = None;
                progress.candidate = None;
                if was_accepted {
                    let reason = if replaced.contains(&ordinal) {
                        format!("segment rewritten in revision {revision}")
                    } else {
                        "depends on a rewritten segment".to_string()
                    };
                    info!("Invalidating accepted segment {}: {}", ordinal, reason);
                    let invalidation = Invalidation {
                        ordinal,
                        plan_revision: revision,
                        reason,
                    };
                    self.ctl
                        .store
                        .append(EntryKind::SegmentInvalidated, &invalidation, Some(cause))
                        .await?;
                }
            } else if progress.state != SegmentState::Accepted {
                progress.state = SegmentState::Waiting;
                progress.failure = None;
                progress.candidate = None;
            }
        }
        Ok(())
    }

    async fn assemble(&mut self) -> Result<(), PipelineError> {
        // A revision that only drops segments leaves nothing to generate.
        if self.ctl.state == PipelineState::Replanning {
            self.ctl.transition(PipelineState::Generating).await?;
        }
        if self.ctl.state == PipelineState::Generating {
            self.ctl.transition(PipelineState::Reviewing).await?;
        }
        self.ctl.transition(PipelineState::Assembling).await?;

        let accepted: Vec<Artifact> = self
            .segments
            .values()
            .filter_map(|p| p.accepted.clone())
            .collect();
        let context = TaskContextRef {
            task_id: self.ctl.task.id.clone(),
            caused_by_seq: self.ctl.store.last_seq(),
        };
        let pipeline = self.ctl.pipeline;
        let outcome = pipeline
            .assembler
            .assemble(
                &accepted,
                &self.plan,
                &self.ctl.task.request.aspect_ratio,
                &context,
                &self.ctl.cancel,
            )
            .await;
        let last = self
            .ctl
            .record_invocations(None, outcome.invocations, context.caused_by_seq)
            .await?;

        match outcome.result {
            Ok(video) => {
                let record = AssemblyRecord {
                    video: video.clone(),
                    ordinals: outcome
                        .manifest
                        .map(|m| m.ordinals())
                        .unwrap_or_default(),
                };
                self.ctl
                    .store
                    .append(EntryKind::TaskAssembled, &record, last)
                    .await?;
                info!("Task {} rendered to {}", self.ctl.task.id, video.uri);
                self.ctl.final_video = Some(video);
                self.ctl.transition(PipelineState::Done).await
            }
            Err(_) if self.ctl.cancel.is_cancelled() => self.ctl.cancel_task().await,
            Err(e) => self.ctl.fail(format!("assembly failed: {e}"), Vec::new()).await,
        }
    }

    fn report(&self) -> TaskReport {
        let segments = self
            .plan
            .segments
            .iter()
            .map(|s| {
                let progress = self.segments.get(&s.ordinal);
                let (outcome, detail) = match progress {
                    None => (SegmentOutcome::NeverAttempted, None),
                    Some(p) => match p.state {
                        SegmentState::Accepted => (SegmentOutcome::Accepted, None),
                        SegmentState::Exhausted => (
                            SegmentOutcome::ExhaustedRetries,
                            p.feedback.last().map(|f| f.summary()),
                        ),
                        SegmentState::Failed => {
                            (SegmentOutcome::Failed, p.failure.as_ref().map(|f| f.to_string()))
                        }
                        _ if p.total_attempts == 0 => (SegmentOutcome::NeverAttempted, None),
                        _ => (SegmentOutcome::Pending, None),
                    },
                };
                SegmentReport {
                    ordinal: s.ordinal,
                    outcome,
                    attempts: progress.map(|p| p.total_attempts).unwrap_or(0),
                    detail,
                }
            })
            .collect();

        TaskReport {
            task_id: self.ctl.task.id.clone(),
            status: self.ctl.task.status,
            state: self.ctl.state,
            plan_revision: Some(self.plan.revision),
            replans: self.replans,
            segments,
            blocking: self.ctl.blocking.clone(),
            final_video: self.ctl.final_video.clone(),
            error: self.ctl.error.clone(),
        }
    }

    fn finish(self) -> TaskRun {
        let report = self.report();
        TaskRun {
            report,
            store: self.ctl.store,
        }
    }
}

#[cfg(test)]
mod tests;
