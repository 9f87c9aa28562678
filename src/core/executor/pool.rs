use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{GenerationContext, GenerationExecutor, GenerationOutcome};
use crate::core::quality::{GateOutcome, QualityGate};
use crate::core::types::{Artifact, SegmentSpec};

/// One generation attempt for one segment, reviewed once it produces an artifact.
///
/// With `candidate` set the attempt already produced that artifact (a resumed
/// task) and the worker only reviews it.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub spec: SegmentSpec,
    pub ctx: GenerationContext,
    pub cancel: CancellationToken,
    pub candidate: Option<Artifact>,
}

#[derive(Debug)]
pub enum WorkerEvent {
    Generated {
        ordinal: u32,
        attempt: u32,
        outcome: GenerationOutcome,
    },
    Reviewed {
        ordinal: u32,
        attempt: u32,
        outcome: GateOutcome,
    },
}

/// Fixed set of workers pulling segment jobs from a shared queue.
///
/// A worker sends `Generated` before it starts reviewing, so the controller
/// always sees an artifact before its verdict.
pub struct WorkerPool {
    jobs: Option<mpsc::UnboundedSender<SegmentJob>>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    workers: JoinSet<()>,
}

impl WorkerPool {
    pub fn spawn(
        concurrency: usize,
        executor: Arc<GenerationExecutor>,
        gate: Arc<QualityGate>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel::<SegmentJob>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency.max(1) {
            workers.spawn(worker_loop(
                worker_id,
                job_rx.clone(),
                event_tx.clone(),
                executor.clone(),
                gate.clone(),
            ));
        }

        Self {
            jobs: Some(job_tx),
            events: event_rx,
            workers,
        }
    }

    /// Queue a job. Returns it back if the pool has shut down.
    pub fn submit(&self, job: SegmentJob) -> Result<(), SegmentJob> {
        match &self.jobs {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Stop accepting jobs and abort whatever is still running.
    pub async fn shutdown(mut self) {
        self.jobs.take();
        self.workers.shutdown().await;
    }
}

async fn worker_loop(
    worker_id: usize,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<SegmentJob>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    executor: Arc<GenerationExecutor>,
    gate: Arc<QualityGate>,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            debug!("Worker {} stopping: job queue closed", worker_id);
            return;
        };

        let ordinal = job.spec.ordinal;
        let attempt = job.ctx.attempt;
        debug!("Worker {} picked segment {} attempt {}", worker_id, ordinal, attempt);

        let artifact = match job.candidate {
            Some(candidate) => {
                debug!("Worker {} reviewing restored segment {}", worker_id, ordinal);
                candidate
            }
            None => {
                let outcome = executor.generate(&job.spec, &job.ctx, &job.cancel).await;
                let artifact = outcome.artifact.clone().ok();
                if events
                    .send(WorkerEvent::Generated {
                        ordinal,
                        attempt,
                        outcome,
                    })
                    .is_err()
                {
                    return;
                }
                let Some(artifact) = artifact else {
                    continue;
                };
                artifact
            }
        };
        if job.cancel.is_cancelled() {
            continue;
        }
        let outcome = gate.verify(&artifact, &job.spec, &job.ctx, &job.cancel).await;
        if events
            .send(WorkerEvent::Reviewed {
                ordinal,
                attempt,
                outcome,
            })
            .is_err()
        {
            return;
        }
    }
}
