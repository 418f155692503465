use crate::{
    channel::{Messenger, ReplyCollector},
    models::{ApiError, InboundMessage},
    pipeline::{Pipeline, PipelineOutcome},
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a finished pollable job stays readable.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Background worker that feeds inbound messages through the pipeline one at
/// a time. Only jobs a caller can poll get a status entry.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<StatusBoard>>,
}

struct Job {
    /// Set for pollable jobs, which also buffer their replies.
    id: Option<Uuid>,
    message: InboundMessage,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        outcome: PipelineOutcome,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        replies: Vec<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

struct StatusBoard {
    entries: HashMap<Uuid, (JobState, Option<Instant>)>,
    retention: Duration,
}

impl StatusBoard {
    fn set(&mut self, id: Uuid, state: JobState) {
        let finished = matches!(state, JobState::Completed { .. }).then(Instant::now);
        self.entries.insert(id, (state, finished));
    }

    fn prune(&mut self) {
        let retention = self.retention;
        self.entries.retain(|_, (_, finished)| {
            finished.is_none_or(|at| at.elapsed() < retention)
        });
    }
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline, capacity: usize) -> (Self, JoinHandle<()>) {
        Self::spawn_with_retention(pipeline, capacity, COMPLETED_RETENTION)
    }

    pub fn spawn_with_retention(
        pipeline: Pipeline,
        capacity: usize,
        retention: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(StatusBoard {
            entries: HashMap::new(),
            retention,
        }));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Some(id) = job.id else {
                    let outcome = pipeline.handle(job.message).await;
                    debug!(target = "konnect.jobs", outcome = outcome.code(), "message_processed");
                    continue;
                };

                statuses_bg.lock().await.set(id, JobState::Running);
                let collector = ReplyCollector::new();
                let messenger: Arc<dyn Messenger> = Arc::new(collector.clone());
                let outcome = pipeline.handle_with(job.message, messenger).await;
                let replies = collector.take().await;
                debug!(
                    target = "konnect.jobs",
                    job_id = %id,
                    outcome = outcome.code(),
                    "job_completed"
                );

                let mut board = statuses_bg.lock().await;
                board.prune();
                board.set(id, JobState::Completed { outcome, replies });
            }
        });

        (Self { tx, statuses }, handle)
    }

    /// Queues a message whose replies go out through the pipeline's
    /// messenger. Nothing is kept once it is processed.
    pub async fn enqueue(&self, message: InboundMessage) -> Result<(), ApiError> {
        self.send(Job { id: None, message }).await
    }

    /// Queues a message whose replies are kept on the job for the caller to
    /// fetch and deliver.
    pub async fn enqueue_collecting(&self, message: InboundMessage) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut board = self.statuses.lock().await;
            board.prune();
            board.set(id, JobState::Queued);
        }
        if let Err(err) = self.send(Job { id: Some(id), message }).await {
            self.statuses.lock().await.entries.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    async fn send(&self, job: Job) -> Result<(), ApiError> {
        self.tx.send(job).await.map_err(|_| {
            warn!(target = "konnect.jobs", "queue_send_failed");
            ApiError::new("queue_send_failed", "worker not available")
        })
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let mut board = self.statuses.lock().await;
        board.prune();
        board.entries.get(&id).map(|(state, _)| JobInfo {
            id: id.to_string(),
            state: state.clone(),
        })
    }

    #[cfg(test)]
    async fn tracked_jobs(&self) -> usize {
        self.statuses.lock().await.entries.len()
    }
}
