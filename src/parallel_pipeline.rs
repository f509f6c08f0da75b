// THEORY:
// The `WorkerPool` runs artifact construction for many records at once. Tasks go
// into one shared queue; a fixed number of async workers take from it, run the
// CPU-heavy build on tokio's blocking threads, route the outcome to the
// `ErrorSink` or the `Partitioner`, and answer the submitter through a oneshot
// channel.
//
// Key architectural principles:
// 1.  **Shared queue, not round robin**: a slide can take seconds or minutes, so
//     a worker that finishes early takes the next task instead of waiting for
//     its turn in a fixed rotation.
// 2.  **Per-record boundary**: nothing a build does can fail the pool. Errors,
//     and even a panicking build, become an `ErrorRecord`; the worker moves on.
// 3.  **Exactly one outcome**: every task sends one `BuildStatus` and records
//     exactly one of {artifact partitioned, error recorded}.

use crate::core_modules::artifact_cache::ArtifactCache;
use crate::core_modules::error_sink::ErrorSink;
use crate::core_modules::partitioner::Partitioner;
use crate::core_modules::record::ImageRecord;
use crate::error::{ErrorKind, RecordError};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

/// One record to build, with its manifest position.
pub struct BuildTask {
    pub index: usize,
    pub record: ImageRecord,
    pub result_sender: oneshot::Sender<BuildStatus>,
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Built,
    Failed(ErrorKind),
}

/// The state every worker shares.
#[derive(Clone)]
pub struct PoolContext {
    pub cache: Arc<ArtifactCache>,
    pub sink: Arc<ErrorSink>,
    pub partitioner: Arc<Partitioner>,
}

pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<BuildTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, context: PoolContext) -> Self {
        let (task_sender, task_receiver) = mpsc::unbounded_channel::<BuildTask>();
        let task_receiver = Arc::new(Mutex::new(task_receiver));

        let workers = (0..size.max(1))
            .map(|worker_id| {
                let receiver = task_receiver.clone();
                let context = context.clone();
                tokio::spawn(async move {
                    loop {
                        // The queue lock is held only while waiting for the next task.
                        let task = receiver.lock().await.recv().await;
                        let Some(task) = task else { break };
                        let status =
                            Self::process_record_worker(&context, task.index, task.record).await;
                        let _ = task.result_sender.send(status);
                    }
                    debug!("Worker {} stopped", worker_id);
                })
            })
            .collect();

        info!("Started worker pool with {} workers", size.max(1));
        Self {
            task_sender,
            workers,
        }
    }

    async fn process_record_worker(
        context: &PoolContext,
        index: usize,
        record: ImageRecord,
    ) -> BuildStatus {
        let key = record.identity_key();
        let cache = context.cache.clone();
        let build_record = record.clone();
        let outcome = tokio::task::spawn_blocking(move || cache.get_or_build(&build_record))
            .await
            .unwrap_or_else(|join_error| {
                Err(RecordError::Internal {
                    detail: join_error.to_string(),
                })
            });

        match outcome {
            Ok(entry) => {
                context.partitioner.insert(index, &record, entry);
                BuildStatus::Built
            }
            Err(error) => {
                let kind = error.kind();
                context.sink.record_failure(key, &error);
                BuildStatus::Failed(kind)
            }
        }
    }

    /// Queues a record; the returned receiver resolves once it has been handled.
    pub fn submit(
        &self,
        index: usize,
        record: ImageRecord,
    ) -> Result<oneshot::Receiver<BuildStatus>, ImageRecord> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.task_sender
            .send(BuildTask {
                index,
                record,
                result_sender,
            })
            .map_err(|rejected| rejected.0.record)?;
        Ok(result_receiver)
    }

    /// Closes the queue and waits for every worker to drain it.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        for worker in futures::future::join_all(self.workers).await {
            if let Err(err) = worker {
                warn!("Worker ended abnormally: {}", err);
            }
        }
    }
}
