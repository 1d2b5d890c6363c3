// Bounded worker pool - one blocking unit of work per partition
//
// Concurrency is capped by a semaphore; each unit runs on its own blocking
// thread because the store calls are synchronous. The pool lives for one
// run: execute() returns only after every worker has been joined.

use crate::error::{BatchError, Result};
use crate::partition::PartitionDescriptor;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Result of one partition's unit of work
#[derive(Debug)]
pub struct PartitionOutcome<T> {
    pub partition: PartitionDescriptor,
    pub result: Result<T>,
}

impl<T> PartitionOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct WorkerPool {
    workers: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `work` once per partition with at most `workers` in flight.
    ///
    /// Outcomes come back in partition order. A failing or panicking unit
    /// only produces a failed outcome for its own partition.
    pub async fn execute<T, F>(
        &self,
        partitions: Vec<PartitionDescriptor>,
        work: F,
    ) -> Vec<PartitionOutcome<T>>
    where
        T: Send + 'static,
        F: Fn(PartitionDescriptor) -> Result<T> + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut handles: Vec<(PartitionDescriptor, JoinHandle<Result<T>>)> =
            Vec::with_capacity(partitions.len());

        for partition in partitions {
            let semaphore = Arc::clone(&self.semaphore);
            let work = Arc::clone(&work);

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    BatchError::WorkerAborted {
                        min_key: partition.min_key,
                        max_key: partition.max_key,
                        reason: format!("worker pool closed: {e}"),
                    }
                })?;

                tracing::debug!(partition = %partition, "Worker started");

                match tokio::task::spawn_blocking(move || work(partition)).await {
                    Ok(result) => result,
                    Err(e) => Err(BatchError::WorkerAborted {
                        min_key: partition.min_key,
                        max_key: partition.max_key,
                        reason: e.to_string(),
                    }),
                }
            });

            handles.push((partition, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (partition, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(BatchError::WorkerAborted {
                    min_key: partition.min_key,
                    max_key: partition.max_key,
                    reason: e.to_string(),
                }),
            };

            if let Err(e) = &result {
                tracing::warn!(partition = %partition, error = %e, "Partition failed");
            }

            outcomes.push(PartitionOutcome { partition, result });
        }

        outcomes
    }
}
