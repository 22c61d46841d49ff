use serde::Serialize;
use tracing::{info, warn};

use crate::dataset::Dataset;
use crate::domain::{Batch, FailurePolicy, SourceLocation};
use crate::error::IngestError;
use crate::normalize::SchemaNormalizer;
use crate::pool::WorkerPool;

#[derive(Debug)]
pub enum TaskOutcome {
    Normalized {
        location: SourceLocation,
        dataset: Dataset,
        attempts: u32,
    },
    Failed {
        location: SourceLocation,
        error: IngestError,
        attempts: u32,
    },
}

impl TaskOutcome {
    pub fn location(&self) -> &SourceLocation {
        match self {
            TaskOutcome::Normalized { location, .. } | TaskOutcome::Failed { location, .. } => {
                location
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Normalized { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub batch: usize,
    pub location: String,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug)]
pub struct BatchOutcomes {
    pub batch: usize,
    pub outcomes: Vec<TaskOutcome>,
}

impl BatchOutcomes {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                TaskOutcome::Failed {
                    location,
                    error,
                    attempts,
                } => Some(TaskFailure {
                    batch: self.batch,
                    location: location.to_string(),
                    attempts: *attempts,
                    reason: error.to_string(),
                }),
                TaskOutcome::Normalized { .. } => None,
            })
            .collect()
    }

    pub fn into_datasets(self) -> Vec<(SourceLocation, Dataset)> {
        self.outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                TaskOutcome::Normalized {
                    location, dataset, ..
                } => Some((location, dataset)),
                TaskOutcome::Failed { .. } => None,
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    normalizer: SchemaNormalizer,
    policy: FailurePolicy,
}

impl TaskExecutor {
    pub fn new(normalizer: SchemaNormalizer, policy: FailurePolicy) -> Self {
        Self { normalizer, policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Under [`FailurePolicy::FailFast`] the first permanent failure cancels
    /// the remaining work and is returned as [`IngestError::TaskFailed`].
    pub fn execute(&self, pool: &WorkerPool, batch: &Batch) -> Result<BatchOutcomes, IngestError> {
        let handles: Vec<_> = batch
            .locations
            .iter()
            .map(|location| {
                let normalizer = self.normalizer.clone();
                let location = location.clone();
                pool.submit(move || normalizer.normalize(&location))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (location, handle) in batch.locations.iter().zip(handles) {
            let report = handle.wait();
            match report.result {
                Ok(dataset) => outcomes.push(TaskOutcome::Normalized {
                    location: location.clone(),
                    dataset,
                    attempts: report.attempts,
                }),
                Err(error) => {
                    warn!(
                        batch = batch.index,
                        %location,
                        attempts = report.attempts,
                        %error,
                        "source failed permanently"
                    );
                    if self.policy == FailurePolicy::FailFast {
                        pool.cancel();
                        return Err(IngestError::TaskFailed {
                            batch: batch.index,
                            location: location.to_string(),
                            attempts: report.attempts,
                            reason: error.to_string(),
                        });
                    }
                    outcomes.push(TaskOutcome::Failed {
                        location: location.clone(),
                        error,
                        attempts: report.attempts,
                    });
                }
            }
        }

        let result = BatchOutcomes {
            batch: batch.index,
            outcomes,
        };
        info!(
            batch = batch.index,
            succeeded = result.success_count(),
            failed = result.outcomes.len() - result.success_count(),
            "batch tasks resolved"
        );
        Ok(result)
    }
}
